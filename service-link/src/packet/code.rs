//! Single opcode byte

use super::read_some;
use crate::error::Result;
use std::io::Read;

/// One-byte buffer holding the next opcode
#[derive(Debug, Default)]
pub struct CodePacket {
    buf: [u8; 1],
    filled: bool,
}

impl CodePacket {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the opcode byte; true once it is available
    pub fn read<R: Read + ?Sized>(&mut self, src: &mut R) -> Result<bool> {
        if !self.filled {
            self.filled = read_some(src, &mut self.buf)?.is_some();
        }
        Ok(self.filled)
    }

    /// Raw opcode byte (only meaningful after `read` returned true)
    pub fn code(&self) -> u8 {
        self.buf[0]
    }

    pub fn is_complete(&self) -> bool {
        self.filled
    }

    pub fn clear(&mut self) {
        self.filled = false;
    }
}
