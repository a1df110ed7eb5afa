//! Length-prefixed TCP DATA frame

use super::read_some;
use crate::error::{Error, Result};
use crate::protocol::{TCP_HEADER_SIZE, TCP_READ_CHUNK};
use std::io::Read;

/// Resumable reader for the body of a TCP DATA frame (everything after the
/// opcode byte)
#[derive(Debug)]
pub struct TcpDataPacket {
    header: [u8; TCP_HEADER_SIZE],
    header_len: usize,
    timestamp_us: i64,
    payload: Vec<u8>,
    /// Payload size once the header is parsed
    size: Option<usize>,
    filled: usize,
    max_frame_size: u32,
}

impl TcpDataPacket {
    pub fn new(max_frame_size: u32) -> Self {
        Self {
            header: [0; TCP_HEADER_SIZE],
            header_len: 0,
            timestamp_us: 0,
            payload: Vec::new(),
            size: None,
            filled: 0,
            max_frame_size,
        }
    }

    /// Continue reading; true once the whole payload has been copied
    pub fn read<R: Read + ?Sized>(&mut self, src: &mut R) -> Result<bool> {
        let size = match self.size {
            Some(size) => size,
            None => {
                while self.header_len < TCP_HEADER_SIZE {
                    match read_some(src, &mut self.header[self.header_len..])? {
                        Some(n) => self.header_len += n,
                        None => return Ok(false),
                    }
                }
                self.parse_header()?
            }
        };

        while self.filled < size {
            let end = (self.filled + TCP_READ_CHUNK).min(size);
            match read_some(src, &mut self.payload[self.filled..end])? {
                Some(n) => self.filled += n,
                None => return Ok(false),
            }
        }
        Ok(true)
    }

    fn parse_header(&mut self) -> Result<usize> {
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&self.header[0..8]);
        let mut len = [0u8; 4];
        len.copy_from_slice(&self.header[8..12]);

        let length = u32::from_le_bytes(len);
        if length > self.max_frame_size {
            return Err(Error::Protocol(format!(
                "frame of {} bytes exceeds limit of {}",
                length, self.max_frame_size
            )));
        }

        let size = length as usize;
        self.timestamp_us = i64::from_le_bytes(ts);
        self.payload = vec![0; size];
        self.filled = 0;
        self.size = Some(size);
        Ok(size)
    }

    pub fn is_complete(&self) -> bool {
        self.size.is_some_and(|size| self.filled == size)
    }

    /// Hand out the completed frame and reset for the next one
    pub fn take(&mut self) -> Option<(i64, Vec<u8>)> {
        if !self.is_complete() {
            return None;
        }
        let frame = (self.timestamp_us, std::mem::take(&mut self.payload));
        self.clear();
        Some(frame)
    }

    pub fn clear(&mut self) {
        self.header_len = 0;
        self.size = None;
        self.filled = 0;
        self.payload = Vec::new();
    }
}
