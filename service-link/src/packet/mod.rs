//! Incremental wire packet parsers
//!
//! Each parser keeps its partial state between calls so it can be driven by a
//! non-blocking socket: `read` returns `Ok(false)` when the source has no more
//! bytes yet and `Ok(true)` once the packet is complete.

mod code;
mod tcp;
mod udp;

pub use code::CodePacket;
pub use tcp::TcpDataPacket;
pub use udp::UdpPacket;

use crate::error::{Error, Result};
use std::io::{ErrorKind, Read};

/// One read from a possibly non-blocking source
///
/// `None` means no bytes are available right now (would block or read timeout);
/// end of stream is reported as `Error::Disconnected`.
pub(crate) fn read_some<R: Read + ?Sized>(src: &mut R, buf: &mut [u8]) -> Result<Option<usize>> {
    loop {
        match src.read(buf) {
            Ok(0) if !buf.is_empty() => return Err(Error::Disconnected),
            Ok(n) => return Ok(Some(n)),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if is_would_block(&e) => return Ok(None),
            Err(e) => return Err(Error::Io(e)),
        }
    }
}

/// Would-block and read-timeout are reported differently per platform
pub(crate) fn is_would_block(e: &std::io::Error) -> bool {
    matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

#[cfg(test)]
pub(crate) mod test_util {
    use std::collections::VecDeque;
    use std::io::{ErrorKind, Read};

    /// Reader that hands out scripted chunks, returning `WouldBlock` between them
    pub struct ChunkedReader {
        chunks: VecDeque<Vec<u8>>,
        block_next: bool,
        eof: bool,
    }

    impl ChunkedReader {
        pub fn new(bytes: &[u8], chunk_size: usize) -> Self {
            Self {
                chunks: bytes.chunks(chunk_size.max(1)).map(<[u8]>::to_vec).collect(),
                block_next: false,
                eof: false,
            }
        }

        /// Report EOF once the chunks run out instead of blocking
        pub fn with_eof(mut self) -> Self {
            self.eof = true;
            self
        }
    }

    impl Read for ChunkedReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.block_next {
                self.block_next = false;
                return Err(ErrorKind::WouldBlock.into());
            }
            let Some(mut chunk) = self.chunks.pop_front() else {
                return if self.eof {
                    Ok(0)
                } else {
                    Err(ErrorKind::WouldBlock.into())
                };
            };
            let n = chunk.len().min(buf.len());
            buf[..n].copy_from_slice(&chunk[..n]);
            if n < chunk.len() {
                self.chunks.push_front(chunk.split_off(n));
            }
            self.block_next = true;
            Ok(n)
        }
    }
}
