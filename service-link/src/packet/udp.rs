//! Fragmented UDP datagrams
//!
//! Every datagram carries the frame's timestamp and total size next to its
//! fragment index, so the pair `(timestamp, size)` identifies the frame being
//! assembled. A datagram for a different pair discards whatever was collected
//! so far. Received indices are tracked individually: a repeated fragment is
//! ignored instead of counting towards completion. The pair of the last
//! completed frame is remembered so late copies of its fragments cannot
//! deliver it twice.

use super::is_would_block;
use crate::error::{Error, Result};
use crate::protocol::{
    Opcode, UDP_BODY_SIZE, UDP_DATAGRAM_SIZE, UDP_HEADER_SIZE, udp_fragment_count,
};
use std::net::UdpSocket;

#[derive(Debug)]
struct Frame {
    timestamp_us: i64,
    size: usize,
    payload: Vec<u8>,
    received: Vec<bool>,
    remaining: usize,
}

/// Reassembles UDP DATA frames and reports control codes
#[derive(Debug)]
pub struct UdpPacket {
    datagram: Vec<u8>,
    code: Option<Opcode>,
    frame: Option<Frame>,
    complete: bool,
    /// `(timestamp, size)` of the last completed frame
    last_complete: Option<(i64, usize)>,
    max_frame_size: u32,
}

impl UdpPacket {
    pub fn new(max_frame_size: u32) -> Self {
        Self {
            datagram: vec![0; UDP_DATAGRAM_SIZE],
            code: None,
            frame: None,
            complete: false,
            last_complete: None,
            max_frame_size,
        }
    }

    /// Receive one datagram from a connected, non-blocking socket
    ///
    /// Returns true when the datagram was a control code or finished a frame.
    pub fn read(&mut self, socket: &UdpSocket) -> Result<bool> {
        let mut datagram = std::mem::take(&mut self.datagram);
        let received = socket.recv(&mut datagram);
        let result = match received {
            Ok(n) => self.accept(&datagram[..n]),
            Err(e) if is_would_block(&e) => Ok(false),
            Err(e) => Err(Error::Io(e)),
        };
        self.datagram = datagram;
        result
    }

    /// Feed one datagram
    pub fn accept(&mut self, datagram: &[u8]) -> Result<bool> {
        let Some(&first) = datagram.first() else {
            return Ok(false);
        };
        let code = Opcode::try_from(first)?;
        self.code = Some(code);

        if code != Opcode::Data {
            return Ok(true);
        }

        if datagram.len() < UDP_HEADER_SIZE {
            log::debug!("Ignoring short UDP datagram ({} bytes)", datagram.len());
            return Ok(false);
        }

        let timestamp_us = i64::from_le_bytes(field(datagram, 1));
        let size = u32::from_le_bytes(field(datagram, 9));
        let index = u32::from_le_bytes(field(datagram, 13)) as usize;

        if size > self.max_frame_size {
            return Err(Error::Protocol(format!(
                "frame of {} bytes exceeds limit of {}",
                size, self.max_frame_size
            )));
        }
        let size = size as usize;

        if self.last_complete == Some((timestamp_us, size)) {
            log::trace!("Late fragment {} of delivered frame {}", index, timestamp_us);
            return Ok(false);
        }
        self.last_complete = None;

        let stale = self
            .frame
            .as_ref()
            .is_none_or(|f| f.timestamp_us != timestamp_us || f.size != size);
        if stale || self.complete {
            // Zero-size frames still arrive as one header-only fragment
            let fragments = udp_fragment_count(size).max(1);
            self.frame = Some(Frame {
                timestamp_us,
                size,
                payload: vec![0; size],
                received: vec![false; fragments],
                remaining: fragments,
            });
            self.complete = false;
        }

        let Some(frame) = self.frame.as_mut() else {
            return Ok(false);
        };

        if index >= frame.received.len() {
            return Err(Error::Protocol(format!(
                "fragment {} out of range for {} byte frame",
                index, size
            )));
        }
        if frame.received[index] {
            log::trace!("Duplicate fragment {} of frame {}", index, timestamp_us);
            return Ok(false);
        }

        let offset = index * UDP_BODY_SIZE;
        let expected = UDP_BODY_SIZE.min(size - offset.min(size));
        let body = &datagram[UDP_HEADER_SIZE..];
        if body.len() < expected {
            return Err(Error::Protocol(format!(
                "fragment {} truncated: {} of {} bytes",
                index,
                body.len(),
                expected
            )));
        }

        frame.payload[offset..offset + expected].copy_from_slice(&body[..expected]);
        frame.received[index] = true;
        frame.remaining -= 1;

        if frame.remaining == 0 {
            self.complete = true;
            self.last_complete = Some((timestamp_us, size));
            return Ok(true);
        }
        Ok(false)
    }

    /// Opcode of the last datagram accepted
    pub fn code(&self) -> Option<Opcode> {
        self.code
    }

    /// Drop any partial frame and forget the last delivered one
    pub fn clear(&mut self) {
        self.code = None;
        self.frame = None;
        self.complete = false;
        self.last_complete = None;
    }

    /// Hand out the completed frame
    pub fn take_frame(&mut self) -> Option<(i64, Vec<u8>)> {
        if !self.complete {
            return None;
        }
        self.complete = false;
        self.frame.take().map(|f| (f.timestamp_us, f.payload))
    }
}

fn field<const N: usize>(datagram: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&datagram[offset..offset + N]);
    out
}
