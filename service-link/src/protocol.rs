//! Service protocol opcodes, constants and frame encoders
//!
//! All multi-byte integers are little-endian.
//!
//! # Control codes
//!
//! | Opcode | Value | Payload |
//! |--------|-------|---------|
//! | GOODBYE | 0x00 | none |
//! | HEARTBEAT | 0x02 | none |
//! | SUBSCRIBE | 0x03 | service name + 0x00 |
//! | UNSUBSCRIBE | 0x04 | none |
//! | BEGIN | 0x05 | none |
//! | DATA | 0x06 | frame, see below |
//! | LISTXML | 0x11 | none, answered with DATA |
//!
//! # TCP frame
//!
//! ```text
//! ┌──────┬─────────────────┬──────────────┬──────────────┐
//! │ 0x06 │ timestamp (i64) │ length (u32) │ payload      │
//! │ 1 B  │ 8 B             │ 4 B          │ length bytes │
//! └──────┴─────────────────┴──────────────┴──────────────┘
//! ```
//!
//! # UDP datagram
//!
//! ```text
//! ┌──────┬─────────────────┬────────────┬────────────────┬──────────────┐
//! │ 0x06 │ timestamp (i64) │ size (u32) │ fragment (u32) │ body         │
//! │ 1 B  │ 8 B             │ 4 B        │ 4 B            │ up to 495 B  │
//! └──────┴─────────────────┴────────────┴────────────────┴──────────────┘
//! ```
//!
//! A frame larger than one datagram body is split into
//! `ceil(size / 495)` fragments carrying the same timestamp and size.

use crate::error::{Error, Result};
use std::fmt;

/// Default controller TCP port
pub const DEFAULT_TCP_PORT: u16 = 10001;
/// Default controller UDP port
pub const DEFAULT_UDP_PORT: u16 = 10002;

/// TCP DATA header after the opcode: timestamp + length
pub const TCP_HEADER_SIZE: usize = 12;
/// Bytes copied per read while filling a TCP payload
pub const TCP_READ_CHUNK: usize = 256;

/// Full UDP datagram size
pub const UDP_DATAGRAM_SIZE: usize = 512;
/// UDP DATA header: opcode + timestamp + size + fragment index
pub const UDP_HEADER_SIZE: usize = 17;
/// Payload bytes per UDP fragment
pub const UDP_BODY_SIZE: usize = UDP_DATAGRAM_SIZE - UDP_HEADER_SIZE;

/// Single-byte protocol tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Goodbye = 0x00,
    Heartbeat = 0x02,
    Subscribe = 0x03,
    Unsubscribe = 0x04,
    Begin = 0x05,
    Data = 0x06,
    ListXml = 0x11,
}

impl Opcode {
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for Opcode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(Opcode::Goodbye),
            0x02 => Ok(Opcode::Heartbeat),
            0x03 => Ok(Opcode::Subscribe),
            0x04 => Ok(Opcode::Unsubscribe),
            0x05 => Ok(Opcode::Begin),
            0x06 => Ok(Opcode::Data),
            0x11 => Ok(Opcode::ListXml),
            other => Err(Error::Protocol(format!("unknown opcode {:#04x}", other))),
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Opcode::Goodbye => "GOODBYE",
            Opcode::Heartbeat => "HEARTBEAT",
            Opcode::Subscribe => "SUBSCRIBE",
            Opcode::Unsubscribe => "UNSUBSCRIBE",
            Opcode::Begin => "BEGIN",
            Opcode::Data => "DATA",
            Opcode::ListXml => "LISTXML",
        };
        f.write_str(name)
    }
}

/// SUBSCRIBE request: opcode, name bytes, NUL terminator
pub fn encode_subscribe(name: &str) -> Result<Vec<u8>> {
    if name.is_empty() || name.as_bytes().contains(&0) {
        return Err(Error::InvalidArgument(format!(
            "service name {:?} must be non-empty and contain no NUL",
            name
        )));
    }
    let mut buf = Vec::with_capacity(name.len() + 2);
    buf.push(Opcode::Subscribe.as_byte());
    buf.extend_from_slice(name.as_bytes());
    buf.push(0);
    Ok(buf)
}

/// Complete TCP DATA frame including the opcode
pub fn encode_tcp_data(timestamp_us: i64, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + TCP_HEADER_SIZE + payload.len());
    buf.push(Opcode::Data.as_byte());
    buf.extend_from_slice(&timestamp_us.to_le_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Number of UDP fragments a frame of `size` bytes occupies
pub fn udp_fragment_count(size: usize) -> usize {
    size.div_ceil(UDP_BODY_SIZE)
}

/// Split a frame into UDP DATA datagrams
///
/// An empty payload still produces one header-only datagram so the frame is
/// observable on the receiving side.
pub fn encode_udp_data(timestamp_us: i64, payload: &[u8]) -> Vec<Vec<u8>> {
    let size = (payload.len() as u32).to_le_bytes();
    let ts = timestamp_us.to_le_bytes();

    let header = |index: u32, body: &[u8]| {
        let mut datagram = Vec::with_capacity(UDP_HEADER_SIZE + body.len());
        datagram.push(Opcode::Data.as_byte());
        datagram.extend_from_slice(&ts);
        datagram.extend_from_slice(&size);
        datagram.extend_from_slice(&index.to_le_bytes());
        datagram.extend_from_slice(body);
        datagram
    };

    if payload.is_empty() {
        return vec![header(0, &[])];
    }

    payload
        .chunks(UDP_BODY_SIZE)
        .enumerate()
        .map(|(i, body)| header(i as u32, body))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_round_trip() {
        for code in [0x00u8, 0x02, 0x03, 0x04, 0x05, 0x06, 0x11] {
            let op = Opcode::try_from(code).unwrap();
            assert_eq!(op.as_byte(), code);
        }
    }

    #[test]
    fn test_unknown_opcode_is_protocol_error() {
        assert!(matches!(Opcode::try_from(0x01), Err(Error::Protocol(_))));
        assert!(matches!(Opcode::try_from(0xFF), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_encode_subscribe() {
        let buf = encode_subscribe("motors").unwrap();
        assert_eq!(buf, b"\x03motors\x00");
    }

    #[test]
    fn test_encode_subscribe_rejects_nul() {
        assert!(matches!(
            encode_subscribe("bad\0name"),
            Err(Error::InvalidArgument(_))
        ));
        assert!(encode_subscribe("").is_err());
    }

    #[test]
    fn test_encode_tcp_data_layout() {
        let buf = encode_tcp_data(0x0102, &[0xAA, 0xBB]);
        assert_eq!(buf[0], 0x06);
        assert_eq!(&buf[1..9], &0x0102i64.to_le_bytes());
        assert_eq!(&buf[9..13], &2u32.to_le_bytes());
        assert_eq!(&buf[13..], &[0xAA, 0xBB]);
    }

    #[test]
    fn test_udp_fragmentation() {
        assert_eq!(UDP_BODY_SIZE, 495);
        let payload: Vec<u8> = (0..1200).map(|i| i as u8).collect();
        let datagrams = encode_udp_data(7, &payload);

        assert_eq!(datagrams.len(), udp_fragment_count(payload.len()));
        assert_eq!(datagrams.len(), 3);
        assert!(datagrams.iter().all(|d| d.len() <= UDP_DATAGRAM_SIZE));
        assert_eq!(&datagrams[2][13..17], &2u32.to_le_bytes());
        assert_eq!(datagrams[2].len(), UDP_HEADER_SIZE + 1200 - 2 * 495);
    }

    #[test]
    fn test_udp_empty_payload_single_datagram() {
        let datagrams = encode_udp_data(1, &[]);
        assert_eq!(datagrams.len(), 1);
        assert_eq!(datagrams[0].len(), UDP_HEADER_SIZE);
    }
}
