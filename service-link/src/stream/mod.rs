//! Service streams
//!
//! A stream is one connection to the controller carrying a single subscribed
//! service. It starts [`Mode::Unlocked`], where the service listing can be
//! queried and the subscription changed, and is switched to [`Mode::Locked`]
//! by `begin`. From then on the controller pushes DATA frames and heartbeats,
//! and the stream is driven by a [`ServiceClient`](crate::client::ServiceClient).
//! There is no way back; a new subscription needs a new stream.
//!
//! ```text
//!   UNLOCKED ──begin()──► LOCKED
//!   list_services            heartbeat
//!   subscribe                check_io
//!   unsubscribe              handle_io
//! ```

mod tcp;
mod udp;

pub use tcp::TcpServiceStream;
pub use udp::UdpServiceStream;

use crate::config::StreamConfig;
use crate::error::{Error, Result};
use crate::protocol::{DEFAULT_TCP_PORT, DEFAULT_UDP_PORT};
use crate::selector::{KeyHandle, Registrar};
use crate::service::{RawPacket, Service, StreamId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::ToSocketAddrs;
use std::str::FromStr;
use std::time::Instant;

/// Stream lifecycle mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Unlocked,
    Locked,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Unlocked => f.write_str("unlocked"),
            Mode::Locked => f.write_str("locked"),
        }
    }
}

/// Connection to the controller carrying one service
pub trait Stream: Send {
    fn id(&self) -> StreamId;

    fn mode(&self) -> Mode;

    /// Currently subscribed service
    fn service(&self) -> Option<&Service>;

    /// Ask the controller for its services (unlocked only, bounded wait)
    fn list_services(&mut self) -> Result<HashMap<String, Service>>;

    /// Select the service to stream (unlocked only)
    fn subscribe(&mut self, service: Service) -> Result<()>;

    /// Clear the subscription (unlocked only)
    fn unsubscribe(&mut self) -> Result<()>;

    /// Start streaming and register for read readiness
    ///
    /// Valid once, on an unlocked stream with a subscribed service.
    fn begin(&mut self, registrar: &Registrar) -> Result<()>;

    /// Send a heartbeat; no-op unless locked
    fn heartbeat(&mut self) -> Result<()>;

    /// False once a locked stream has heard no heartbeat within the
    /// liveness timeout
    fn check_io(&self) -> bool;

    /// Consume readable bytes; yields a packet when a frame completes
    fn handle_io(&mut self) -> Result<Option<RawPacket>>;

    /// Send GOODBYE (best effort) and close the socket
    fn close(&mut self);
}

/// Transport selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    #[default]
    Tcp,
    Udp,
}

impl StreamKind {
    pub fn default_port(self) -> u16 {
        match self {
            StreamKind::Tcp => DEFAULT_TCP_PORT,
            StreamKind::Udp => DEFAULT_UDP_PORT,
        }
    }
}

impl FromStr for StreamKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(StreamKind::Tcp),
            "udp" => Ok(StreamKind::Udp),
            other => Err(Error::InvalidArgument(format!("unknown transport: {}", other))),
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Tcp => f.write_str("tcp"),
            StreamKind::Udp => f.write_str("udp"),
        }
    }
}

/// Connect a stream of the given kind
pub fn open_stream<A: ToSocketAddrs>(
    kind: StreamKind,
    addr: A,
    config: &StreamConfig,
) -> Result<Box<dyn Stream>> {
    Ok(match kind {
        StreamKind::Tcp => Box::new(TcpServiceStream::connect(addr, config)?),
        StreamKind::Udp => Box::new(UdpServiceStream::connect(addr, config)?),
    })
}

/// State shared by both transports
#[derive(Debug)]
pub(crate) struct StreamState {
    pub id: StreamId,
    pub mode: Mode,
    pub service: Option<Service>,
    pub last_heartbeat: Instant,
    pub config: StreamConfig,
    pub key: Option<KeyHandle>,
    pub closed: bool,
}

impl StreamState {
    pub fn new(config: &StreamConfig) -> Self {
        Self {
            id: StreamId::next(),
            mode: Mode::Unlocked,
            service: None,
            last_heartbeat: Instant::now(),
            config: config.clone(),
            key: None,
            closed: false,
        }
    }

    pub fn require_unlocked(&self, operation: &'static str) -> Result<()> {
        match self.mode {
            Mode::Unlocked => self.require_open(),
            mode => Err(Error::InvalidState { operation, mode }),
        }
    }

    pub fn require_locked(&self, operation: &'static str) -> Result<()> {
        match self.mode {
            Mode::Locked => self.require_open(),
            mode => Err(Error::InvalidState { operation, mode }),
        }
    }

    fn require_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::Disconnected);
        }
        Ok(())
    }

    /// Checks for `begin` before any byte is sent
    pub fn prepare_begin(&self) -> Result<()> {
        self.require_unlocked("begin")?;
        if self.service.is_none() {
            return Err(Error::NotSubscribed);
        }
        Ok(())
    }

    /// Lock the stream and reset the liveness clock
    pub fn lock(&mut self) {
        self.last_heartbeat = Instant::now();
        self.mode = Mode::Locked;
    }

    pub fn touch(&mut self) {
        self.last_heartbeat = Instant::now();
    }

    pub fn is_alive(&self) -> bool {
        match self.mode {
            Mode::Unlocked => true,
            Mode::Locked => self.last_heartbeat.elapsed() <= self.config.liveness_timeout(),
        }
    }

    pub fn packet(&self, timestamp_us: i64, data: Vec<u8>) -> Result<RawPacket> {
        let service = self.service.clone().ok_or(Error::NotSubscribed)?;
        Ok(RawPacket::new(service, self.id, timestamp_us, data))
    }

    /// Mark closed and drop the selector registration; false if already closed
    pub fn mark_closed(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.closed = true;
        if let Some(key) = self.key.take() {
            key.cancel();
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_state_transitions() {
        let mut state = StreamState::new(&StreamConfig::default());
        assert!(state.require_unlocked("subscribe").is_ok());
        assert!(matches!(
            state.require_locked("handle I/O"),
            Err(Error::InvalidState { mode: Mode::Unlocked, .. })
        ));
        assert!(matches!(state.prepare_begin(), Err(Error::NotSubscribed)));

        state.service = Some(Service::named("odometry"));
        assert!(state.prepare_begin().is_ok());
        state.lock();

        assert!(matches!(
            state.prepare_begin(),
            Err(Error::InvalidState { mode: Mode::Locked, .. })
        ));
        assert!(state.require_locked("handle I/O").is_ok());
    }

    #[test]
    fn test_liveness_window() {
        let config = StreamConfig {
            liveness_timeout_ms: 20,
            ..StreamConfig::default()
        };
        let mut state = StreamState::new(&config);
        std::thread::sleep(Duration::from_millis(30));
        // Unlocked streams are never stale
        assert!(state.is_alive());

        state.lock();
        assert!(state.is_alive());
        std::thread::sleep(Duration::from_millis(30));
        assert!(!state.is_alive());
        state.touch();
        assert!(state.is_alive());
    }

    #[test]
    fn test_mark_closed_once() {
        let mut state = StreamState::new(&StreamConfig::default());
        assert!(state.mark_closed());
        assert!(!state.mark_closed());
        assert!(matches!(state.require_unlocked("subscribe"), Err(Error::Disconnected)));
    }

    #[test]
    fn test_stream_kind_parse() {
        assert_eq!("TCP".parse::<StreamKind>().unwrap(), StreamKind::Tcp);
        assert_eq!("udp".parse::<StreamKind>().unwrap(), StreamKind::Udp);
        assert!("sctp".parse::<StreamKind>().is_err());
        assert_eq!(StreamKind::Udp.default_port(), 10002);
    }
}
