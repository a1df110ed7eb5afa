//! UDP service stream
//!
//! The socket is bound to an ephemeral local port and connected to the
//! controller, which only fixes the default peer and filters foreign
//! datagrams. It is non-blocking from the start; `list_services` waits for
//! the reply on a transient [`Selector`].

use super::{Mode, Stream, StreamState};
use crate::config::StreamConfig;
use crate::error::{Error, Result};
use crate::packet::{UdpPacket, is_would_block};
use crate::protocol::{Opcode, encode_subscribe};
use crate::selector::{Registrar, Selector, Source};
use crate::service::{RawPacket, Service, StreamId};
use crate::service_list;
use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::{Duration, Instant};

/// Probe interval while waiting for a listing
const LIST_POLL_INTERVAL: Duration = Duration::from_millis(2);

pub struct UdpServiceStream {
    state: StreamState,
    socket: UdpSocket,
    peer: SocketAddr,
    packet: UdpPacket,
}

impl UdpServiceStream {
    /// Bind an ephemeral port and connect it to the controller
    pub fn connect<A: ToSocketAddrs>(addr: A, config: &StreamConfig) -> Result<Self> {
        let mut last_err = None;
        for candidate in addr.to_socket_addrs()? {
            let local: SocketAddr = if candidate.is_ipv4() {
                (Ipv4Addr::UNSPECIFIED, 0).into()
            } else {
                (Ipv6Addr::UNSPECIFIED, 0).into()
            };
            let attempt = UdpSocket::bind(local).and_then(|socket| {
                socket.connect(candidate)?;
                Ok(socket)
            });
            match attempt {
                Ok(socket) => return Self::from_socket(socket, config),
                Err(e) => {
                    log::debug!("UDP connect to {} failed: {}", candidate, e);
                    last_err = Some(e);
                }
            }
        }
        Err(match last_err {
            Some(e) => Error::Io(e),
            None => Error::InvalidArgument("address resolved to nothing".to_string()),
        })
    }

    /// Wrap a socket already connected to the controller
    pub fn from_socket(socket: UdpSocket, config: &StreamConfig) -> Result<Self> {
        socket.set_nonblocking(true)?;
        let peer = socket.peer_addr()?;
        log::info!("UDP service stream {} -> {}", socket.local_addr()?, peer);

        Ok(Self {
            state: StreamState::new(config),
            socket,
            peer,
            packet: UdpPacket::new(config.max_frame_size),
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    fn send(&self, bytes: &[u8]) -> Result<()> {
        let sent = self.socket.send(bytes)?;
        if sent != bytes.len() {
            return Err(Error::Protocol(format!(
                "short datagram: {} of {} bytes",
                sent,
                bytes.len()
            )));
        }
        Ok(())
    }

    fn await_listing(&mut self) -> Result<HashMap<String, Service>> {
        let mut selector = Selector::new(LIST_POLL_INTERVAL);
        selector.register(self.state.id, Source::Udp(self.socket.try_clone()?));

        let deadline = Instant::now() + self.state.config.list_timeout();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout);
            }
            if selector.select(remaining).is_empty() {
                continue;
            }
            if !self.packet.read(&self.socket)? {
                continue;
            }
            match self.packet.code() {
                Some(Opcode::Heartbeat) => {}
                Some(Opcode::Data) => {
                    if let Some((_, xml)) = self.packet.take_frame() {
                        return service_list::parse(&xml);
                    }
                }
                Some(Opcode::Goodbye) => return Err(Error::Disconnected),
                other => {
                    return Err(Error::Protocol(format!(
                        "unexpected {:?} while waiting for service listing",
                        other
                    )));
                }
            }
        }
    }
}

impl Stream for UdpServiceStream {
    fn id(&self) -> StreamId {
        self.state.id
    }

    fn mode(&self) -> Mode {
        self.state.mode
    }

    fn service(&self) -> Option<&Service> {
        self.state.service.as_ref()
    }

    fn list_services(&mut self) -> Result<HashMap<String, Service>> {
        self.state.require_unlocked("list services")?;
        self.send(&[Opcode::ListXml.as_byte()])?;

        let result = self.await_listing();
        self.packet.clear();
        result
    }

    fn subscribe(&mut self, service: Service) -> Result<()> {
        self.state.require_unlocked("subscribe")?;
        let request = encode_subscribe(service.name())?;
        self.send(&request)?;
        log::debug!("{} subscribed to {}", self.state.id, service);
        self.state.service = Some(service);
        Ok(())
    }

    fn unsubscribe(&mut self) -> Result<()> {
        self.state.require_unlocked("unsubscribe")?;
        self.send(&[Opcode::Unsubscribe.as_byte()])?;
        self.state.service = None;
        Ok(())
    }

    fn begin(&mut self, registrar: &Registrar) -> Result<()> {
        self.state.prepare_begin()?;
        self.state.lock();
        self.send(&[Opcode::Begin.as_byte()])?;

        let source = Source::Udp(self.socket.try_clone()?);
        self.state.key = Some(registrar.register(self.state.id, source)?);

        log::info!("{} streaming from {} over UDP", self.state.id, self.peer);
        Ok(())
    }

    fn heartbeat(&mut self) -> Result<()> {
        if self.state.mode != Mode::Locked || self.state.closed {
            return Ok(());
        }
        match self.socket.send(&[Opcode::Heartbeat.as_byte()]) {
            Ok(_) => Ok(()),
            Err(e) if is_would_block(&e) => {
                log::debug!("{} socket busy, skipping heartbeat", self.state.id);
                Ok(())
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn check_io(&self) -> bool {
        self.state.is_alive()
    }

    fn handle_io(&mut self) -> Result<Option<RawPacket>> {
        self.state.require_locked("handle I/O")?;

        if !self.packet.read(&self.socket)? {
            return Ok(None);
        }
        match self.packet.code() {
            Some(Opcode::Heartbeat) => {
                log::trace!("{} heartbeat", self.state.id);
                self.state.touch();
                Ok(None)
            }
            Some(Opcode::Data) => match self.packet.take_frame() {
                Some((timestamp_us, payload)) => Ok(Some(self.state.packet(timestamp_us, payload)?)),
                None => Ok(None),
            },
            Some(Opcode::Goodbye) => Err(Error::Disconnected),
            Some(other) => Err(Error::Protocol(format!("unexpected {} from controller", other))),
            None => Ok(None),
        }
    }

    fn close(&mut self) {
        if !self.state.mark_closed() {
            return;
        }
        let _ = self.socket.send(&[Opcode::Goodbye.as_byte()]);
        log::debug!("{} closed UDP stream to {}", self.state.id, self.peer);
    }
}

impl Drop for UdpServiceStream {
    fn drop(&mut self) {
        self.close();
    }
}
