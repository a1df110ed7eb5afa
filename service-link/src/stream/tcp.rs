//! TCP service stream
//!
//! Control codes go out as single bytes (SUBSCRIBE adds the NUL-terminated
//! name). Incoming traffic is a byte stream of opcodes, each DATA opcode
//! followed by a length-prefixed frame.
//!
//! The socket stays blocking while unlocked so `list_services` can wait with
//! a read timeout; `begin` switches it to non-blocking before handing it to
//! the selector.

use super::{Mode, Stream, StreamState};
use crate::config::StreamConfig;
use crate::error::{Error, Result};
use crate::packet::{CodePacket, TcpDataPacket, is_would_block};
use crate::protocol::{Opcode, encode_subscribe};
use crate::selector::{Registrar, Source};
use crate::service::{RawPacket, Service, StreamId};
use crate::service_list;
use std::collections::HashMap;
use std::io::Write;
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Instant;

pub struct TcpServiceStream {
    state: StreamState,
    socket: TcpStream,
    peer: SocketAddr,
    code: CodePacket,
    data: TcpDataPacket,
}

impl TcpServiceStream {
    /// Connect to a controller, trying each resolved address in turn
    pub fn connect<A: ToSocketAddrs>(addr: A, config: &StreamConfig) -> Result<Self> {
        let mut last_err = None;
        for candidate in addr.to_socket_addrs()? {
            match TcpStream::connect_timeout(&candidate, config.connect_timeout()) {
                Ok(socket) => return Self::from_socket(socket, config),
                Err(e) => {
                    log::debug!("TCP connect to {} failed: {}", candidate, e);
                    last_err = Some(e);
                }
            }
        }
        Err(match last_err {
            Some(e) => Error::Io(e),
            None => Error::InvalidArgument("address resolved to nothing".to_string()),
        })
    }

    /// Wrap an already connected socket
    pub fn from_socket(socket: TcpStream, config: &StreamConfig) -> Result<Self> {
        socket.set_nodelay(true)?;
        socket.set_nonblocking(false)?;
        let peer = socket.peer_addr()?;
        log::info!("TCP service stream connected to {}", peer);

        Ok(Self {
            state: StreamState::new(config),
            socket,
            peer,
            code: CodePacket::new(),
            data: TcpDataPacket::new(config.max_frame_size),
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        self.socket.write_all(bytes)?;
        Ok(())
    }

    /// Wait for the LISTXML reply; the caller restores the read timeout
    fn await_listing(&mut self) -> Result<HashMap<String, Service>> {
        let deadline = Instant::now() + self.state.config.list_timeout();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout);
            }
            self.socket.set_read_timeout(Some(remaining))?;

            if !self.code.read(&mut self.socket)? {
                continue;
            }
            match Opcode::try_from(self.code.code())? {
                Opcode::Heartbeat => {
                    self.code.clear();
                }
                Opcode::Data => {
                    if !self.data.read(&mut self.socket)? {
                        continue;
                    }
                    self.code.clear();
                    let (_, xml) = self.data.take().ok_or(Error::Timeout)?;
                    return service_list::parse(&xml);
                }
                Opcode::Goodbye => return Err(Error::Disconnected),
                other => {
                    return Err(Error::Protocol(format!(
                        "unexpected {} while waiting for service listing",
                        other
                    )));
                }
            }
        }
    }
}

impl Stream for TcpServiceStream {
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
        self.socket.set_read_timeout(None)?;
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

        self.socket.set_nonblocking(true)?;
        let source = Source::Tcp(self.socket.try_clone()?);
        self.state.key = Some(registrar.register(self.state.id, source)?);

        log::info!("{} streaming from {} over TCP", self.state.id, self.peer);
        Ok(())
    }

    fn heartbeat(&mut self) -> Result<()> {
        if self.state.mode != Mode::Locked || self.state.closed {
            return Ok(());
        }
        match self.socket.write(&[Opcode::Heartbeat.as_byte()]) {
            Ok(0) => Err(Error::Disconnected),
            Ok(_) => Ok(()),
            Err(e) if is_would_block(&e) => {
                log::debug!("{} send buffer full, skipping heartbeat", self.state.id);
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

        if !self.code.read(&mut self.socket)? {
            return Ok(None);
        }
        match Opcode::try_from(self.code.code())? {
            Opcode::Heartbeat => {
                log::trace!("{} heartbeat", self.state.id);
                self.state.touch();
                self.code.clear();
                Ok(None)
            }
            Opcode::Data => {
                if !self.data.read(&mut self.socket)? {
                    return Ok(None);
                }
                self.code.clear();
                match self.data.take() {
                    Some((timestamp_us, payload)) => {
                        Ok(Some(self.state.packet(timestamp_us, payload)?))
                    }
                    None => Ok(None),
                }
            }
            Opcode::Goodbye => Err(Error::Disconnected),
            other => Err(Error::Protocol(format!("unexpected {} from controller", other))),
        }
    }

    fn close(&mut self) {
        if !self.state.mark_closed() {
            return;
        }
        // Best effort, the connection is going away either way
        let _ = self.socket.write(&[Opcode::Goodbye.as_byte()]);
        let _ = self.socket.shutdown(Shutdown::Both);
        log::debug!("{} closed TCP stream to {}", self.state.id, self.peer);
    }
}

impl Drop for TcpServiceStream {
    fn drop(&mut self) {
        self.close();
    }
}
