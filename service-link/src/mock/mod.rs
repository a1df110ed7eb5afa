//! In-process controller for hardware-free testing
//!
//! `MockController` serves the controller half of the service protocol on
//! loopback (or any bind address): a TCP listener and a UDP socket on
//! ephemeral ports, a table of services, and a heartbeat thread.
//!
//! # Control handling
//!
//! | Code | Unlocked client | Locked client |
//! |------|-----------------|---------------|
//! | GOODBYE | dropped | dropped |
//! | HEARTBEAT | noted | noted |
//! | SUBSCRIBE name | subscribed; unknown name drops | dropped |
//! | UNSUBSCRIBE | subscription cleared | dropped |
//! | BEGIN | locked; no subscription drops | dropped |
//! | LISTXML | DATA reply with the listing | dropped |
//! | DATA / other | dropped | dropped |
//!
//! Locked clients receive HEARTBEAT every interval (unless disabled with
//! [`MockController::set_heartbeats`]) and DATA for each
//! [`publish`](MockController::publish) to their service. UDP frames are
//! fragmented exactly like the real controller does.
//!
//! Enable with the `mock` feature:
//!
//! ```bash
//! cargo test --features mock
//! ```

mod tcp;
mod udp;

use crate::error::Result;
use crate::protocol::{Opcode, encode_tcp_data, encode_udp_data};
use crate::service::Service;
use crate::service_list;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Default heartbeat period of the mock
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(100);

/// Socket read timeout used by the mock's threads to notice shutdown
const POLL_TIMEOUT: Duration = Duration::from_millis(20);

enum Link {
    Tcp(TcpStream),
    Udp(SocketAddr),
}

struct MockClient {
    link: Link,
    service: Option<String>,
    locked: bool,
}

/// State shared by the mock's threads
struct Shared {
    services: RwLock<HashMap<String, Service>>,
    clients: Mutex<HashMap<u64, MockClient>>,
    udp_peers: Mutex<HashMap<SocketAddr, u64>>,
    udp: UdpSocket,
    running: AtomicBool,
    heartbeats: AtomicBool,
    next_client: AtomicU64,
}

impl Shared {
    fn add_client(&self, link: Link) -> u64 {
        let id = self.next_client.fetch_add(1, Ordering::Relaxed);
        self.clients.lock().insert(
            id,
            MockClient {
                link,
                service: None,
                locked: false,
            },
        );
        id
    }

    fn send(&self, link: &mut Link, bytes: &[u8]) -> std::io::Result<()> {
        match link {
            Link::Tcp(stream) => stream.write_all(bytes),
            Link::Udp(peer) => self.udp.send_to(bytes, *peer).map(|_| ()),
        }
    }

    fn send_frame(&self, link: &mut Link, timestamp_us: i64, payload: &[u8]) -> std::io::Result<()> {
        match link {
            Link::Tcp(stream) => stream.write_all(&encode_tcp_data(timestamp_us, payload)),
            Link::Udp(peer) => {
                for datagram in encode_udp_data(timestamp_us, payload) {
                    self.udp.send_to(&datagram, *peer)?;
                }
                Ok(())
            }
        }
    }

    /// Apply one control message; false means the client must be dropped
    fn handle_control(&self, id: u64, code: u8, name: Option<&str>) -> bool {
        let mut clients = self.clients.lock();
        let Some(client) = clients.get_mut(&id) else {
            return false;
        };

        let Ok(opcode) = Opcode::try_from(code) else {
            log::warn!("Mock client {} sent unknown code {:#04x}", id, code);
            return false;
        };

        match opcode {
            Opcode::Goodbye => {
                log::debug!("Mock client {} said goodbye", id);
                false
            }
            Opcode::Heartbeat => {
                log::trace!("Mock client {} heartbeat", id);
                true
            }
            Opcode::Subscribe if !client.locked => {
                let name = name.unwrap_or_default();
                if !self.services.read().contains_key(name) {
                    log::warn!("Mock client {} subscribed to unknown service '{}'", id, name);
                    return false;
                }
                client.service = Some(name.to_string());
                true
            }
            Opcode::Unsubscribe if !client.locked => {
                client.service = None;
                true
            }
            Opcode::Begin if !client.locked => {
                if client.service.is_none() {
                    log::warn!("Mock client {} began without a subscription", id);
                    return false;
                }
                client.locked = true;
                true
            }
            Opcode::ListXml if !client.locked => {
                let listing = service_list::render(self.services.read().values());
                self.send_frame(&mut client.link, now_micros(), listing.as_bytes())
                    .is_ok()
            }
            other => {
                log::warn!("Mock client {} sent {} in wrong state", id, other);
                false
            }
        }
    }

    fn drop_client(&self, id: u64) {
        let Some(mut client) = self.clients.lock().remove(&id) else {
            return;
        };
        match &mut client.link {
            Link::Tcp(stream) => {
                let _ = stream.shutdown(Shutdown::Both);
            }
            Link::Udp(peer) => {
                // No connection to tear down; tell the peer instead
                let _ = self.udp.send_to(&[Opcode::Goodbye.as_byte()], *peer);
                self.udp_peers.lock().remove(peer);
            }
        }
        log::debug!("Mock dropped client {}", id);
    }

    /// Run `f` on every locked client matching `service`, dropping those
    /// whose send fails; returns how many succeeded
    fn for_each_locked<F>(&self, service: Option<&str>, mut f: F) -> usize
    where
        F: FnMut(&Self, &mut Link) -> std::io::Result<()>,
    {
        let mut failed = Vec::new();
        let mut sent = 0;
        {
            let mut clients = self.clients.lock();
            for (id, client) in clients.iter_mut() {
                if !client.locked {
                    continue;
                }
                if service.is_some_and(|s| client.service.as_deref() != Some(s)) {
                    continue;
                }
                match f(self, &mut client.link) {
                    Ok(()) => sent += 1,
                    Err(e) => {
                        log::debug!("Mock send to client {} failed: {}", id, e);
                        failed.push(*id);
                    }
                }
            }
        }
        for id in failed {
            self.drop_client(id);
        }
        sent
    }
}

fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or_default()
}

/// Controller stand-in serving TCP and UDP service streams
pub struct MockController {
    shared: Arc<Shared>,
    tcp_addr: SocketAddr,
    udp_addr: SocketAddr,
    threads: Vec<JoinHandle<()>>,
}

impl MockController {
    /// Serve `services` on loopback with the default heartbeat period
    pub fn start<I>(services: I) -> Result<Self>
    where
        I: IntoIterator<Item = Service>,
    {
        Self::start_with(IpAddr::V4(Ipv4Addr::LOCALHOST), services, DEFAULT_HEARTBEAT_INTERVAL)
    }

    /// Serve `services` on `bind_ip` (ephemeral ports)
    pub fn start_with<I>(bind_ip: IpAddr, services: I, heartbeat_interval: Duration) -> Result<Self>
    where
        I: IntoIterator<Item = Service>,
    {
        let listener = TcpListener::bind((bind_ip, 0))?;
        listener.set_nonblocking(true)?;
        let udp = UdpSocket::bind((bind_ip, 0))?;
        udp.set_read_timeout(Some(POLL_TIMEOUT))?;

        let tcp_addr = listener.local_addr()?;
        let udp_addr = udp.local_addr()?;

        let shared = Arc::new(Shared {
            services: RwLock::new(
                services
                    .into_iter()
                    .map(|s| (s.name().to_string(), s))
                    .collect(),
            ),
            clients: Mutex::new(HashMap::new()),
            udp_peers: Mutex::new(HashMap::new()),
            udp,
            running: AtomicBool::new(true),
            heartbeats: AtomicBool::new(true),
            next_client: AtomicU64::new(1),
        });

        let mut threads = Vec::new();

        let accept_shared = Arc::clone(&shared);
        threads.push(
            thread::Builder::new()
                .name("mock-tcp-accept".into())
                .spawn(move || tcp::accept_loop(accept_shared, listener))?,
        );

        let udp_shared = Arc::clone(&shared);
        threads.push(
            thread::Builder::new()
                .name("mock-udp".into())
                .spawn(move || udp::serve(udp_shared))?,
        );

        let hb_shared = Arc::clone(&shared);
        threads.push(
            thread::Builder::new()
                .name("mock-heartbeat".into())
                .spawn(move || heartbeat_loop(hb_shared, heartbeat_interval))?,
        );

        log::info!("Mock controller on tcp {} / udp {}", tcp_addr, udp_addr);
        Ok(Self {
            shared,
            tcp_addr,
            udp_addr,
            threads,
        })
    }

    pub fn tcp_addr(&self) -> SocketAddr {
        self.tcp_addr
    }

    pub fn udp_addr(&self) -> SocketAddr {
        self.udp_addr
    }

    pub fn add_service(&self, service: Service) {
        self.shared
            .services
            .write()
            .insert(service.name().to_string(), service);
    }

    pub fn services(&self) -> Vec<Service> {
        self.shared.services.read().values().cloned().collect()
    }

    /// Pause or resume heartbeats to locked clients
    pub fn set_heartbeats(&self, enabled: bool) {
        self.shared.heartbeats.store(enabled, Ordering::SeqCst);
    }

    /// Send one frame to every locked subscriber of `service`
    ///
    /// Returns the number of clients it was sent to.
    pub fn publish(&self, service: &str, timestamp_us: i64, payload: &[u8]) -> usize {
        self.shared.for_each_locked(Some(service), |shared, link| {
            shared.send_frame(link, timestamp_us, payload)
        })
    }

    /// Drop every locked subscriber of `service`
    pub fn disconnect(&self, service: &str) -> usize {
        let ids: Vec<u64> = self
            .shared
            .clients
            .lock()
            .iter()
            .filter(|(_, c)| c.locked && c.service.as_deref() == Some(service))
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            self.shared.drop_client(*id);
        }
        ids.len()
    }

    /// Locked clients streaming `service`
    pub fn subscriber_count(&self, service: &str) -> usize {
        self.shared
            .clients
            .lock()
            .values()
            .filter(|c| c.locked && c.service.as_deref() == Some(service))
            .count()
    }

    /// All connected clients, locked or not
    pub fn client_count(&self) -> usize {
        self.shared.clients.lock().len()
    }

    /// Stop serving and drop every client
    pub fn shutdown(&mut self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        for handle in self.threads.drain(..) {
            handle.join().ok();
        }
        let ids: Vec<u64> = self.shared.clients.lock().keys().copied().collect();
        for id in ids {
            self.shared.drop_client(id);
        }
        log::info!("Mock controller stopped");
    }
}

impl Drop for MockController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn heartbeat_loop(shared: Arc<Shared>, interval: Duration) {
    while shared.running.load(Ordering::Relaxed) {
        thread::sleep(interval);
        if !shared.heartbeats.load(Ordering::Relaxed) {
            continue;
        }
        shared.for_each_locked(None, |shared, link| {
            shared.send(link, &[Opcode::Heartbeat.as_byte()])
        });
    }
}
