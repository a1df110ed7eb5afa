//! Multiplexing service client
//!
//! One `ServiceClient` drives any number of locked streams with two threads:
//!
//! ```text
//!                  ┌──────────────────────────────┐
//!  begin(stream) ─►│ streams: id → (stream, queue) │◄─ close()
//!                  └──────┬───────────────┬───────┘
//!                         │               │
//!        service-io       │               │     service-maintenance
//!   select() → handle_io()│               │ tick: heartbeat() / check_io()
//!   → queue.try_send()    │               │
//! ```
//!
//! - **service-io** waits on the selector, runs `handle_io` for every ready
//!   stream and pushes completed packets into that stream's queue. Queued
//!   registrations are applied after each wait.
//! - **service-maintenance** sends heartbeats and checks liveness on fixed
//!   periods.
//!
//! Any error on a stream closes that stream only. Closing goes through one
//! routine that removes the map entry first, so a stream is closed and
//! reported to the disconnect listeners exactly once no matter which thread
//! noticed the failure.
//!
//! The map lock is only held to look up, insert or remove entries; socket
//! I/O happens under the per-stream lock.

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::selector::{Registrar, Selector};
use crate::service::{RawPacket, Service, StreamId};
use crate::stream::Stream;
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded, select, tick, unbounded};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::SystemTime;

type SharedStream = Arc<Mutex<Box<dyn Stream>>>;

/// Why a stream was closed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Controller closed the connection or said GOODBYE
    Eof,
    /// Read failed or the controller sent something malformed
    Error(String),
    /// Sending a heartbeat failed
    HeartbeatFailed(String),
    /// No heartbeat received within the liveness timeout
    LivenessTimeout,
    /// The client was closed
    Shutdown,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Eof => f.write_str("end of stream"),
            DisconnectReason::Error(e) => write!(f, "error: {}", e),
            DisconnectReason::HeartbeatFailed(e) => write!(f, "heartbeat failed: {}", e),
            DisconnectReason::LivenessTimeout => f.write_str("liveness timeout"),
            DisconnectReason::Shutdown => f.write_str("client shutdown"),
        }
    }
}

/// Delivered to listeners when a stream leaves the client
#[derive(Debug, Clone)]
pub struct DisconnectEvent {
    pub stream: StreamId,
    /// Last subscribed service, if any
    pub service: Option<Service>,
    pub reason: DisconnectReason,
    pub timestamp: SystemTime,
}

/// Observer for stream disconnects
///
/// Called on the client's internal threads (or the thread calling
/// [`ServiceClient::close`]); implementations must not block.
pub trait DisconnectListener: Send + Sync {
    fn on_disconnect(&self, event: &DisconnectEvent);
}

impl<F> DisconnectListener for F
where
    F: Fn(&DisconnectEvent) + Send + Sync,
{
    fn on_disconnect(&self, event: &DisconnectEvent) {
        self(event)
    }
}

/// Token returned by [`ServiceClient::add_disconnect_listener`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Entry {
    stream: SharedStream,
    queue: Sender<RawPacket>,
}

struct Inner {
    streams: Mutex<HashMap<StreamId, Entry>>,
    registrar: Registrar,
    shutdown: AtomicBool,
    listeners: RwLock<Vec<(ListenerId, Arc<dyn DisconnectListener>)>>,
    next_listener: AtomicU64,
}

impl Inner {
    fn lookup(&self, id: StreamId) -> Option<(SharedStream, Sender<RawPacket>)> {
        self.streams
            .lock()
            .get(&id)
            .map(|e| (Arc::clone(&e.stream), e.queue.clone()))
    }

    fn snapshot(&self) -> Vec<(StreamId, SharedStream)> {
        self.streams
            .lock()
            .iter()
            .map(|(id, e)| (*id, Arc::clone(&e.stream)))
            .collect()
    }

    /// Single exit path for every stream
    fn close_stream(&self, id: StreamId, reason: DisconnectReason) {
        let Some(entry) = self.streams.lock().remove(&id) else {
            return;
        };

        let service = {
            let mut stream = entry.stream.lock();
            stream.close();
            stream.service().cloned()
        };
        log::info!("Closed {} ({})", id, reason);

        let event = DisconnectEvent {
            stream: id,
            service,
            reason,
            timestamp: SystemTime::now(),
        };
        let listeners: Vec<_> = self
            .listeners
            .read()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener.on_disconnect(&event);
        }
    }

    fn dispatch(&self, id: StreamId, queue: &Sender<RawPacket>, packet: RawPacket) {
        log::trace!(
            "{} packet ts={} ({} bytes)",
            id,
            packet.timestamp_us,
            packet.data.len()
        );
        match queue.try_send(packet) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                log::debug!("{} queue full, dropping packet", id);
            }
            Err(TrySendError::Disconnected(_)) => {
                log::debug!("{} queue has no consumer, dropping packet", id);
            }
        }
    }

    fn heartbeat_all(&self) {
        for (id, stream) in self.snapshot() {
            let result = stream.lock().heartbeat();
            match result {
                Ok(()) => {}
                Err(e) if e.is_disconnect() => self.close_stream(id, DisconnectReason::Eof),
                Err(e) => {
                    log::warn!("Heartbeat to {} failed: {}", id, e);
                    self.close_stream(id, DisconnectReason::HeartbeatFailed(e.to_string()));
                }
            }
        }
    }

    fn check_all(&self) {
        for (id, stream) in self.snapshot() {
            let alive = stream.lock().check_io();
            if !alive {
                log::warn!("{} missed heartbeats, closing", id);
                self.close_stream(id, DisconnectReason::LivenessTimeout);
            }
        }
    }
}

/// Drives locked streams and routes their packets to per-stream queues
pub struct ServiceClient {
    inner: Arc<Inner>,
    config: ClientConfig,
    io_thread: Mutex<Option<JoinHandle<()>>>,
    maintenance_thread: Mutex<Option<JoinHandle<()>>>,
    stop_maintenance: Mutex<Option<Sender<()>>>,
}

impl ServiceClient {
    /// Create a client and start its I/O and maintenance threads
    pub fn new(config: ClientConfig) -> Result<Self> {
        let selector = Selector::new(config.poll_interval());
        let inner = Arc::new(Inner {
            streams: Mutex::new(HashMap::new()),
            registrar: selector.registrar(),
            shutdown: AtomicBool::new(false),
            listeners: RwLock::new(Vec::new()),
            next_listener: AtomicU64::new(1),
        });

        let io_inner = Arc::clone(&inner);
        let select_timeout = config.select_timeout();
        let io_thread = thread::Builder::new()
            .name("service-io".into())
            .spawn(move || io_loop(io_inner, selector, select_timeout))?;

        let (stop_tx, stop_rx) = bounded::<()>(0);
        let maint_inner = Arc::clone(&inner);
        let maint_config = config.clone();
        let maintenance_thread = match thread::Builder::new()
            .name("service-maintenance".into())
            .spawn(move || maintenance_loop(maint_inner, maint_config, stop_rx))
        {
            Ok(handle) => handle,
            Err(e) => {
                inner.shutdown.store(true, Ordering::SeqCst);
                inner.registrar.wakeup();
                io_thread.join().ok();
                return Err(Error::Io(e));
            }
        };

        log::debug!("Service client started");
        Ok(Self {
            inner,
            config,
            io_thread: Mutex::new(Some(io_thread)),
            maintenance_thread: Mutex::new(Some(maintenance_thread)),
            stop_maintenance: Mutex::new(Some(stop_tx)),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Lock `stream` into streaming mode and route its packets to `queue`
    ///
    /// Fails with `InvalidArgument` if a stream with the same id is already
    /// registered (its queue is left untouched) and with `ClientClosed` once
    /// `close` has started. If the stream itself refuses to begin, it is not
    /// registered and the error is returned.
    pub fn begin(&self, stream: Box<dyn Stream>, queue: Sender<RawPacket>) -> Result<()> {
        let id = stream.id();
        let shared: SharedStream = Arc::new(Mutex::new(stream));
        {
            let mut streams = self.inner.streams.lock();
            if self.inner.shutdown.load(Ordering::SeqCst) {
                return Err(Error::ClientClosed);
            }
            if streams.contains_key(&id) {
                return Err(Error::InvalidArgument(format!("{} is already registered", id)));
            }
            streams.insert(
                id,
                Entry {
                    stream: Arc::clone(&shared),
                    queue,
                },
            );
        }

        let result = shared.lock().begin(&self.inner.registrar);
        if let Err(e) = result {
            self.inner.streams.lock().remove(&id);
            return Err(e);
        }
        Ok(())
    }

    /// [`begin`](Self::begin) with a fresh unbounded queue
    pub fn begin_unbounded(&self, stream: Box<dyn Stream>) -> Result<Receiver<RawPacket>> {
        let (tx, rx) = unbounded();
        self.begin(stream, tx)?;
        Ok(rx)
    }

    pub fn add_disconnect_listener<L>(&self, listener: L) -> ListenerId
    where
        L: DisconnectListener + 'static,
    {
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed));
        self.inner.listeners.write().push((id, Arc::new(listener)));
        id
    }

    /// Returns false if the listener was not registered
    pub fn remove_disconnect_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.write();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// Streams currently driven by this client
    pub fn stream_count(&self) -> usize {
        self.inner.streams.lock().len()
    }

    pub fn contains(&self, id: StreamId) -> bool {
        self.inner.streams.lock().contains_key(&id)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst)
    }

    /// Close one stream and notify listeners; false if it was not registered
    pub fn close_stream(&self, id: StreamId) -> bool {
        if !self.contains(id) {
            return false;
        }
        self.inner.close_stream(id, DisconnectReason::Shutdown);
        true
    }

    /// Stop all threads and close every stream
    ///
    /// Idempotent. Once the first call returns no further packets are
    /// dispatched.
    pub fn close(&self) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("Closing service client");

        // Dropping the sender ends the maintenance select loop
        drop(self.stop_maintenance.lock().take());
        join_unless_current(self.maintenance_thread.lock().take());

        self.inner.registrar.wakeup();
        join_unless_current(self.io_thread.lock().take());

        let ids: Vec<StreamId> = self.inner.streams.lock().keys().copied().collect();
        for id in ids {
            self.inner.close_stream(id, DisconnectReason::Shutdown);
        }
    }
}

impl Drop for ServiceClient {
    fn drop(&mut self) {
        self.close();
    }
}

fn join_unless_current(handle: Option<JoinHandle<()>>) {
    let Some(handle) = handle else {
        return;
    };
    if handle.thread().id() == thread::current().id() {
        return;
    }
    if handle.join().is_err() {
        log::error!("Service client thread panicked");
    }
}

fn io_loop(inner: Arc<Inner>, mut selector: Selector, select_timeout: std::time::Duration) {
    log::debug!("Service I/O thread started");

    while !inner.shutdown.load(Ordering::SeqCst) {
        let ready = selector.select(select_timeout);

        for id in ready {
            if inner.shutdown.load(Ordering::SeqCst) {
                break;
            }
            let Some((stream, queue)) = inner.lookup(id) else {
                continue;
            };

            let result = stream.lock().handle_io();
            match result {
                Ok(Some(packet)) => inner.dispatch(id, &queue, packet),
                Ok(None) => {}
                Err(e) if e.is_disconnect() => {
                    inner.close_stream(id, DisconnectReason::Eof);
                }
                Err(e) => {
                    log::warn!("{} failed: {}", id, e);
                    inner.close_stream(id, DisconnectReason::Error(e.to_string()));
                }
            }
        }

        selector.register_pending();
    }

    selector.close();
    log::debug!("Service I/O thread stopped");
}

fn maintenance_loop(inner: Arc<Inner>, config: ClientConfig, stop: Receiver<()>) {
    let heartbeat = tick(config.heartbeat_interval());
    let check = tick(config.check_interval());

    loop {
        let stopped = select! {
            recv(stop) -> _ => true,
            recv(heartbeat) -> _ => {
                inner.heartbeat_all();
                false
            }
            recv(check) -> _ => {
                inner.check_all();
                false
            }
        };
        if stopped {
            break;
        }
    }
    log::debug!("Service maintenance thread stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::{KeyHandle, Source};
    use crate::stream::Mode;
    use std::net::UdpSocket;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    /// In-memory stream for exercising the client without sockets
    struct FakeStream {
        id: StreamId,
        mode: Mode,
        alive: Arc<AtomicBool>,
        heartbeats: Arc<AtomicUsize>,
        fail_begin: bool,
        fail_heartbeat: Arc<AtomicBool>,
        fail_io: Arc<AtomicBool>,
        readable: Option<UdpSocket>,
        key: Option<KeyHandle>,
    }

    impl FakeStream {
        fn new() -> Self {
            Self {
                id: StreamId::next(),
                mode: Mode::Unlocked,
                alive: Arc::new(AtomicBool::new(true)),
                heartbeats: Arc::new(AtomicUsize::new(0)),
                fail_begin: false,
                fail_heartbeat: Arc::new(AtomicBool::new(false)),
                fail_io: Arc::new(AtomicBool::new(false)),
                readable: None,
                key: None,
            }
        }

        /// Registers with the selector on begin and always reads as ready
        fn readable() -> Self {
            let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
            socket.connect(socket.local_addr().unwrap()).unwrap();
            socket.set_nonblocking(true).unwrap();
            socket.send(&[0x02]).unwrap();
            Self {
                readable: Some(socket),
                ..Self::new()
            }
        }
    }

    impl Stream for FakeStream {
        fn id(&self) -> StreamId {
            self.id
        }
        fn mode(&self) -> Mode {
            self.mode
        }
        fn service(&self) -> Option<&Service> {
            None
        }
        fn list_services(&mut self) -> Result<HashMap<String, Service>> {
            Ok(HashMap::new())
        }
        fn subscribe(&mut self, _service: Service) -> Result<()> {
            Ok(())
        }
        fn unsubscribe(&mut self) -> Result<()> {
            Ok(())
        }
        fn begin(&mut self, registrar: &Registrar) -> Result<()> {
            if self.fail_begin {
                return Err(Error::NotSubscribed);
            }
            self.mode = Mode::Locked;
            if let Some(socket) = self.readable.take() {
                self.key = Some(registrar.register(self.id, Source::Udp(socket))?);
            }
            Ok(())
        }
        fn heartbeat(&mut self) -> Result<()> {
            self.heartbeats.fetch_add(1, Ordering::SeqCst);
            if self.fail_heartbeat.load(Ordering::SeqCst) {
                return Err(Error::Protocol("heartbeat rejected".to_string()));
            }
            Ok(())
        }
        fn check_io(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }
        fn handle_io(&mut self) -> Result<Option<RawPacket>> {
            if self.fail_io.load(Ordering::SeqCst) {
                return Err(Error::Protocol("unexpected control code 0x42".to_string()));
            }
            Ok(None)
        }
        fn close(&mut self) {
            if let Some(key) = self.key.take() {
                key.cancel();
            }
        }
    }

    fn record_events(client: &ServiceClient) -> Arc<Mutex<Vec<DisconnectEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        client.add_disconnect_listener(move |e: &DisconnectEvent| sink.lock().push(e.clone()));
        events
    }

    fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        condition()
    }

    fn fast_config() -> ClientConfig {
        ClientConfig {
            select_timeout_ms: 10,
            heartbeat_interval_ms: 10,
            check_interval_ms: 10,
            poll_interval_ms: 1,
        }
    }

    #[test]
    fn test_begin_rejects_closed_client() {
        let client = ServiceClient::new(fast_config()).unwrap();
        client.close();
        let (tx, _rx) = unbounded();
        assert!(matches!(
            client.begin(Box::new(FakeStream::new()), tx),
            Err(Error::ClientClosed)
        ));
    }

    #[test]
    fn test_failed_begin_is_not_registered() {
        let client = ServiceClient::new(fast_config()).unwrap();
        let mut stream = FakeStream::new();
        stream.fail_begin = true;
        let (tx, _rx) = unbounded();
        assert!(client.begin(Box::new(stream), tx).is_err());
        assert_eq!(client.stream_count(), 0);
    }

    #[test]
    fn test_maintenance_heartbeats_and_closes_dead_streams() {
        let client = ServiceClient::new(fast_config()).unwrap();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        client.add_disconnect_listener(move |e: &DisconnectEvent| sink.lock().push(e.clone()));

        let stream = FakeStream::new();
        let id = stream.id;
        let alive = Arc::clone(&stream.alive);
        let heartbeats = Arc::clone(&stream.heartbeats);
        let _rx = client.begin_unbounded(Box::new(stream)).unwrap();

        thread::sleep(Duration::from_millis(60));
        assert!(heartbeats.load(Ordering::SeqCst) > 0);
        assert!(client.contains(id));

        alive.store(false, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(80));
        assert!(!client.contains(id));

        let events = events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].stream, id);
        assert_eq!(events[0].reason, DisconnectReason::LivenessTimeout);
    }

    #[test]
    fn test_failed_heartbeat_closes_only_that_stream() {
        let client = ServiceClient::new(fast_config()).unwrap();
        let events = record_events(&client);

        let failing = FakeStream::new();
        let failing_id = failing.id;
        let fail = Arc::clone(&failing.fail_heartbeat);
        let healthy = FakeStream::new();
        let healthy_id = healthy.id;
        let _a = client.begin_unbounded(Box::new(failing)).unwrap();
        let _b = client.begin_unbounded(Box::new(healthy)).unwrap();

        fail.store(true, Ordering::SeqCst);
        assert!(wait_until(Duration::from_secs(2), || !client.contains(failing_id)));
        thread::sleep(Duration::from_millis(50));

        assert!(client.contains(healthy_id));
        let events = events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].stream, failing_id);
        assert!(matches!(events[0].reason, DisconnectReason::HeartbeatFailed(_)));
    }

    #[test]
    fn test_io_error_closes_only_that_stream() {
        let client = ServiceClient::new(fast_config()).unwrap();
        let events = record_events(&client);

        let failing = FakeStream::readable();
        let failing_id = failing.id;
        let fail = Arc::clone(&failing.fail_io);
        let healthy = FakeStream::readable();
        let healthy_id = healthy.id;
        let _a = client.begin_unbounded(Box::new(failing)).unwrap();
        let _b = client.begin_unbounded(Box::new(healthy)).unwrap();

        thread::sleep(Duration::from_millis(50));
        assert_eq!(client.stream_count(), 2);

        fail.store(true, Ordering::SeqCst);
        assert!(wait_until(Duration::from_secs(2), || !client.contains(failing_id)));
        thread::sleep(Duration::from_millis(50));

        assert!(client.contains(healthy_id));
        let events = events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].stream, failing_id);
        assert!(matches!(
            &events[0].reason,
            DisconnectReason::Error(e) if e.contains("0x42")
        ));
    }

    #[test]
    fn test_remove_listener() {
        let client = ServiceClient::new(fast_config()).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let id = client.add_disconnect_listener(move |_: &DisconnectEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(client.remove_disconnect_listener(id));
        assert!(!client.remove_disconnect_listener(id));

        let _rx = client.begin_unbounded(Box::new(FakeStream::new())).unwrap();
        client.close();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_close_fires_shutdown_events_once() {
        let client = ServiceClient::new(fast_config()).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        client.add_disconnect_listener(move |e: &DisconnectEvent| {
            assert_eq!(e.reason, DisconnectReason::Shutdown);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let _a = client.begin_unbounded(Box::new(FakeStream::new())).unwrap();
        let _b = client.begin_unbounded(Box::new(FakeStream::new())).unwrap();
        client.close();
        client.close();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(client.stream_count(), 0);
        assert!(client.is_closed());
    }
}
