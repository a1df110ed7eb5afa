//! End-to-end tests against the in-process mock controller.
//!
//! Run with: cargo test --features mock

use crossbeam_channel::{RecvTimeoutError, unbounded};
use parking_lot::Mutex;
use service_link::config::{ClientConfig, StreamConfig};
use service_link::mock::MockController;
use service_link::selector::Registrar;
use service_link::{
    DisconnectEvent, DisconnectReason, Error, Mode, RawPacket, Service, ServiceClient, ServiceQueue,
    Stream, StreamId, StreamKind, open_stream,
};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const HEARTBEAT: Duration = Duration::from_millis(40);

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn services() -> Vec<Service> {
    vec![
        Service::new("odometry", "doubles", Some("Wheel odometry".to_string())),
        Service::new("bumpers", "bools", Some("Bumper switches".to_string())),
        Service::new("camera", "jpeg", None),
    ]
}

fn start_mock() -> MockController {
    MockController::start_with(IpAddr::V4(Ipv4Addr::LOCALHOST), services(), HEARTBEAT).unwrap()
}

fn client_config() -> ClientConfig {
    ClientConfig {
        select_timeout_ms: 20,
        heartbeat_interval_ms: 40,
        check_interval_ms: 40,
        poll_interval_ms: 1,
    }
}

fn stream_config() -> StreamConfig {
    StreamConfig {
        liveness_timeout_ms: 400,
        list_timeout_ms: 1000,
        ..StreamConfig::default()
    }
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

fn subscribed_stream(mock: &MockController, kind: StreamKind, service: &str) -> Box<dyn Stream> {
    let addr = match kind {
        StreamKind::Tcp => mock.tcp_addr(),
        StreamKind::Udp => mock.udp_addr(),
    };
    let mut stream = open_stream(kind, addr, &stream_config()).unwrap();
    let listing = stream.list_services().unwrap();
    stream.subscribe(listing[service].clone()).unwrap();
    stream
}

fn record_events(client: &ServiceClient) -> Arc<Mutex<Vec<DisconnectEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    client.add_disconnect_listener(move |e: &DisconnectEvent| sink.lock().push(e.clone()));
    events
}

#[test]
fn test_list_services_tcp_and_udp() {
    init_logging();
    let mock = start_mock();

    for (kind, addr) in [
        (StreamKind::Tcp, mock.tcp_addr()),
        (StreamKind::Udp, mock.udp_addr()),
    ] {
        let mut stream = open_stream(kind, addr, &stream_config()).unwrap();
        let listing = stream.list_services().unwrap();
        assert_eq!(listing.len(), 3, "{}", kind);
        assert_eq!(listing["bumpers"].format(), "bools");
        assert_eq!(listing["odometry"].description(), Some("Wheel odometry"));
        assert!(listing["camera"].description().is_none());
    }
}

#[test]
fn test_tcp_stream_delivers_typed_packets() {
    init_logging();
    let mock = start_mock();
    let client = ServiceClient::new(client_config()).unwrap();

    let stream = subscribed_stream(&mock, StreamKind::Tcp, "odometry");
    let id = stream.id();
    let queue = ServiceQueue::<Vec<f64>>::make(client.begin_unbounded(stream).unwrap()).unwrap();
    assert!(wait_until(Duration::from_secs(2), || mock.subscriber_count("odometry") == 1));

    let mut payload = Vec::new();
    for v in [1.0f64, -0.5, 3.25] {
        payload.extend_from_slice(&v.to_le_bytes());
    }
    assert_eq!(mock.publish("odometry", 1_000_001, &payload), 1);

    let packet = queue.poll_timeout(Duration::from_secs(2)).unwrap().unwrap();
    assert_eq!(packet.data, vec![1.0, -0.5, 3.25]);
    assert_eq!(packet.timestamp_us, 1_000_001);
    assert_eq!(packet.stream, id);
    assert_eq!(packet.service.name(), "odometry");
}

#[test]
fn test_udp_stream_reassembles_large_frames() {
    init_logging();
    let mock = start_mock();
    let client = ServiceClient::new(client_config()).unwrap();

    let stream = subscribed_stream(&mock, StreamKind::Udp, "camera");
    let rx = client.begin_unbounded(stream).unwrap();
    assert!(wait_until(Duration::from_secs(2), || mock.subscriber_count("camera") == 1));

    let frame: Vec<u8> = (0..5000u32).map(|i| (i * 31 % 256) as u8).collect();
    mock.publish("camera", 42, &frame);
    mock.publish("camera", 43, &[]);

    let first = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(first.timestamp_us, 42);
    assert_eq!(first.data, frame);

    let second = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(second.timestamp_us, 43);
    assert!(second.data.is_empty());
}

#[test]
fn test_heartbeats_keep_streams_alive() {
    init_logging();
    let mock = start_mock();
    let client = ServiceClient::new(client_config()).unwrap();
    let events = record_events(&client);

    let tcp = subscribed_stream(&mock, StreamKind::Tcp, "bumpers");
    let udp = subscribed_stream(&mock, StreamKind::Udp, "bumpers");
    let (tcp_id, udp_id) = (tcp.id(), udp.id());
    let _tcp_rx = client.begin_unbounded(tcp).unwrap();
    let _udp_rx = client.begin_unbounded(udp).unwrap();

    // Several liveness windows
    thread::sleep(Duration::from_millis(1200));
    assert!(client.contains(tcp_id));
    assert!(client.contains(udp_id));
    assert!(events.lock().is_empty());
}

#[test]
fn test_silent_stream_is_closed_once() {
    init_logging();
    let mock = start_mock();
    let client = ServiceClient::new(client_config()).unwrap();
    let events = record_events(&client);

    let stream = subscribed_stream(&mock, StreamKind::Tcp, "bumpers");
    let id = stream.id();
    let _rx = client.begin_unbounded(stream).unwrap();
    mock.set_heartbeats(false);

    assert!(wait_until(Duration::from_secs(3), || !client.contains(id)));
    thread::sleep(Duration::from_millis(200));

    let events = events.lock();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].stream, id);
    assert_eq!(events[0].reason, DisconnectReason::LivenessTimeout);
    assert_eq!(events[0].service.as_ref().map(Service::name), Some("bumpers"));
}

#[test]
fn test_eof_closes_only_that_stream() {
    init_logging();
    let mock = start_mock();
    let client = ServiceClient::new(client_config()).unwrap();
    let events = record_events(&client);

    let a = subscribed_stream(&mock, StreamKind::Tcp, "camera");
    let b = subscribed_stream(&mock, StreamKind::Tcp, "bumpers");
    let (a_id, b_id) = (a.id(), b.id());
    let _a_rx = client.begin_unbounded(a).unwrap();
    let b_rx = client.begin_unbounded(b).unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        mock.subscriber_count("camera") == 1 && mock.subscriber_count("bumpers") == 1
    }));

    assert_eq!(mock.disconnect("camera"), 1);
    assert!(wait_until(Duration::from_secs(2), || !client.contains(a_id)));

    {
        let events = events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].stream, a_id);
        assert_eq!(events[0].reason, DisconnectReason::Eof);
    }

    assert!(client.contains(b_id));
    mock.publish("bumpers", 7, &[1, 0, 1]);
    let packet = b_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(packet.stream, b_id);
    assert_eq!(packet.data, vec![1, 0, 1]);
}

/// Stream that only claims an existing stream's id
struct Impostor(StreamId);

impl Stream for Impostor {
    fn id(&self) -> StreamId {
        self.0
    }
    fn mode(&self) -> Mode {
        Mode::Unlocked
    }
    fn service(&self) -> Option<&Service> {
        None
    }
    fn list_services(&mut self) -> service_link::Result<HashMap<String, Service>> {
        Ok(HashMap::new())
    }
    fn subscribe(&mut self, _service: Service) -> service_link::Result<()> {
        Ok(())
    }
    fn unsubscribe(&mut self) -> service_link::Result<()> {
        Ok(())
    }
    fn begin(&mut self, _registrar: &Registrar) -> service_link::Result<()> {
        Ok(())
    }
    fn heartbeat(&mut self) -> service_link::Result<()> {
        Ok(())
    }
    fn check_io(&self) -> bool {
        true
    }
    fn handle_io(&mut self) -> service_link::Result<Option<RawPacket>> {
        Ok(None)
    }
    fn close(&mut self) {}
}

#[test]
fn test_duplicate_begin_keeps_original_queue() {
    init_logging();
    let mock = start_mock();
    let client = ServiceClient::new(client_config()).unwrap();

    let stream = subscribed_stream(&mock, StreamKind::Tcp, "bumpers");
    let id = stream.id();
    let rx = client.begin_unbounded(stream).unwrap();
    assert!(wait_until(Duration::from_secs(2), || mock.subscriber_count("bumpers") == 1));

    let (other_tx, other_rx) = unbounded();
    assert!(matches!(
        client.begin(Box::new(Impostor(id)), other_tx),
        Err(Error::InvalidArgument(_))
    ));

    mock.publish("bumpers", 1, &[1]);
    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap().data, vec![1]);
    assert!(other_rx.try_recv().is_err());
}

#[test]
fn test_close_twice_stops_dispatch() {
    init_logging();
    let mock = start_mock();
    let client = ServiceClient::new(client_config()).unwrap();
    let events = record_events(&client);

    let stream = subscribed_stream(&mock, StreamKind::Tcp, "odometry");
    let rx = client.begin_unbounded(stream).unwrap();
    assert!(wait_until(Duration::from_secs(2), || mock.subscriber_count("odometry") == 1));

    client.close();
    client.close();
    assert_eq!(events.lock().len(), 1);
    assert_eq!(events.lock()[0].reason, DisconnectReason::Shutdown);

    mock.publish("odometry", 5, &1.0f64.to_le_bytes());
    // The queue's sender went away with the stream; nothing can arrive
    assert!(matches!(
        rx.recv_timeout(Duration::from_millis(200)),
        Err(RecvTimeoutError::Disconnected)
    ));
    assert!(matches!(
        client.begin_unbounded(subscribed_stream(&mock, StreamKind::Tcp, "odometry")),
        Err(Error::ClientClosed)
    ));
}

#[test]
fn test_mock_drops_unknown_subscription() {
    init_logging();
    let mock = start_mock();
    let mut stream = open_stream(StreamKind::Tcp, mock.tcp_addr(), &stream_config()).unwrap();
    assert!(wait_until(Duration::from_secs(2), || mock.client_count() == 1));

    stream.subscribe(Service::named("does-not-exist")).unwrap();
    assert!(wait_until(Duration::from_secs(2), || mock.client_count() == 0));
    assert!(stream.list_services().is_err());
}
