//! service-probe - list and stream services from a robot controller
//!
//! Usage:
//!   service-probe --host 192.168.68.101 list
//!   service-probe --host 192.168.68.101 --udp stream odometry --as doubles
//!   service-probe --mock stream bumpers --as bools --count 20
//!
//! `--mock` starts an in-process controller publishing synthetic data, which
//! is handy for trying the tool without hardware.
//!
//! Logging follows RUST_LOG, falling back to the configured level.

mod config;

use clap::{Parser, Subcommand, ValueEnum};
use config::ProbeConfig;
use image::DynamicImage;
use service_link::mock::MockController;
use service_link::queue::transmute;
use service_link::{
    DisconnectEvent, Service, ServiceClient, ServicePacket, ServiceQueue, Stream, StreamKind,
    open_stream,
};
use std::collections::HashMap;
use std::error::Error;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Service streaming probe
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Controller host (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// Controller port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Use UDP instead of TCP
    #[arg(long)]
    udp: bool,

    /// Serve synthetic services from an in-process mock controller
    #[arg(long)]
    mock: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the services the controller publishes
    List,
    /// Subscribe to one service and print its packets
    Stream {
        /// Service name
        service: String,

        /// How to decode payloads
        #[arg(long = "as", value_enum, default_value_t = Decode::Raw)]
        decode: Decode,

        /// Stop after this many packets (0 = until Ctrl-C)
        #[arg(short = 'n', long, default_value = "0")]
        count: usize,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Decode {
    Raw,
    Bools,
    Ints,
    Doubles,
    Image,
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ProbeConfig::from_file(path)?,
        None => ProbeConfig::default(),
    };
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.logging.level.as_str()),
    )
    .init();

    if let Some(host) = &args.host {
        config.connection.host = host.clone();
    }
    if args.udp {
        config.connection.transport = StreamKind::Udp;
    }
    if let Some(port) = args.port {
        config.connection.port = Some(port);
    }

    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || {
        log::info!("Received shutdown signal");
        r.store(false, Ordering::Relaxed);
    })?;

    let demo = if args.mock {
        Some(Demo::start(Arc::clone(&running))?)
    } else {
        None
    };
    let addr = match &demo {
        Some(demo) => demo.addr(config.connection.transport),
        None => format!("{}:{}", config.connection.host, config.connection.port()),
    };
    log::info!("Connecting to {} over {}", addr, config.connection.transport);

    let mut stream = open_stream(config.connection.transport, addr.as_str(), &config.stream)?;
    let listing = stream.list_services()?;

    let result = match args.command {
        Command::List => {
            print_listing(&listing);
            Ok(())
        }
        Command::Stream {
            service,
            decode,
            count,
        } => {
            let service = listing
                .get(&service)
                .cloned()
                .ok_or_else(|| format!("controller has no service named '{}'", service))?;
            stream.subscribe(service)?;
            run_stream(stream, &config, decode, count, &running)
        }
    };

    running.store(false, Ordering::Relaxed);
    if let Some(demo) = demo {
        demo.stop();
    }
    result
}

fn print_listing(listing: &HashMap<String, Service>) {
    let mut services: Vec<&Service> = listing.values().collect();
    services.sort_by(|a, b| a.name().cmp(b.name()));
    println!("{:<24} {:<12} DESCRIPTION", "NAME", "FORMAT");
    for service in services {
        println!(
            "{:<24} {:<12} {}",
            service.name(),
            service.format(),
            service.description().unwrap_or("-")
        );
    }
}

fn run_stream(
    stream: Box<dyn Stream>,
    config: &ProbeConfig,
    decode: Decode,
    count: usize,
    running: &Arc<AtomicBool>,
) -> Result<(), Box<dyn Error>> {
    let client = ServiceClient::new(config.client.clone())?;
    let r = Arc::clone(running);
    client.add_disconnect_listener(move |event: &DisconnectEvent| {
        log::warn!("{} disconnected: {}", event.stream, event.reason);
        r.store(false, Ordering::Relaxed);
    });

    let rx = client.begin_unbounded(stream)?;
    match decode {
        Decode::Raw => {
            let queue = ServiceQueue::new(rx, |d: &[u8]| Ok(d.to_vec()));
            consume(queue, count, running, |d: &Vec<u8>| {
                format!("{} bytes {:02x?}", d.len(), &d[..d.len().min(16)])
            })
        }
        Decode::Bools => {
            let queue = ServiceQueue::<Vec<bool>>::make(rx)?;
            consume(queue, count, running, |d: &Vec<bool>| format!("{:?}", d))
        }
        Decode::Ints => {
            let queue = ServiceQueue::<Vec<i32>>::make(rx)?;
            consume(queue, count, running, |d: &Vec<i32>| format!("{:?}", d))
        }
        Decode::Doubles => {
            let queue = ServiceQueue::<Vec<f64>>::make(rx)?;
            consume(queue, count, running, |d: &Vec<f64>| format!("{:.4?}", d))
        }
        Decode::Image => {
            let queue = ServiceQueue::new(rx, transmute::image);
            consume(queue, count, running, |img: &DynamicImage| {
                format!("{}x{} {:?}", img.width(), img.height(), img.color())
            })
        }
    }

    client.close();
    Ok(())
}

fn consume<T>(
    queue: ServiceQueue<T>,
    count: usize,
    running: &AtomicBool,
    render: impl Fn(&T) -> String,
) {
    let mut seen = 0;
    while running.load(Ordering::Relaxed) && (count == 0 || seen < count) {
        match queue.poll_timeout(Duration::from_millis(200)) {
            Ok(Some(packet)) => {
                seen += 1;
                print_packet(&packet, &render);
            }
            Ok(None) => {}
            Err(service_link::Error::QueueClosed) => break,
            Err(e) => log::warn!("Skipping packet: {}", e),
        }
    }
    log::info!("Received {} packets", seen);
}

fn print_packet<T>(packet: &ServicePacket<T>, render: impl Fn(&T) -> String) {
    println!(
        "[{}] {} ts={}us {}",
        packet.stream,
        packet.service.name(),
        packet.timestamp_us,
        render(&packet.data)
    );
}

/// Mock controller plus a thread publishing synthetic samples
struct Demo {
    mock: Arc<MockController>,
    publisher: JoinHandle<()>,
}

impl Demo {
    fn start(running: Arc<AtomicBool>) -> Result<Self, Box<dyn Error>> {
        let mock = Arc::new(MockController::start([
            Service::new("odometry", "doubles", Some("x, y, theta".to_string())),
            Service::new("bumpers", "bools", Some("left, right".to_string())),
            Service::new("ticks", "ints", Some("left, right encoder ticks".to_string())),
        ])?);
        let publisher_mock = Arc::clone(&mock);

        let publisher = thread::Builder::new()
            .name("demo-publisher".into())
            .spawn(move || {
                let mut step = 0i32;
                while running.load(Ordering::Relaxed) {
                    let ts = now_micros();
                    let t = step as f64 * 0.1;

                    let odometry: Vec<u8> = [t.cos(), t.sin(), t]
                        .iter()
                        .flat_map(|v| v.to_le_bytes())
                        .collect();
                    publisher_mock.publish("odometry", ts, &odometry);
                    let bumpers = [(step % 20 == 0) as u8, (step % 35 == 0) as u8];
                    publisher_mock.publish("bumpers", ts, &bumpers);
                    let ticks: Vec<u8> = [step * 12, step * 11]
                        .iter()
                        .flat_map(|v| v.to_le_bytes())
                        .collect();
                    publisher_mock.publish("ticks", ts, &ticks);

                    step = step.wrapping_add(1);
                    thread::sleep(Duration::from_millis(100));
                }
            })?;

        Ok(Self { mock, publisher })
    }

    fn addr(&self, kind: StreamKind) -> String {
        let addr: SocketAddr = match kind {
            StreamKind::Tcp => self.mock.tcp_addr(),
            StreamKind::Udp => self.mock.udp_addr(),
        };
        addr.to_string()
    }

    /// Caller clears `running` first; the mock shuts down when its last handle drops
    fn stop(self) {
        if self.publisher.join().is_err() {
            log::error!("Demo publisher panicked");
        }
    }
}

fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or_default()
}
