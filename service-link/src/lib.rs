//! service-link - Client library for streaming robot controller services
//!
//! A controller publishes named, timestamped telemetry streams ("services").
//! This library connects to it over TCP or UDP, subscribes to a service and
//! multiplexes any number of such streams through one I/O thread, with
//! heartbeat-based liveness detection and lazily typed consumer queues.
//!
//! ```no_run
//! use service_link::config::{ClientConfig, StreamConfig};
//! use service_link::queue::ServiceQueue;
//! use service_link::stream::{open_stream, StreamKind};
//! use service_link::ServiceClient;
//!
//! let mut stream = open_stream(StreamKind::Tcp, "robot.local:10001", &StreamConfig::default())?;
//! let services = stream.list_services()?;
//! stream.subscribe(services["odometry"].clone())?;
//!
//! let client = ServiceClient::new(ClientConfig::default())?;
//! let queue = ServiceQueue::<Vec<f64>>::make(client.begin_unbounded(stream)?)?;
//! let packet = queue.take()?;
//! println!("{} @ {}us: {:?}", packet.service, packet.timestamp_us, packet.data);
//! # Ok::<(), service_link::Error>(())
//! ```
//!
//! ## Features
//!
//! - `image` (default): still-image transmutation via the `image` crate
//! - `mock`: in-process controller for hardware-free testing

pub mod client;
pub mod config;
pub mod error;
#[cfg(feature = "mock")]
pub mod mock;
pub mod packet;
pub mod protocol;
pub mod queue;
pub mod selector;
pub mod service;
pub mod service_list;
pub mod stream;

// Re-export commonly used types
pub use client::{DisconnectEvent, DisconnectListener, DisconnectReason, ServiceClient};
pub use config::LinkConfig;
pub use error::{Error, Result};
pub use queue::{ServiceQueue, TransmuterRegistry};
pub use service::{RawPacket, Service, ServicePacket, StreamId};
pub use stream::{Mode, Stream, StreamKind, open_stream};
