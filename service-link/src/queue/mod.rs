//! Typed, consumer-only views over raw packet queues
//!
//! A [`ServiceQueue<T>`] wraps the receiving end of the queue a
//! [`ServiceClient`](crate::client::ServiceClient) fills and converts each
//! payload to `T` only when it is dequeued. Packets that are never read are
//! never converted. The view has no producer operations; the client's sender
//! is the only way packets get in.
//!
//! Conversions come from a [`TransmuterRegistry`]. The built-in registry
//! knows:
//!
//! | Type | Payload |
//! |------|---------|
//! | `Vec<bool>` | one byte per value, non-zero is true |
//! | `Vec<i32>` | packed little-endian 32-bit integers |
//! | `Vec<f64>` | packed little-endian IEEE-754 doubles |
//! | `image::DynamicImage` | encoded still image (feature `image`) |

mod registry;
pub mod transmute;

pub use registry::TransmuterRegistry;

use crate::error::{Error, Result};
use crate::service::{RawPacket, ServicePacket};
use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};
use std::sync::Arc;
use std::time::Duration;

/// Payload conversion shared by queues of the same type
pub type Transmuter<T> = Arc<dyn Fn(&[u8]) -> Result<T> + Send + Sync>;

/// Lazily transmuting view of a raw packet queue
pub struct ServiceQueue<T> {
    backing: Receiver<RawPacket>,
    transmuter: Transmuter<T>,
}

impl<T> Clone for ServiceQueue<T> {
    fn clone(&self) -> Self {
        Self {
            backing: self.backing.clone(),
            transmuter: Arc::clone(&self.transmuter),
        }
    }
}

impl<T: 'static> ServiceQueue<T> {
    /// View `backing` through the built-in transmuter for `T`
    pub fn make(backing: Receiver<RawPacket>) -> Result<Self> {
        TransmuterRegistry::builtin().make(backing)
    }
}

impl<T> ServiceQueue<T> {
    /// View `backing` through a custom conversion
    pub fn new<F>(backing: Receiver<RawPacket>, transmute: F) -> Self
    where
        F: Fn(&[u8]) -> Result<T> + Send + Sync + 'static,
    {
        Self::with_transmuter(backing, Arc::new(transmute))
    }

    pub fn with_transmuter(backing: Receiver<RawPacket>, transmuter: Transmuter<T>) -> Self {
        Self {
            backing,
            transmuter,
        }
    }

    fn transmute(&self, packet: RawPacket) -> Result<ServicePacket<T>> {
        packet.try_map(|data| (self.transmuter)(&data))
    }

    /// Block until a packet is available
    pub fn take(&self) -> Result<ServicePacket<T>> {
        let packet = self.backing.recv().map_err(|_| Error::QueueClosed)?;
        self.transmute(packet)
    }

    /// Next packet if one is queued
    pub fn poll(&self) -> Result<Option<ServicePacket<T>>> {
        match self.backing.try_recv() {
            Ok(packet) => self.transmute(packet).map(Some),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(Error::QueueClosed),
        }
    }

    /// Wait up to `timeout` for a packet
    pub fn poll_timeout(&self, timeout: Duration) -> Result<Option<ServicePacket<T>>> {
        match self.backing.recv_timeout(timeout) {
            Ok(packet) => self.transmute(packet).map(Some),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(Error::QueueClosed),
        }
    }

    /// Move up to `max` queued packets into `out`
    ///
    /// Packets that fail to convert are skipped. Returns the number added.
    pub fn drain_to(&self, out: &mut Vec<ServicePacket<T>>, max: usize) -> usize {
        let mut added = 0;
        for packet in self.backing.try_iter().take(max) {
            let stream = packet.stream;
            match self.transmute(packet) {
                Ok(p) => {
                    out.push(p);
                    added += 1;
                }
                Err(e) => log::warn!("Dropping packet from {}: {}", stream, e),
            }
        }
        added
    }

    /// Packets waiting in the backing queue
    pub fn len(&self) -> usize {
        self.backing.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backing.is_empty()
    }

    /// Discard everything queued without converting it
    pub fn clear(&self) -> usize {
        self.backing.try_iter().count()
    }

    /// The raw queue this view reads from
    pub fn backing_queue(&self) -> &Receiver<RawPacket> {
        &self.backing
    }
}
