//! Read-readiness selector with cross-thread registration
//!
//! The selector is owned by exactly one thread (the client's I/O thread, or
//! a caller waiting for a LISTXML reply). Other threads never touch its key
//! set directly: they hand registrations to a [`Registrar`], which queues them
//! and wakes the selector. The owner applies queued registrations with
//! [`Selector::register_pending`] between select calls.
//!
//! # Readiness
//!
//! Registered sockets must be non-blocking. Readiness is probed with a
//! one-byte `peek`: data available, end of stream and socket errors all count
//! as ready so the owner observes them through its next read. Idle sockets
//! are re-probed every poll interval until the select timeout expires or the
//! selector is woken.
//!
//! ```text
//!  begin() thread                  I/O thread
//!  ──────────────                  ──────────
//!  registrar.register(id, src) ─┐
//!                               ├─► pending queue
//!  registrar.wakeup() ──────────┴─► select() returns early
//!                                   register_pending()
//!                                   select() ... ready ids
//! ```

use crate::error::{Error, Result};
use crate::service::StreamId;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
use std::io::ErrorKind;
use std::net::{TcpStream, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Socket whose readability is watched
#[derive(Debug)]
pub enum Source {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

impl Source {
    fn is_ready(&self) -> bool {
        let mut probe = [0u8; 1];
        let result = match self {
            Source::Tcp(socket) => socket.peek(&mut probe),
            Source::Udp(socket) => socket.peek(&mut probe),
        };
        match result {
            Ok(_) => true,
            Err(e) => e.kind() != ErrorKind::WouldBlock && e.kind() != ErrorKind::Interrupted,
        }
    }
}

#[derive(Debug)]
struct SelectionKey {
    token: StreamId,
    source: Source,
    cancelled: Arc<AtomicBool>,
}

/// Handle for removing a registration
#[derive(Debug, Clone)]
pub struct KeyHandle {
    cancelled: Arc<AtomicBool>,
}

impl KeyHandle {
    /// Drop the registration before the next select
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Cloneable, thread-safe front door to a [`Selector`]
#[derive(Debug, Clone)]
pub struct Registrar {
    pending: Sender<SelectionKey>,
    wake: Sender<()>,
}

impl Registrar {
    /// Queue a registration and wake the selector
    pub fn register(&self, token: StreamId, source: Source) -> Result<KeyHandle> {
        let cancelled = Arc::new(AtomicBool::new(false));
        let key = SelectionKey {
            token,
            source,
            cancelled: Arc::clone(&cancelled),
        };
        self.pending.send(key).map_err(|_| Error::ClientClosed)?;
        self.wakeup();
        log::debug!("Queued selector registration for {}", token);
        Ok(KeyHandle { cancelled })
    }

    /// Make a blocked `select` return
    pub fn wakeup(&self) {
        // A wake already pending is as good as a new one
        self.wake.try_send(()).ok();
    }
}

/// Polled readiness selector
#[derive(Debug)]
pub struct Selector {
    keys: Vec<SelectionKey>,
    pending: Receiver<SelectionKey>,
    wake: Receiver<()>,
    registrar: Registrar,
    poll_interval: Duration,
}

impl Selector {
    pub fn new(poll_interval: Duration) -> Self {
        let (pending_tx, pending_rx) = unbounded();
        let (wake_tx, wake_rx) = bounded(1);
        Self {
            keys: Vec::new(),
            pending: pending_rx,
            wake: wake_rx,
            registrar: Registrar {
                pending: pending_tx,
                wake: wake_tx,
            },
            poll_interval: poll_interval.max(Duration::from_millis(1)),
        }
    }

    pub fn registrar(&self) -> Registrar {
        self.registrar.clone()
    }

    /// Register directly from the owning thread
    pub fn register(&mut self, token: StreamId, source: Source) -> KeyHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        self.keys.push(SelectionKey {
            token,
            source,
            cancelled: Arc::clone(&cancelled),
        });
        KeyHandle { cancelled }
    }

    /// Apply queued registrations; returns how many were added
    pub fn register_pending(&mut self) -> usize {
        let mut added = 0;
        for key in self.pending.try_iter() {
            if key.cancelled.load(Ordering::Acquire) {
                continue;
            }
            log::debug!("Registered {} with selector", key.token);
            self.keys.push(key);
            added += 1;
        }
        added
    }

    /// Number of live registrations
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Wait up to `timeout` for registered sources to become readable
    ///
    /// Returns the ready tokens, or an empty list on timeout or wakeup.
    pub fn select(&mut self, timeout: Duration) -> Vec<StreamId> {
        let deadline = Instant::now() + timeout;
        loop {
            self.keys.retain(|k| !k.cancelled.load(Ordering::Acquire));

            let ready: Vec<StreamId> = self
                .keys
                .iter()
                .filter(|k| k.source.is_ready())
                .map(|k| k.token)
                .collect();
            if !ready.is_empty() {
                return ready;
            }

            let now = Instant::now();
            if now >= deadline {
                return Vec::new();
            }
            match self.wake.recv_timeout(self.poll_interval.min(deadline - now)) {
                Ok(()) => return Vec::new(),
                Err(RecvTimeoutError::Timeout) => {}
                // Unreachable while we hold a registrar, but never spin
                Err(RecvTimeoutError::Disconnected) => return Vec::new(),
            }
        }
    }

    /// Drop every registration, queued ones included
    pub fn close(&mut self) {
        self.keys.clear();
        for _ in self.pending.try_iter() {}
    }
}
