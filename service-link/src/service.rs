//! Service descriptions and timestamped packets

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

/// Format reported for services whose format was never announced
pub const UNKNOWN_FORMAT: &str = "unknown";

/// A named remote data source published by the controller
///
/// Two services are equal when both name and format match; the description
/// is informational only.
#[derive(Debug, Clone, Eq)]
pub struct Service {
    name: String,
    format: String,
    description: Option<String>,
}

impl Service {
    /// Create a service; `format` is stored lower-case
    pub fn new(
        name: impl Into<String>,
        format: impl AsRef<str>,
        description: Option<String>,
    ) -> Self {
        Self {
            name: name.into(),
            format: format.as_ref().to_lowercase(),
            description,
        }
    }

    /// Service known only by name (format `"unknown"`)
    pub fn named(name: impl Into<String>) -> Self {
        Self::new(name, UNKNOWN_FORMAT, None)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn format(&self) -> &str {
        &self.format
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }
}

impl PartialEq for Service {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.format == other.format
    }
}

impl Hash for Service {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.format.hash(state);
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.format)
    }
}

/// Process-unique stream identifier
///
/// Assigned when a stream is constructed and used by the client to route
/// packets and disconnect events back to their stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(u64);

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

impl StreamId {
    pub(crate) fn next() -> Self {
        Self(NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream-{}", self.0)
    }
}

/// One timestamped payload of a service
#[derive(Debug, Clone, PartialEq)]
pub struct ServicePacket<T> {
    /// Service the payload belongs to
    pub service: Service,
    /// Stream that produced the packet
    pub stream: StreamId,
    /// Controller timestamp in microseconds
    pub timestamp_us: i64,
    pub data: T,
}

/// Packet as reassembled off the wire
pub type RawPacket = ServicePacket<Vec<u8>>;

impl<T> ServicePacket<T> {
    pub fn new(service: Service, stream: StreamId, timestamp_us: i64, data: T) -> Self {
        Self {
            service,
            stream,
            timestamp_us,
            data,
        }
    }

    /// Replace the payload, keeping service, stream and timestamp
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ServicePacket<U> {
        ServicePacket {
            service: self.service,
            stream: self.stream,
            timestamp_us: self.timestamp_us,
            data: f(self.data),
        }
    }

    /// Fallible variant of [`map`](Self::map)
    pub fn try_map<U, E>(self, f: impl FnOnce(T) -> Result<U, E>) -> Result<ServicePacket<U>, E> {
        Ok(ServicePacket {
            service: self.service,
            stream: self.stream,
            timestamp_us: self.timestamp_us,
            data: f(self.data)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_format_is_lowercased() {
        let s = Service::new("battery", "BOOLS", Some("Battery flags".to_string()));
        assert_eq!(s.format(), "bools");
        assert_eq!(s.description(), Some("Battery flags"));
    }

    #[test]
    fn test_equality_ignores_description() {
        let a = Service::new("cam", "jpeg", Some("front".to_string()));
        let b = Service::new("cam", "JPEG", None);
        let c = Service::new("cam", "png", None);
        assert_eq!(a, b);
        assert_ne!(a, c);

        let set: HashSet<_> = [a, b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_named_service() {
        let s = Service::named("gps");
        assert_eq!(s.format(), UNKNOWN_FORMAT);
        assert!(s.description().is_none());
    }

    #[test]
    fn test_stream_ids_are_unique() {
        let a = StreamId::next();
        let b = StreamId::next();
        assert_ne!(a, b);
    }

    #[test]
    fn test_packet_map() {
        let packet = ServicePacket::new(Service::named("x"), StreamId::next(), 42, vec![1u8, 0, 3]);
        let mapped = packet.map(|d| d.len());
        assert_eq!(mapped.data, 3);
        assert_eq!(mapped.timestamp_us, 42);
    }
}
