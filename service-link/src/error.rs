//! Error types for service-link

use crate::stream::Mode;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// service-link error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Remote end closed the connection (EOF or GOODBYE)
    #[error("Stream disconnected")]
    Disconnected,

    /// Malformed or unexpected bytes on the wire
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Operation not valid in the stream's current mode
    #[error("Cannot {operation} while stream is {mode}")]
    InvalidState {
        /// Operation that was attempted
        operation: &'static str,
        /// Mode the stream was in
        mode: Mode,
    },

    /// Streaming requested before a service was subscribed
    #[error("No service subscribed")]
    NotSubscribed,

    /// Invalid argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Bounded wait expired
    #[error("Operation timed out")]
    Timeout,

    /// Service listing could not be parsed
    #[error("XML error: {0}")]
    Xml(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Client has been closed
    #[error("Service client is closed")]
    ClientClosed,

    /// Backing queue has no producers left and is empty
    #[error("Service queue closed")]
    QueueClosed,

    /// Payload could not be converted
    #[error("Transmutation failed: {0}")]
    Transmutation(String),

    /// No transmuter registered for the requested type
    #[error("Transmutation not supported for {0}")]
    TransmutationNotSupported(&'static str),
}

impl Error {
    /// True when the error means the peer went away rather than misbehaved
    pub fn is_disconnect(&self) -> bool {
        match self {
            Error::Disconnected => true,
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

impl From<quick_xml::Error> for Error {
    fn from(e: quick_xml::Error) -> Self {
        Error::Xml(e.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<toml::ser::Error> for Error {
    fn from(e: toml::ser::Error) -> Self {
        Error::Config(e.to_string())
    }
}
