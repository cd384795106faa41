//! Gateway error types.
//!
//! Error handling for the framing codec, buffer pool, and the
//! frontend/backend gateway components. Transport failures are terminal for
//! the connection that produced them; configuration problems are surfaced to
//! the immediate caller and never crash the process.

use std::net::SocketAddr;
use thiserror::Error;

/// Main gateway error type
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Configuration errors (invalid frame width, bad pool sizing, ...)
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Connection-level errors (dial, accept, handshake transport)
    #[error("Connection error: {message} (remote: {remote_addr:?})")]
    Connection {
        message: String,
        remote_addr: Option<SocketAddr>,
        source: Option<std::io::Error>,
    },

    /// Handshake protocol errors (missing or malformed handshake frame)
    #[error("Handshake error: {message}")]
    Handshake { message: String },

    /// Generic I/O errors on an established connection
    #[error("I/O error: {message}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// Buffer pool refused an allocation
    #[error("Pool refused allocation of {requested} bytes (max {max})")]
    PoolExhausted { requested: usize, max: usize },

    /// Payload does not fit the configured length-prefix width
    #[error("Payload of {len} bytes exceeds frame width capacity {max}")]
    FrameTooLarge { len: usize, max: u64 },

    /// Unicast target does not resolve to any attached link
    #[error("Client {client_id:#010x} is not reachable through any link")]
    ClientUnreachable { client_id: u32 },

    /// Broadcast refused: the slot table holds no attached link at all
    #[error("No links attached")]
    NoLinks,

    /// Operation on a component that has been closed
    #[error("Component is closed")]
    Closed,
}

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

impl GatewayError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a connection error
    pub fn connection(message: impl Into<String>, remote_addr: Option<SocketAddr>) -> Self {
        Self::Connection {
            message: message.into(),
            remote_addr,
            source: None,
        }
    }

    /// Create a connection error with its I/O source
    pub fn connection_with_source(
        message: impl Into<String>,
        remote_addr: Option<SocketAddr>,
        source: std::io::Error,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            remote_addr,
            source: Some(source),
        }
    }

    /// Create a handshake error
    pub fn handshake(message: impl Into<String>) -> Self {
        Self::Handshake {
            message: message.into(),
        }
    }

    /// Create an I/O error
    pub fn io(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            message: message.into(),
            source,
        }
    }

    /// True when the error means "this connection is over"
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::Handshake { .. } | Self::Io { .. }
        )
    }
}
