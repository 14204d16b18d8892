use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::BoxError;

/// Driver error type.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The connection target could not be understood.
    #[error("invalid target: {0}")]
    InvalidTarget(String),

    /// The TCP connection or TLS handshake failed.
    #[error("connection: {0}")]
    Connection(#[source] io::Error),

    /// The peer selected no transport, or one we do not speak.
    #[error("unsupported transport: {}", .protocol.as_deref().unwrap_or("<none>"))]
    UnsupportedTransport {
        /// The identifier the peer selected, if any.
        protocol: Option<String>,
    },

    /// The peer closed the connection before a complete response arrived.
    #[error("connection closed by peer before the response was complete")]
    ConnectionClosed,

    /// A read did not complete within the configured deadline.
    #[error("read timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// Reading from or writing to an established connection failed.
    #[error("io: {0}")]
    Io(#[from] io::Error),

    /// Error reported by the protocol codec.
    #[error("codec: {0}")]
    Codec(#[source] BoxError),

    /// A session step was attempted out of order.
    #[error("{operation} is not valid in the {state} state")]
    InvalidState {
        /// The step that was attempted.
        operation: &'static str,

        /// The state the session was in.
        state: &'static str,
    },

    /// The session was already torn down.
    #[error("session is disconnected")]
    Disconnected,
}

impl Error {
    pub(crate) fn codec<E>(error: E) -> Self
    where
        E: Into<BoxError>,
    {
        Error::Codec(error.into())
    }

    /// Whether this error came from the connection attempt itself.
    pub fn is_connect(&self) -> bool {
        matches!(
            self,
            Error::Connection(_) | Error::UnsupportedTransport { .. } | Error::InvalidTarget(_)
        )
    }
}
