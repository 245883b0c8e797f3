//! Error types for the connection layer.

use std::fmt;
use std::time::Duration;

use protocol::ProtocolError;
use thiserror::Error;

/// Why a connection ended.
///
/// Carried by [`Error::ConnectionClosed`] so every call that was still
/// outstanding learns the same cause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// `disconnect()` was called on this side.
    LocalDisconnect,
    /// The peer closed the socket cleanly.
    PeerClosed,
    /// Reading or writing the socket failed.
    Io(String),
    /// The peer violated the framing rules.
    Protocol(String),
    /// The handshake did not complete.
    Handshake(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::LocalDisconnect => f.write_str("disconnected locally"),
            CloseReason::PeerClosed => f.write_str("closed by peer"),
            CloseReason::Io(msg) => write!(f, "i/o error: {}", msg),
            CloseReason::Protocol(msg) => write!(f, "protocol violation: {}", msg),
            CloseReason::Handshake(msg) => write!(f, "handshake failed: {}", msg),
        }
    }
}

/// Connection layer error type.
#[derive(Debug, Error)]
pub enum Error {
    /// Framing or envelope failure.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The server certificate was not trusted.
    ///
    /// Recoverable: the caller may ask the user whether to retry with
    /// [`CertPolicy::Insecure`](crate::transport::CertPolicy::Insecure).
    #[error("certificate rejected: {reason}")]
    Certificate { reason: String },

    /// TLS configuration or handshake failure other than trust.
    #[error("tls error: {0}")]
    Tls(String),

    /// Socket failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Establishing the TCP connection took too long.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// A single request received no response in time.
    #[error("request {id} timed out after {after:?}")]
    Timeout { id: i32, after: Duration },

    /// A newer registration with the same id replaced this request.
    #[error("request {id} superseded by a newer request with the same id")]
    Superseded { id: i32 },

    /// The request was cancelled before a response arrived.
    #[error("request {id} cancelled")]
    Cancelled { id: i32 },

    /// The connection ended.
    #[error("connection closed: {0}")]
    ConnectionClosed(CloseReason),

    /// The CVID exchange failed or produced an invalid id.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The server refused the presented credentials.
    #[error("login failed: {0}")]
    LoginFailed(String),

    /// A stream with this id is already open on the connection.
    #[error("stream {0} already open")]
    StreamExists(i32),

    /// Stream ids must be odd.
    #[error("invalid stream id {0}: stream ids are odd")]
    InvalidStreamId(i32),
}

impl Error {
    /// Whether the error ends the connection rather than a single call.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Error::ConnectionClosed(_) | Error::Io(_) | Error::Tls(_) | Error::Certificate { .. }
        ) || matches!(self, Error::Protocol(e) if e.is_fatal())
    }
}

/// Result type alias for connection operations.
pub type Result<T> = std::result::Result<T, Error>;
