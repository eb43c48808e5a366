//! Error types for resp-pipeline.
//!
//! Errors fall into three groups:
//! - server error replies, which only ever fail the one command they answer
//! - framing faults, after which the read position can no longer be trusted
//! - transport faults (I/O, peer close, supervisor timeout)
//!
//! The last two are fatal for the connection and are delivered to every
//! pending command, which is why [`Error`] is `Clone`.

use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Main error type for all pipeline operations.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The server answered with an error frame (`-ERR ...`).
    #[error("server error: {0}")]
    Server(String),

    /// Malformed, oversized or unexpected reply framing.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// I/O failure on the underlying transport.
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    /// Connection closed by the peer or already torn down.
    #[error("connection closed")]
    Closed,

    /// A caller-side deadline elapsed before the reply arrived.
    #[error("request timed out")]
    Timeout,

    /// A request with no tokens was submitted.
    #[error("empty request")]
    EmptyRequest,

    /// The reply was well-formed but could not be converted to the requested type.
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),
}

impl Error {
    /// Whether this error ends the connection it was observed on.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Protocol(_) | Error::Io(_) | Error::Closed | Error::Timeout
        )
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
