//! Common error types for hashrouter.
//!
//! This module provides a centralized Error enum using thiserror, with
//! conversions from the module-level errors of the framer and the share
//! validator.

use thiserror::Error;

use crate::stratum_v1::FrameError;
use crate::validator::ShareError;

/// Main error type for hashrouter operations.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors from tokio or std
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Protocol errors
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Pool communication errors
    #[error("Pool error: {0}")]
    Pool(String),

    /// Framing errors on a single connection
    #[error("Framing error: {0}")]
    Frame(#[from] FrameError),

    /// Rejected share submissions
    #[error("Share error: {0}")]
    Share(#[from] ShareError),

    /// The owning cancellation token fired
    #[error("cancelled")]
    Cancelled,

    /// Operation on a component that already reached its terminal state
    #[error("{0} is closed")]
    Closed(&'static str),
}

impl Error {
    /// Whether this error is a normal end of a connection rather than a
    /// failure worth reporting loudly.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Error::Cancelled => true,
            Error::Frame(e) => e.is_eof(),
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
            ),
            _ => false,
        }
    }
}

/// Convenience type alias for Results using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
