//! Transport and session error types.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    /// Underlying socket error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Per-call deadline elapsed
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Only part of the buffer reached the socket
    #[error("partial write of {written} bytes: {source}")]
    PartialWrite {
        /// Bytes written before the failure
        written: usize,
        /// Error that stopped the write
        source: std::io::Error,
    },

    /// Transport already closed
    #[error("transport closed")]
    Closed,

    /// TLS version other than "1.0" or "1.2", or one the backend lacks
    #[error("unsupported TLS version: {0}")]
    UnsupportedTlsVersion(String),

    /// TLS setup or handshake failure
    #[error("TLS error: {0}")]
    Tls(String),

    /// Host part of the address is not a valid server name
    #[error("invalid server name: {0}")]
    InvalidServerName(String),
}

/// Error latched by a session; cheap to clone so it can be reported repeatedly
#[derive(Error, Debug, Clone)]
pub enum SessionError {
    /// Transport I/O failed during the conversation
    #[error(transparent)]
    Transport(Arc<TransportError>),

    /// No conversation was possible, typically because connecting failed
    #[error("{0:#}")]
    Failed(Arc<anyhow::Error>),
}

impl From<TransportError> for SessionError {
    fn from(err: TransportError) -> Self {
        SessionError::Transport(Arc::new(err))
    }
}

impl From<anyhow::Error> for SessionError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<SessionError>() {
            Ok(err) => err,
            Err(err) => match err.downcast::<TransportError>() {
                Ok(err) => err.into(),
                Err(err) => SessionError::Failed(Arc::new(err)),
            },
        }
    }
}
