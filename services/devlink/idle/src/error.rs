//! Idle lifecycle error types.

use std::time::Duration;
use thiserror::Error;

/// Errors raised by idle timers and idle-managed connections
#[derive(Error, Debug)]
pub enum IdleError {
    /// Idle duration was zero
    #[error("idle duration must be positive, got {0:?}")]
    InvalidDuration(Duration),

    /// A countdown is already being watched
    #[error("idle watcher already running")]
    WatcherRunning,

    /// The watcher did not acknowledge a stop request in time
    #[error("idle watcher did not stop within {0:?}")]
    StopTimeout(Duration),

    /// Closing the managed connection failed
    #[error("disconnect failed: {0:#}")]
    Disconnect(anyhow::Error),
}
