//! Idle-driven connection lifecycle for devlink.
//!
//! Devices that speak prompt-driven protocols usually drop idle connections at
//! the far end and expect a fresh connection on next use. This crate keeps a
//! connection open while it is in use, closes it after a configured idle
//! period and reopens it on demand.
//!
//! ## Components
//!
//! - **IdleTimer**: re-armable countdown watched by one background task
//! - **IdleManager**: lazily connected value that closes itself on expiry
//! - **OnDemandConnection**: facade that always returns a usable value
//!
//! ## Example
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use devlink_idle::{IdleReset, Managed, OnDemandConnection};
//! use std::time::Duration;
//!
//! struct Dialer;
//!
//! #[async_trait]
//! impl Managed for Dialer {
//!     type Conn = Result<u32, String>;
//!
//!     async fn connect(&self, _idle: IdleReset) -> anyhow::Result<Self::Conn> {
//!         Ok(Ok(7))
//!     }
//!
//!     async fn disconnect(&self, _conn: Self::Conn) -> anyhow::Result<()> {
//!         Ok(())
//!     }
//! }
//!
//! # async fn example() -> anyhow::Result<()> {
//! let link = OnDemandConnection::new(Dialer, |e| Err(e.to_string()));
//! link.set_keep_alive(Duration::from_secs(30));
//!
//! let conn = link.connection().await;
//! println!("connected: {:?}", conn);
//!
//! link.close().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod manager;
pub mod on_demand;
pub mod timer;

pub use error::IdleError;
pub use manager::{IdleManager, Managed};
pub use on_demand::{OnDemandConnection, CLOSE_TIMEOUT, DEFAULT_KEEP_ALIVE};
pub use timer::{ArmedCycle, IdleReset, IdleTimer, TimerState, WaitOutcome};
