//! Prompt-terminated TCP/TLS transports and exclusive sessions for devlink.
//!
//! Automation devices typically accept one conversation at a time and frame
//! their replies with a terminating prompt. This crate provides the byte
//! transport for such devices and the session layer that keeps conversations
//! from interleaving.
//!
//! ## Features
//!
//! - **Transport**: bounded writes, prompt-terminated reads, redacted writes
//! - **TCP/TLS dialers**: plain TCP and, with the `tls` feature, TLS 1.2
//! - **Sessions**: exclusive, error-latching conversations that reset the idle
//!   timer on every I/O
//! - **Link**: cloneable connection value for idle-managed drivers
//!
//! ## Example
//!
//! ```rust,no_run
//! use devlink_idle::IdleReset;
//! use devlink_session::{dial_tcp, Link};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let transport = dial_tcp("10.0.0.5:23", Duration::from_secs(5)).await?;
//! let link = Link::new(Arc::new(transport), IdleReset::noop());
//!
//! let mut session = link.session().await;
//! session.send(b"show version\r\n").await;
//! let output = session.read_until(&["# ", "> "]).await?;
//! session.release();
//!
//! println!("{}", String::from_utf8_lossy(&output));
//! link.close().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod link;
pub mod manager;
pub mod session;
pub mod transport;

pub use error::{SessionError, TransportError};
pub use link::Link;
pub use manager::{SessionManager, ACQUIRE_WARN_AFTER};
pub use session::Session;
pub use transport::{connect_tcp, dial_tcp, IoStream, StreamTransport, TlsVersion, Transport};

#[cfg(feature = "tls")]
pub use transport::dial_tls;
