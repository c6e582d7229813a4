//! Cloneable device connection value for idle-managed drivers.
//!
//! A [`Link`] is what a driver's `Managed::connect` returns: the transport,
//! the session manager guarding it and the idle reset handle. A link built with
//! [`Link::failed`] carries a connect error instead and hands out error
//! sessions, which makes it the natural error constructor for an
//! `OnDemandConnection`.

use devlink_idle::IdleReset;
use std::fmt;
use std::sync::Arc;

use crate::error::{SessionError, TransportError};
use crate::manager::SessionManager;
use crate::session::Session;
use crate::transport::Transport;

struct LiveLink {
    transport: Arc<dyn Transport>,
    sessions: SessionManager,
    idle: IdleReset,
}

#[derive(Clone)]
enum LinkState {
    Live(Arc<LiveLink>),
    Failed(SessionError),
}

/// Connection to one device: live, or failed with the error that prevented it
#[derive(Clone)]
pub struct Link {
    state: LinkState,
}

impl Link {
    /// Live link over `transport`; sessions reset `idle` on every I/O
    pub fn new(transport: Arc<dyn Transport>, idle: IdleReset) -> Self {
        Self {
            state: LinkState::Live(Arc::new(LiveLink {
                transport,
                sessions: SessionManager::new(),
                idle,
            })),
        }
    }

    /// Link whose sessions all fail with `err`
    pub fn failed(err: impl Into<SessionError>) -> Self {
        Self {
            state: LinkState::Failed(err.into()),
        }
    }

    /// Connect error carried by a failed link
    pub fn err(&self) -> Option<&SessionError> {
        match &self.state {
            LinkState::Live(_) => None,
            LinkState::Failed(err) => Some(err),
        }
    }

    /// Exclusive session on this link, or an error session if the link failed
    pub async fn session(&self) -> Session {
        match &self.state {
            LinkState::Live(live) => {
                live.sessions
                    .new_session(live.transport.clone(), live.idle.clone())
                    .await
            }
            LinkState::Failed(err) => Session::error(err.clone()),
        }
    }

    /// Close the underlying transport; failed links have nothing to close
    pub async fn close(&self) -> Result<(), TransportError> {
        match &self.state {
            LinkState::Live(live) => live.transport.close().await,
            LinkState::Failed(_) => Ok(()),
        }
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state {
            LinkState::Live(live) => f
                .debug_struct("Link")
                .field("busy", &live.sessions.is_busy())
                .finish(),
            LinkState::Failed(err) => f.debug_struct("Link").field("err", err).finish(),
        }
    }
}
