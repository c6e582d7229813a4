//! Connection facade that always hands back a usable value.
//!
//! [`OnDemandConnection`] builds its [`IdleManager`] on first use and turns
//! connect failures into an error-carrying connection value produced by a
//! caller-supplied constructor. Call sites can therefore issue their
//! send/send/read sequence unconditionally and inspect the error once.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::IdleError;
use crate::manager::{IdleManager, Managed};
use crate::timer::IdleTimer;

/// Idle period used when [`OnDemandConnection::set_keep_alive`] is never called
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(30);

/// Upper bound on waiting for the idle watcher in [`OnDemandConnection::close`]
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(60);

type ErrorCtor<C> = Box<dyn Fn(anyhow::Error) -> C + Send + Sync>;

struct Slot<M: Managed> {
    keep_alive: Duration,
    manager: Option<IdleManager<Arc<M>>>,
}

/// Lazily connecting, idle-closing connection that never returns nothing
pub struct OnDemandConnection<M: Managed> {
    managed: Arc<M>,
    err_ctor: ErrorCtor<M::Conn>,
    slot: Mutex<Slot<M>>,
}

impl<M: Managed> OnDemandConnection<M> {
    /// Create a facade; `err_ctor` turns a connect failure into a connection
    /// value whose operations fail with that error
    pub fn new<F>(managed: M, err_ctor: F) -> Self
    where
        F: Fn(anyhow::Error) -> M::Conn + Send + Sync + 'static,
    {
        Self {
            managed: Arc::new(managed),
            err_ctor: Box::new(err_ctor),
            slot: Mutex::new(Slot {
                keep_alive: DEFAULT_KEEP_ALIVE,
                manager: None,
            }),
        }
    }

    /// Idle period for the timer created on first use.
    ///
    /// Once the first [`Self::connection`] call has created the timer, later
    /// values are recorded but do not change it.
    pub fn set_keep_alive(&self, keep_alive: Duration) {
        let mut slot = self.lock();
        if slot.manager.is_some() {
            debug!("Keep-alive {:?} recorded after first use, timer unchanged", keep_alive);
        }
        slot.keep_alive = keep_alive;
    }

    /// Configured keep-alive
    pub fn keep_alive(&self) -> Duration {
        self.lock().keep_alive
    }

    /// Live connection, or the error constructor's value if connecting failed
    pub async fn connection(&self) -> M::Conn {
        let manager = match self.manager() {
            Ok(manager) => manager,
            Err(e) => return (self.err_ctor)(e.into()),
        };

        match manager.connection().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("On-demand connect failed: {:#}", e);
                (self.err_ctor)(e)
            }
        }
    }

    /// Disconnect and stop the idle watcher; no-op if never used
    pub async fn close(&self) -> Result<(), IdleError> {
        let manager = self.lock().manager.clone();
        match manager {
            Some(manager) => manager.stop(CLOSE_TIMEOUT).await,
            None => Ok(()),
        }
    }

    fn manager(&self) -> Result<IdleManager<Arc<M>>, IdleError> {
        let mut slot = self.lock();
        if let Some(manager) = slot.manager.as_ref() {
            return Ok(manager.clone());
        }

        let manager = IdleManager::new(self.managed.clone(), IdleTimer::new(slot.keep_alive)?);
        slot.manager = Some(manager.clone());
        Ok(manager)
    }

    fn lock(&self) -> MutexGuard<'_, Slot<M>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
