//! Lazily connected resource that closes itself after an idle period.
//!
//! [`IdleManager`] pairs a caller-supplied [`Managed`] connection factory with
//! an [`IdleTimer`]. The first [`IdleManager::connection`] call connects and
//! spawns one watcher task; when the timer expires the watcher disconnects and
//! the next call connects again. The watcher lifetime is exactly one idle cycle.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::error::IdleError;
use crate::timer::{ArmedCycle, IdleReset, IdleTimer};

/// Opens and closes the connection an [`IdleManager`] looks after
#[async_trait]
pub trait Managed: Send + Sync + 'static {
    /// Connection value handed to every caller until the next disconnect
    type Conn: Clone + Send + Sync + 'static;

    /// Open a new connection; `idle` must be reset on every I/O
    async fn connect(&self, idle: IdleReset) -> anyhow::Result<Self::Conn>;

    /// Close a connection previously returned by [`Managed::connect`]
    async fn disconnect(&self, conn: Self::Conn) -> anyhow::Result<()>;
}

#[async_trait]
impl<M: Managed> Managed for Arc<M> {
    type Conn = M::Conn;

    async fn connect(&self, idle: IdleReset) -> anyhow::Result<Self::Conn> {
        (**self).connect(idle).await
    }

    async fn disconnect(&self, conn: Self::Conn) -> anyhow::Result<()> {
        (**self).disconnect(conn).await
    }
}

/// Live connection and the idle cycle watching it
struct Watched<C> {
    cycle: u64,
    conn: C,
}

struct Inner<M: Managed> {
    managed: M,
    timer: IdleTimer,
    conn: Mutex<Option<Watched<M::Conn>>>,
    /// Handed to watchers instead of any caller's cancellation
    detached: CancellationToken,
}

impl<M: Managed> Inner<M> {
    /// Expiry callback of `cycle`; a connection armed under a later cycle is
    /// left alone
    async fn expired(&self, cycle: u64) {
        let mut slot = self.conn.lock().await;
        match slot.as_ref() {
            Some(watched) if watched.cycle == cycle => {}
            Some(watched) => {
                debug!(
                    "Idle cycle {} ended, connection now watched by cycle {}",
                    cycle, watched.cycle
                );
                return;
            }
            None => return,
        }

        if let Some(watched) = slot.take() {
            info!("Idle for {:?}, disconnecting", self.timer.idle());
            if let Err(e) = self.managed.disconnect(watched.conn).await {
                warn!("Idle disconnect failed: {:#}", e);
            }
        }
    }
}

impl<M: Managed> Drop for Inner<M> {
    fn drop(&mut self) {
        self.detached.cancel();
    }
}

/// Connection that is opened on first use and closed after an idle period
pub struct IdleManager<M: Managed> {
    inner: Arc<Inner<M>>,
}

impl<M: Managed> Clone for IdleManager<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<M: Managed> IdleManager<M> {
    /// Create a manager; nothing is connected until [`Self::connection`]
    pub fn new(managed: M, timer: IdleTimer) -> Self {
        Self {
            inner: Arc::new(Inner {
                managed,
                timer,
                conn: Mutex::new(None),
                detached: CancellationToken::new(),
            }),
        }
    }

    /// Timer driving this manager
    pub fn timer(&self) -> &IdleTimer {
        &self.inner.timer
    }

    /// Whether a connection is currently held
    pub async fn is_connected(&self) -> bool {
        self.inner.conn.lock().await.is_some()
    }

    /// Return the cached connection, connecting first if there is none.
    ///
    /// Connect failures are returned unchanged and leave the manager
    /// disconnected, so the next call retries from scratch. If the timer is
    /// already watched outside this manager the fresh connection is closed
    /// again and [`IdleError::WatcherRunning`] is returned.
    pub async fn connection(&self) -> anyhow::Result<M::Conn> {
        let mut slot = self.inner.conn.lock().await;
        if let Some(watched) = slot.as_ref() {
            return Ok(watched.conn.clone());
        }

        let conn = self.inner.managed.connect(self.inner.timer.handle()).await?;
        let cycle = match self.inner.timer.arm() {
            Ok(cycle) => cycle,
            Err(e) => {
                if let Err(close_err) = self.inner.managed.disconnect(conn).await {
                    warn!("Disconnect of unwatched connection failed: {:#}", close_err);
                }
                return Err(e.into());
            }
        };

        *slot = Some(Watched {
            cycle: cycle.id(),
            conn: conn.clone(),
        });
        self.spawn_watcher(cycle);

        info!("Connected, closing after {:?} idle", self.inner.timer.idle());
        Ok(conn)
    }

    /// Signal the watcher and disconnect if connected, then wait for the
    /// watcher to return within `timeout`.
    ///
    /// Both steps always run; a disconnect error is reported in preference to
    /// a stop timeout.
    pub async fn stop(&self, timeout: Duration) -> Result<(), IdleError> {
        let (ack, disconnected) = {
            let mut slot = self.inner.conn.lock().await;
            // Requested under the lock so a reconnect queued behind us arms a
            // cycle this stop cannot touch
            let ack = self.inner.timer.request_stop();
            let disconnected = match slot.take() {
                Some(watched) => {
                    debug!("Stopping, disconnecting");
                    self.inner
                        .managed
                        .disconnect(watched.conn)
                        .await
                        .map_err(IdleError::Disconnect)
                }
                None => Ok(()),
            };
            (ack, disconnected)
        };

        let stopped = match ack {
            Some(ack) => ack.wait(timeout).await,
            None => Ok(()),
        };
        disconnected.and(stopped)
    }

    /// `cycle` is armed before the spawn so a `stop` racing the new task
    /// still finds it
    fn spawn_watcher(&self, cycle: ArmedCycle) {
        let cycle_id = cycle.id();
        let detached = self.inner.detached.clone();
        let manager = Arc::downgrade(&self.inner);
        let span = info_span!("idle_watcher", cycle = cycle_id, idle = ?self.inner.timer.idle());

        tokio::spawn(
            async move {
                let on_expire = move || async move {
                    if let Some(inner) = manager.upgrade() {
                        inner.expired(cycle_id).await;
                    }
                };
                let outcome = cycle.run(&detached, on_expire).await;
                debug!(?outcome, "Idle watcher finished");
            }
            .instrument(span),
        );
    }
}
