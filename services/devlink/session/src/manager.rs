//! One-at-a-time session issuing for a single device.
//!
//! A [`SessionManager`] holds its lock from the moment a [`Session`] is issued
//! until that session is released or dropped, so a transport never carries two
//! interleaved conversations.

use devlink_idle::IdleReset;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::timeout;
use tracing::{debug, info_span, warn, Span};

use crate::session::{next_session_id, Exclusive, Session};
use crate::transport::Transport;

/// How long an acquisition may wait before a warning names the holder
pub const ACQUIRE_WARN_AFTER: Duration = Duration::from_secs(30);

/// Issues exclusive sessions; clones share the same lock
#[derive(Clone, Debug, Default)]
pub struct SessionManager {
    lock: Arc<Mutex<()>>,
    /// Id of the session currently holding the lock, 0 when free
    holder: Arc<AtomicU64>,
}

impl SessionManager {
    /// Create a manager with no outstanding session
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until no other session is outstanding, then issue one
    pub async fn new_session(&self, transport: Arc<dyn Transport>, idle: IdleReset) -> Session {
        self.new_session_in(&Span::current(), transport, idle).await
    }

    /// Like [`Self::new_session`], with the session span parented on `parent`
    /// so caller logs and session logs share the session id
    pub async fn new_session_in(
        &self,
        parent: &Span,
        transport: Arc<dyn Transport>,
        idle: IdleReset,
    ) -> Session {
        let guard = self.acquire().await;
        let id = next_session_id();
        self.holder.store(id, Ordering::SeqCst);

        let span = info_span!(parent: parent, "session", id);
        debug!(parent: &span, "Session {} acquired", id);

        let exclusive = Exclusive {
            holder: self.holder.clone(),
            _guard: guard,
        };
        Session::live(id, transport, idle, exclusive, span)
    }

    /// Whether a session is currently outstanding
    pub fn is_busy(&self) -> bool {
        self.lock.try_lock().is_err()
    }

    /// Id of the outstanding session, if any
    pub fn holder(&self) -> Option<u64> {
        match self.holder.load(Ordering::SeqCst) {
            0 => None,
            id => Some(id),
        }
    }

    async fn acquire(&self) -> OwnedMutexGuard<()> {
        let lock = self.lock.clone().lock_owned();
        tokio::pin!(lock);

        loop {
            match timeout(ACQUIRE_WARN_AFTER, &mut lock).await {
                Ok(guard) => return guard,
                Err(_) => warn!(
                    "Still waiting for session {} to be released",
                    self.holder.load(Ordering::SeqCst)
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::MockTransport;
    use tokio::time::{sleep, Instant};

    fn transport() -> Arc<dyn Transport> {
        Arc::new(MockTransport::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_session_waits_for_release() {
        let sessions = SessionManager::new();
        let a = sessions.new_session(transport(), IdleReset::noop()).await;
        assert!(sessions.is_busy());
        assert_eq!(sessions.holder(), Some(a.id()));

        let waiter = {
            let sessions = sessions.clone();
            tokio::spawn(async move {
                let b = sessions.new_session(transport(), IdleReset::noop()).await;
                (Instant::now(), b.id())
            })
        };

        sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        let released_at = Instant::now();
        a.release();

        let (acquired_at, b_id) = waiter.await.unwrap();
        assert!(acquired_at >= released_at);
        assert_ne!(b_id, 0);
        assert!(!sessions.is_busy());
        assert_eq!(sessions.holder(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_at_most_one_outstanding_session() {
        let sessions = SessionManager::new();
        let active = Arc::new(AtomicU64::new(0));
        let peak = Arc::new(AtomicU64::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let sessions = sessions.clone();
            let active = active.clone();
            let peak = peak.clone();
            tasks.push(tokio::spawn(async move {
                let mut session = sessions.new_session(transport(), IdleReset::noop()).await;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);

                session.send(b"cmd\r\n").await;
                sleep(Duration::from_millis(3)).await;

                active.fetch_sub(1, Ordering::SeqCst);
                session.release();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_session_releases() {
        let sessions = SessionManager::new();
        {
            let _session = sessions.new_session(transport(), IdleReset::noop()).await;
            assert!(sessions.is_busy());
        }
        assert!(!sessions.is_busy());
        let _again = sessions.new_session(transport(), IdleReset::noop()).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_span_is_parented() {
        let sessions = SessionManager::new();
        let parent = info_span!("driver", device = "rtr1");
        let session = sessions
            .new_session_in(&parent, transport(), IdleReset::noop())
            .await;
        assert!(session.id() > 0);
    }
}
