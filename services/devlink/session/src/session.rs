//! Exclusive, error-latching conversation over a [`Transport`].
//!
//! A [`Session`] is handed out by a [`SessionManager`](crate::SessionManager)
//! and holds the device for one request/response exchange. Every I/O first
//! resets the idle timer and then calls the transport. The first failure is
//! latched: later writes become no-ops and later reads return the same error,
//! so a driver can issue several writes and a read and check once.

use bytes::Bytes;
use devlink_idle::IdleReset;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info_span, warn, Instrument, Span};

use crate::error::{SessionError, TransportError};
use crate::transport::Transport;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_session_id() -> u64 {
    NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Exclusivity held by a live session; released on drop
pub(crate) struct Exclusive {
    pub(crate) holder: Arc<AtomicU64>,
    pub(crate) _guard: OwnedMutexGuard<()>,
}

impl Drop for Exclusive {
    fn drop(&mut self) {
        self.holder.store(0, Ordering::SeqCst);
    }
}

/// Exclusive handle to a transport that latches the first error
pub struct Session {
    id: u64,
    transport: Option<Arc<dyn Transport>>,
    idle: IdleReset,
    err: Option<SessionError>,
    span: Span,
    _exclusive: Option<Exclusive>,
}

impl Session {
    pub(crate) fn live(
        id: u64,
        transport: Arc<dyn Transport>,
        idle: IdleReset,
        exclusive: Exclusive,
        span: Span,
    ) -> Self {
        Self {
            id,
            transport: Some(transport),
            idle,
            err: None,
            span,
            _exclusive: Some(exclusive),
        }
    }

    /// Session whose operations do nothing and whose [`Session::err`] is `err`
    pub fn error(err: impl Into<SessionError>) -> Self {
        let id = next_session_id();
        Self {
            id,
            transport: None,
            idle: IdleReset::noop(),
            err: Some(err.into()),
            span: info_span!("session", id),
            _exclusive: None,
        }
    }

    /// Process-unique identifier, assigned in acquisition order
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Span carrying this session's id, for correlating caller logs
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// First error seen by this session, if any
    pub fn err(&self) -> Option<&SessionError> {
        self.err.as_ref()
    }

    /// Write `buf`; no-op once an error is latched
    pub async fn send(&mut self, buf: &[u8]) {
        if let Ok(transport) = self.usable() {
            self.idle.reset();
            let result = transport.send(buf).instrument(self.span.clone()).await;
            self.record(result);
        }
    }

    /// Write `buf` without logging it; no-op once an error is latched
    pub async fn send_sensitive(&mut self, buf: &[u8]) {
        if let Ok(transport) = self.usable() {
            self.idle.reset();
            let result = transport.send_sensitive(buf).instrument(self.span.clone()).await;
            self.record(result);
        }
    }

    /// Read until the input ends with one of `expected`.
    ///
    /// Returns the latched error without touching the transport once one
    /// exists; a new failure is latched before it is returned.
    pub async fn read_until<S: AsRef<[u8]>>(&mut self, expected: &[S]) -> Result<Bytes, SessionError> {
        let transport = self.usable()?;
        self.idle.reset();

        let expected: Vec<&[u8]> = expected.iter().map(|sentinel| sentinel.as_ref()).collect();
        match transport.read_until(&expected).instrument(self.span.clone()).await {
            Ok(bytes) => Ok(bytes),
            Err(e) => Err(self.latch(e.into())),
        }
    }

    /// Give the transport back to the session manager
    pub fn release(self) {}

    fn usable(&self) -> Result<Arc<dyn Transport>, SessionError> {
        match (&self.err, &self.transport) {
            (Some(err), _) => Err(err.clone()),
            (None, Some(transport)) => Ok(transport.clone()),
            (None, None) => Err(TransportError::Closed.into()),
        }
    }

    fn record(&mut self, result: Result<usize, TransportError>) {
        if let Err(e) = result {
            self.latch(e.into());
        }
    }

    fn latch(&mut self, err: SessionError) -> SessionError {
        warn!(parent: &self.span, "Session {} failed: {}", self.id, err);
        self.err.get_or_insert(err).clone()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self._exclusive.is_some() {
            debug!(parent: &self.span, "Session {} released", self.id);
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("err", &self.err)
            .field("live", &self.transport.is_some())
            .finish()
    }
}
