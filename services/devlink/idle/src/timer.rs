//! Re-armable idle countdown with a single background watcher.
//!
//! An [`IdleTimer`] counts down from a fixed idle duration. Traffic pushes the
//! deadline out through [`IdleTimer::reset`] or a detached [`IdleReset`] handle.
//! A watcher task parked in [`IdleTimer::wait`] runs the expiry callback once
//! the deadline passes without a reset, and the owner can stop that watcher
//! with [`IdleTimer::stop_wait`].
//!
//! Every call to `wait` arms a fresh cycle with its own stop signal and its own
//! stopped-acknowledgement, so a watcher that is still finishing an expiry
//! callback never observes the signals of the cycle that replaced it.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::IdleError;

/// Lifecycle of the watcher attached to an [`IdleTimer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    /// No watcher has run yet
    Idle,
    /// A watcher is counting down
    Running,
    /// The last countdown elapsed and its callback returned
    Expired,
    /// The last watcher was stopped or cancelled before expiry
    Stopped,
}

/// How a call to [`IdleTimer::wait`] ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The countdown elapsed and the expiry callback ran
    Expired,
    /// The cancellation token fired first
    Cancelled,
    /// [`IdleTimer::stop_wait`] was requested
    Stopped,
}

/// One armed countdown
struct Cycle {
    id: u64,
    deadline: Instant,
    stop: Option<oneshot::Sender<()>>,
    stopped: watch::Receiver<bool>,
    /// Deadline passed or a stop was requested; resets no longer apply and a
    /// new cycle may be armed
    ending: bool,
}

struct State {
    phase: TimerState,
    cycle: Option<Cycle>,
    next_cycle: u64,
}

struct Shared {
    idle: Duration,
    state: Mutex<State>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reset(&self) {
        let mut state = self.lock();
        if let Some(cycle) = state.cycle.as_mut().filter(|cycle| !cycle.ending) {
            cycle.deadline = Instant::now() + self.idle;
        }
    }

    fn deadline(&self, cycle_id: u64) -> Option<Instant> {
        self.lock()
            .cycle
            .as_ref()
            .filter(|cycle| cycle.id == cycle_id && !cycle.ending)
            .map(|cycle| cycle.deadline)
    }

    /// Marks the cycle expired if its deadline has really passed
    fn try_expire(&self, cycle_id: u64) -> bool {
        let mut state = self.lock();
        match state.cycle.as_mut() {
            Some(cycle)
                if cycle.id == cycle_id && !cycle.ending && Instant::now() >= cycle.deadline =>
            {
                cycle.ending = true;
                true
            }
            _ => false,
        }
    }
}

/// Ends a watcher cycle, also when the cycle is dropped early
struct Finish {
    shared: Arc<Shared>,
    cycle: u64,
    ack: Option<watch::Sender<bool>>,
    end: TimerState,
}

impl Drop for Finish {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        if state.cycle.as_ref().is_some_and(|cycle| cycle.id == self.cycle) {
            state.cycle = None;
            state.phase = self.end;
        }
        drop(state);

        if let Some(ack) = self.ack.take() {
            ack.send_replace(true);
        }
    }
}

/// Idle countdown shared between the connection owner and its watcher task.
///
/// Cloning is cheap; all clones drive the same countdown.
#[derive(Clone)]
pub struct IdleTimer {
    shared: Arc<Shared>,
}

impl IdleTimer {
    /// Create a timer that expires after `idle` without traffic.
    ///
    /// A zero duration is a programming error and is rejected.
    pub fn new(idle: Duration) -> Result<Self, IdleError> {
        if idle.is_zero() {
            return Err(IdleError::InvalidDuration(idle));
        }

        Ok(Self {
            shared: Arc::new(Shared {
                idle,
                state: Mutex::new(State {
                    phase: TimerState::Idle,
                    cycle: None,
                    next_cycle: 1,
                }),
            }),
        })
    }

    /// Configured idle duration
    pub fn idle(&self) -> Duration {
        self.shared.idle
    }

    /// Current watcher state
    pub fn state(&self) -> TimerState {
        self.shared.lock().phase
    }

    /// Restart the countdown if a watcher is counting down; no-op otherwise
    pub fn reset(&self) {
        self.shared.reset();
    }

    /// Weak reset capability that does not keep the timer alive
    pub fn handle(&self) -> IdleReset {
        IdleReset {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Arm a fresh cycle and block until it expires, is cancelled or is stopped.
    ///
    /// Shorthand for [`Self::arm`] followed by [`ArmedCycle::run`].
    pub async fn wait<F, Fut>(
        &self,
        cancel: &CancellationToken,
        on_expire: F,
    ) -> Result<WaitOutcome, IdleError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ()>,
    {
        Ok(self.arm()?.run(cancel, on_expire).await)
    }

    /// Start a fresh countdown now and return the cycle for a watcher to run.
    ///
    /// Arming while another watcher is still counting down fails with
    /// [`IdleError::WatcherRunning`]; a watcher that is only finishing its
    /// expiry callback, or has been asked to stop, does not block a new cycle. Dropping the returned cycle
    /// without running it ends it as stopped.
    pub fn arm(&self) -> Result<ArmedCycle, IdleError> {
        let mut state = self.shared.lock();
        if state.cycle.as_ref().is_some_and(|cycle| !cycle.ending) {
            return Err(IdleError::WatcherRunning);
        }

        let id = state.next_cycle;
        state.next_cycle += 1;

        let (stop_tx, stop_rx) = oneshot::channel();
        let (ack_tx, ack_rx) = watch::channel(false);
        state.cycle = Some(Cycle {
            id,
            deadline: Instant::now() + self.shared.idle,
            stop: Some(stop_tx),
            stopped: ack_rx,
            ending: false,
        });
        state.phase = TimerState::Running;
        drop(state);

        debug!(cycle = id, "idle countdown armed for {:?}", self.shared.idle);
        Ok(ArmedCycle {
            finish: Finish {
                shared: self.shared.clone(),
                cycle: id,
                ack: Some(ack_tx),
                end: TimerState::Stopped,
            },
            stop_rx,
        })
    }

    /// Ask the running watcher to return and wait for it for at most `limit`.
    ///
    /// Returns immediately when no cycle is armed. Safe to call any number
    /// of times; the stop signal is sent at most once per cycle. If the expiry
    /// callback hangs past `limit` the watcher is left detached and
    /// [`IdleError::StopTimeout`] is returned.
    pub async fn stop_wait(&self, limit: Duration) -> Result<(), IdleError> {
        match self.request_stop() {
            Some(stopped) => stopped.wait(limit).await,
            None => Ok(()),
        }
    }

    /// Signal the armed cycle to stop without waiting for it.
    ///
    /// Once this returns, [`Self::arm`] accepts a new cycle; the returned
    /// acknowledgement still refers to the cycle that was stopped.
    pub(crate) fn request_stop(&self) -> Option<StopAck> {
        let mut state = self.shared.lock();
        let cycle = state.cycle.as_mut()?;
        if !cycle.ending {
            cycle.ending = true;
            if let Some(stop) = cycle.stop.take() {
                let _ = stop.send(());
            }
        }
        Some(StopAck {
            stopped: cycle.stopped.clone(),
        })
    }
}

/// Acknowledgement of one stopped cycle
pub(crate) struct StopAck {
    stopped: watch::Receiver<bool>,
}

impl StopAck {
    /// Wait up to `limit` for the cycle's watcher to return
    pub(crate) async fn wait(mut self, limit: Duration) -> Result<(), IdleError> {
        let acked = timeout(limit, self.stopped.wait_for(|done| *done))
            .await
            .is_ok();

        if acked {
            Ok(())
        } else {
            warn!("idle watcher still running after {:?}, detaching", limit);
            Err(IdleError::StopTimeout(limit))
        }
    }
}

/// One armed countdown, owned by the watcher that runs it
pub struct ArmedCycle {
    finish: Finish,
    stop_rx: oneshot::Receiver<()>,
}

impl ArmedCycle {
    /// Cycle number, increasing per timer
    pub fn id(&self) -> u64 {
        self.finish.cycle
    }

    /// Block until the countdown expires, `cancel` fires or a stop is requested.
    ///
    /// `on_expire` is awaited on the calling task only when the countdown
    /// elapses; the stop acknowledgement is sent once it returns.
    pub async fn run<F, Fut>(self, cancel: &CancellationToken, on_expire: F) -> WaitOutcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ()>,
    {
        let ArmedCycle {
            mut finish,
            mut stop_rx,
        } = self;
        let cycle_id = finish.cycle;

        let outcome = loop {
            let Some(deadline) = finish.shared.deadline(cycle_id) else {
                break WaitOutcome::Stopped;
            };

            tokio::select! {
                _ = sleep_until(deadline) => {
                    if finish.shared.try_expire(cycle_id) {
                        break WaitOutcome::Expired;
                    }
                }
                _ = &mut stop_rx => break WaitOutcome::Stopped,
                _ = cancel.cancelled() => break WaitOutcome::Cancelled,
            }
        };

        if outcome == WaitOutcome::Expired {
            debug!(cycle = cycle_id, "idle period elapsed");
            on_expire().await;
            finish.end = TimerState::Expired;
        }
        drop(finish);

        debug!(cycle = cycle_id, ?outcome, "idle watcher returned");
        outcome
    }
}

impl fmt::Debug for ArmedCycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArmedCycle").field("id", &self.id()).finish()
    }
}

impl fmt::Debug for IdleTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdleTimer")
            .field("idle", &self.shared.idle)
            .field("state", &self.state())
            .finish()
    }
}

/// Detached reset capability handed to whatever performs I/O.
///
/// Holds only a weak reference: resetting a dropped timer does nothing.
#[derive(Clone, Default)]
pub struct IdleReset {
    shared: Weak<Shared>,
}

impl IdleReset {
    /// A handle that is not attached to any timer
    pub fn noop() -> Self {
        Self::default()
    }

    /// Restart the countdown of the attached timer, if it is still running
    pub fn reset(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.reset();
        }
    }
}

impl fmt::Debug for IdleReset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdleReset")
            .field("attached", &(self.shared.strong_count() > 0))
            .finish()
    }
}
