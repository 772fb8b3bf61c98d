//! Time-triggered transition machinery
//!
//! On entry to a state with `after(duration)` outgoing transitions the
//! service schedules one ordered walk over the distinct deadlines,
//! relative to the entry instant; exiting the state cancels its pending
//! wakes. Scheduling is monotonic: a wall-clock jump never fires or
//! starves a timer.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::error::SfError;
use crate::event::Event;
use crate::queue::QueueShared;
use crate::types::VertexId;

/// Failure of the underlying clock source; surfaces as
/// [`SfError::TimerFault`] and stops the machine.
#[derive(Debug, Clone)]
pub struct ClockFault {
    /// Human-readable description of the fault
    pub message: String,
}

impl fmt::Display for ClockFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ClockFault {}

/// Clock source used for `after(duration)` scheduling.
///
/// The default implementation delegates to `tokio::time`; tests can
/// substitute a fake to script timer behavior.
#[async_trait]
pub trait Clock: Send + Sync + 'static {
    /// Current monotonic instant.
    fn now(&self) -> Instant;

    /// Sleep until `deadline` has passed.
    async fn sleep_until(&self, deadline: Instant) -> Result<(), ClockFault>;
}

/// Monotonic clock over `tokio::time`.
#[derive(Clone, Copy, Debug, Default)]
pub struct MonotonicClock;

#[async_trait]
impl Clock for MonotonicClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep_until(&self, deadline: Instant) -> Result<(), ClockFault> {
        tokio::time::sleep_until(deadline).await;
        Ok(())
    }
}

/// Owns the pending timer tasks, keyed by the state they belong to.
pub(crate) struct TimerService {
    clock: Arc<dyn Clock>,
    queue: Arc<QueueShared>,
    pending: HashMap<VertexId, Vec<JoinHandle<()>>>,
}

impl TimerService {
    pub(crate) fn new(clock: Arc<dyn Clock>, queue: Arc<QueueShared>) -> Self {
        TimerService {
            clock,
            queue,
            pending: HashMap::new(),
        }
    }

    /// Schedule wakes for every `after` transition leaving `state`,
    /// relative to the entry instant.
    ///
    /// One task per state walks the distinct deadlines in ascending
    /// order and pushes a single time event per deadline. The smallest
    /// delay therefore always reaches the queue first, and equal delays
    /// collapse into one wake whose transition is picked by declaration
    /// order during selection — same-instant firing never races on
    /// task scheduling.
    pub(crate) fn schedule(&mut self, state: VertexId, durations: &[Duration]) {
        if durations.is_empty() {
            return;
        }
        let entered = self.clock.now();
        let mut ordered: Vec<Duration> = durations.to_vec();
        ordered.sort();
        ordered.dedup();
        let clock = Arc::clone(&self.clock);
        let queue = Arc::clone(&self.queue);
        let handle = tokio::spawn(async move {
            for duration in ordered {
                match clock.sleep_until(entered + duration).await {
                    Ok(()) => {
                        debug!(state = %state, ?duration, "timer elapsed");
                        queue.push_time_event(Event::time_elapsed(state, duration));
                    }
                    Err(fault) => {
                        queue.push_fault(SfError::TimerFault {
                            message: fault.message,
                        });
                        return;
                    }
                }
            }
        });
        self.pending.entry(state).or_default().push(handle);
    }

    /// Cancel every wake tied to `state`; called when the state (or an
    /// ancestor) is exited.
    pub(crate) fn cancel(&mut self, state: VertexId) {
        if let Some(handles) = self.pending.remove(&state) {
            debug!(state = %state, timers = handles.len(), "cancelling timers");
            for handle in handles {
                handle.abort();
            }
        }
    }

    pub(crate) fn cancel_all(&mut self) {
        let states: Vec<_> = self.pending.keys().copied().collect();
        for state in states {
            self.cancel(state);
        }
    }
}

impl fmt::Debug for TimerService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerService")
            .field("pending_states", &self.pending.len())
            .finish()
    }
}
