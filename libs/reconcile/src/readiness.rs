//! Bounded-deadline readiness gate.
//!
//! A single background task polls a cheap predicate at a fixed interval while
//! the caller races its success signal against the overall deadline:
//!
//! ```text
//! caller ──select!──┬── oneshot <── poller (tick, predicate, tick, ...)
//!                   └── sleep(total_timeout)
//! ```
//!
//! Whichever fires first decides the outcome. The poller is aborted as soon
//! as the race resolves (or the caller is dropped), so at most one predicate
//! invocation is ever in flight and nothing outlives the gate.

use std::future::Future;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Default interval between predicate invocations.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Default overall readiness deadline.
pub const DEFAULT_READINESS_TIMEOUT: Duration = Duration::from_secs(300);

/// Polling cadence and overall deadline for a [`ReadinessGate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessDeadline {
    /// Fixed interval between predicate invocations.
    pub poll_interval: Duration,

    /// Time after which the gate reports "not ready".
    pub total_timeout: Duration,
}

impl ReadinessDeadline {
    pub fn new(poll_interval: Duration, total_timeout: Duration) -> Self {
        Self {
            poll_interval,
            total_timeout,
        }
    }
}

impl Default for ReadinessDeadline {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            total_timeout: DEFAULT_READINESS_TIMEOUT,
        }
    }
}

/// One-shot gate that waits for a predicate to succeed before a deadline.
///
/// `wait` consumes the gate; build a new one to wait again.
#[derive(Debug)]
pub struct ReadinessGate {
    deadline: ReadinessDeadline,
}

impl ReadinessGate {
    pub fn new(deadline: ReadinessDeadline) -> Self {
        Self { deadline }
    }

    /// Poll `predicate` until it returns `true` or the deadline elapses.
    ///
    /// Returns `true` as soon as the predicate first succeeds and `false`
    /// once `total_timeout` has elapsed. The predicate is invoked immediately
    /// and then every `poll_interval`.
    pub async fn wait<P, Fut>(self, mut predicate: P) -> bool
    where
        P: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let ReadinessDeadline {
            poll_interval,
            total_timeout,
        } = self.deadline;
        // tokio intervals panic on a zero period.
        let poll_interval = poll_interval.max(Duration::from_millis(1));

        let (ready_tx, ready_rx) = oneshot::channel::<()>();
        let poller = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                if predicate().await {
                    let _ = ready_tx.send(());
                    return;
                }
            }
        });
        let _poller = AbortOnDrop(poller);

        let started = Instant::now();
        tokio::select! {
            signal = ready_rx => match signal {
                Ok(()) => {
                    debug!(elapsed_ms = started.elapsed().as_millis() as u64, "Readiness predicate succeeded");
                    true
                }
                Err(_) => {
                    warn!("Readiness poller exited without signalling");
                    false
                }
            },
            _ = tokio::time::sleep(total_timeout) => {
                debug!(timeout_ms = total_timeout.as_millis() as u64, "Readiness deadline elapsed");
                false
            }
        }
    }
}

/// Poll `predicate` every `interval` until it succeeds or `timeout` elapses.
pub async fn await_ready<P, Fut>(predicate: P, interval: Duration, timeout: Duration) -> bool
where
    P: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = bool> + Send + 'static,
{
    ReadinessGate::new(ReadinessDeadline::new(interval, timeout))
        .wait(predicate)
        .await
}

/// Aborts the wrapped task when dropped.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}
