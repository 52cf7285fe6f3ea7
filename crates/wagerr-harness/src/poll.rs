//! The one retry primitive.
//!
//! Every "wait for X" in the harness goes through [`poll_until`] or
//! [`poll_until_nudged`] so that timeout scaling and failure diagnostics
//! stay uniform. Many distributed conditions do not converge on their own
//! under mocktime (daemon-internal timers only advance when the clock is
//! pushed, phases only advance when blocks are mined), which is what the
//! nudge callback is for: it runs once per failed attempt, before the next
//! sleep.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

use crate::error::HarnessError;

/// Result of one probe attempt. `Pending` carries a human-readable snapshot
/// of what was observed; the last one ends up in the timeout error.
#[derive(Debug)]
pub enum Probe {
    Converged,
    Pending(String),
}

pub type ProbeFuture<'a> = Pin<Box<dyn Future<Output = Result<Probe, HarnessError>> + Send + 'a>>;
pub type NudgeFuture<'a> = Pin<Box<dyn Future<Output = Result<(), HarnessError>> + Send + 'a>>;

/// Global timeout multiplier. Slow CI environments pass `--timeout-scale`
/// and every budget in the system stretches with it; no wait may use a bare
/// constant instead.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    scale: u32,
}

impl Timeouts {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(250);

    pub fn new(scale: u32) -> Self {
        Self {
            scale: scale.max(1),
        }
    }

    pub fn scale(&self) -> u32 {
        self.scale
    }

    pub fn scaled(&self, d: Duration) -> Duration {
        d * self.scale
    }

    pub fn budget(&self, timeout: Duration, interval: Duration) -> PollBudget {
        PollBudget {
            timeout: self.scaled(timeout),
            interval: self.scaled(interval),
        }
    }

    /// Budget with the default polling interval.
    pub fn budget_secs(&self, timeout_secs: u64) -> PollBudget {
        self.budget(Duration::from_secs(timeout_secs), Self::DEFAULT_INTERVAL)
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self::new(1)
    }
}

/// A scaled (timeout, interval) pair for one wait.
#[derive(Debug, Clone, Copy)]
pub struct PollBudget {
    pub timeout: Duration,
    pub interval: Duration,
}

/// Poll `probe` until it converges or `budget.timeout` elapses. A probe
/// error is a hard failure and aborts immediately; retrying is reserved for
/// `Pending` observations.
pub async fn poll_until<'a>(
    what: &str,
    budget: PollBudget,
    probe: impl FnMut() -> ProbeFuture<'a>,
) -> Result<(), HarnessError> {
    poll_until_nudged(what, budget, probe, || Box::pin(async { Ok(()) })).await
}

/// [`poll_until`] with a side-effecting nudge run once per failed attempt.
pub async fn poll_until_nudged<'a>(
    what: &str,
    budget: PollBudget,
    mut probe: impl FnMut() -> ProbeFuture<'a>,
    mut nudge: impl FnMut() -> NudgeFuture<'a>,
) -> Result<(), HarnessError> {
    let deadline = Instant::now() + budget.timeout;
    let mut last = String::from("no observation yet");
    loop {
        match probe().await? {
            Probe::Converged => return Ok(()),
            Probe::Pending(state) => {
                trace!(what, state = %state, "pending");
                last = state;
            }
        }
        if Instant::now() >= deadline {
            return Err(HarnessError::ConvergenceTimeout {
                what: what.to_string(),
                timeout: budget.timeout,
                last,
            });
        }
        nudge().await?;
        tokio::time::sleep(budget.interval).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn fast_budget() -> PollBudget {
        PollBudget {
            timeout: Duration::from_millis(200),
            interval: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn converges_immediately() {
        let result = poll_until("noop", fast_budget(), || {
            Box::pin(async { Ok(Probe::Converged) })
        })
        .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn converges_after_retries() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        poll_until("third time", fast_budget(), move || {
            let counter = counter.clone();
            Box::pin(async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Ok(Probe::Pending("not yet".into()))
                } else {
                    Ok(Probe::Converged)
                }
            })
        })
        .await
        .unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn timeout_preserves_last_observation() {
        let budget = PollBudget {
            timeout: Duration::from_millis(30),
            interval: Duration::from_millis(5),
        };
        let err = poll_until("never", budget, || {
            Box::pin(async { Ok(Probe::Pending("tip mismatch at node 2".into())) })
        })
        .await
        .unwrap_err();
        match err {
            HarnessError::ConvergenceTimeout { what, last, .. } => {
                assert_eq!(what, "never");
                assert_eq!(last, "tip mismatch at node 2");
            }
            other => panic!("wrong error: {other}"),
        }
    }

    #[tokio::test]
    async fn nudge_runs_once_per_failed_attempt() {
        let nudges = Arc::new(AtomicUsize::new(0));
        let attempts = Arc::new(AtomicUsize::new(0));
        let nudge_counter = nudges.clone();
        let attempt_counter = attempts.clone();
        poll_until_nudged(
            "nudged",
            fast_budget(),
            move || {
                let counter = attempt_counter.clone();
                Box::pin(async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Ok(Probe::Pending("waiting".into()))
                    } else {
                        Ok(Probe::Converged)
                    }
                })
            },
            move || {
                let counter = nudge_counter.clone();
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            },
        )
        .await
        .unwrap();
        // Two failed attempts, so exactly two nudges; none after convergence.
        assert_eq!(nudges.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn probe_error_aborts_without_retry() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let err = poll_until("faulting", fast_budget(), move || {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(HarnessError::ProtocolFault {
                    context: "dkg".into(),
                    detail: "phase regressed".into(),
                })
            })
        })
        .await
        .unwrap_err();
        assert!(matches!(err, HarnessError::ProtocolFault { .. }));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn scale_multiplies_both_budget_parts() {
        let timeouts = Timeouts::new(4);
        let budget = timeouts.budget(Duration::from_secs(10), Duration::from_millis(100));
        assert_eq!(budget.timeout, Duration::from_secs(40));
        assert_eq!(budget.interval, Duration::from_millis(400));
    }

    #[test]
    fn scale_clamps_to_one() {
        assert_eq!(Timeouts::new(0).scale(), 1);
    }
}
