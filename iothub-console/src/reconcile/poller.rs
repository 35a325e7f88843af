//! Bounded confirmation polling.
//!
//! Turns an eventually consistent remote check into a wait that either
//! observes the expected state or fails with a distinct timeout.

use super::ReconcileError;
use crate::services::metrics::record_reconcile;
use crate::services::registry::RegistryError;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Limits and pacing for one confirmation loop.
#[derive(Clone, Debug, PartialEq)]
pub struct PollPolicy {
    /// Delay after the first unsuccessful evaluation.
    pub initial_delay: Duration,
    /// Growth factor applied to the delay after each evaluation. 1.0 keeps it fixed.
    pub backoff_multiplier: f64,
    /// Upper bound for a single delay.
    pub max_delay: Duration,
    /// Maximum number of predicate evaluations.
    pub max_attempts: u32,
    /// Total time budget for the loop.
    pub deadline: Duration,
    /// Transient query faults absorbed as "not yet" before propagating.
    pub transient_retries: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            backoff_multiplier: 1.0,
            max_delay: Duration::from_secs(2),
            max_attempts: 50,
            deadline: Duration::from_secs(30),
            transient_retries: 0,
        }
    }
}

impl PollPolicy {
    /// Fixed delay between evaluations, at most `max_attempts` evaluations.
    pub fn fixed(delay: Duration, max_attempts: u32) -> Self {
        Self {
            initial_delay: delay,
            max_delay: delay,
            max_attempts,
            deadline: delay.saturating_mul(max_attempts).saturating_add(Duration::from_secs(5)),
            ..Default::default()
        }
    }

    pub fn with_backoff(mut self, multiplier: f64, max_delay: Duration) -> Self {
        self.backoff_multiplier = multiplier;
        self.max_delay = max_delay;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_transient_retries(mut self, retries: u32) -> Self {
        self.transient_retries = retries;
        self
    }

    /// Delay following evaluation number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let delay_ms =
            self.initial_delay.as_millis() as f64 * self.backoff_multiplier.max(1.0).powi(exponent);
        let capped = delay_ms.min(self.max_delay.as_millis() as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

/// Result of a confirmed poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOutcome {
    /// Number of predicate evaluations, including the successful one.
    pub attempts: u32,
    pub elapsed: Duration,
}

#[derive(Clone, Debug, Default)]
pub struct ConfirmationPoller {
    policy: PollPolicy,
}

impl ConfirmationPoller {
    pub fn new(policy: PollPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &PollPolicy {
        &self.policy
    }

    /// Evaluate `observe` until it reports `true`.
    ///
    /// Each evaluation is a fresh remote query. Faults from `observe` end the
    /// loop immediately unless the policy allows absorbing transient ones.
    /// Sleeps suspend only the calling task and are raced against `cancel`.
    pub async fn confirm<F, Fut>(
        &self,
        operation: &'static str,
        identifier: &str,
        cancel: &CancellationToken,
        mut observe: F,
    ) -> Result<PollOutcome, ReconcileError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool, RegistryError>>,
    {
        let started = Instant::now();
        let mut attempts = 0u32;
        let mut transient_budget = self.policy.transient_retries;

        let result = loop {
            if cancel.is_cancelled() {
                break Err(ReconcileError::Cancelled {
                    operation,
                    identifier: identifier.to_string(),
                });
            }

            attempts += 1;
            match observe().await {
                Ok(true) => {
                    break Ok(PollOutcome {
                        attempts,
                        elapsed: started.elapsed(),
                    });
                }
                Ok(false) => {
                    debug!(operation, identifier, attempt = attempts, "State not yet visible");
                }
                Err(err) if err.is_transient() && transient_budget > 0 => {
                    transient_budget -= 1;
                    warn!(
                        operation,
                        identifier,
                        attempt = attempts,
                        error = %err,
                        "Transient fault while confirming, treating as not yet visible"
                    );
                }
                Err(err) => {
                    warn!(
                        operation,
                        identifier,
                        attempt = attempts,
                        error = %err,
                        "Confirmation query failed"
                    );
                    break Err(ReconcileError::Registry(err));
                }
            }

            if attempts >= self.policy.max_attempts {
                break Err(self.timeout(operation, identifier, attempts));
            }

            let delay = self.policy.delay_after(attempts);
            if started.elapsed() + delay > self.policy.deadline {
                break Err(self.timeout(operation, identifier, attempts));
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    break Err(ReconcileError::Cancelled {
                        operation,
                        identifier: identifier.to_string(),
                    });
                }
                _ = sleep(delay) => {}
            }
        };

        let elapsed = started.elapsed();
        match &result {
            Ok(outcome) => {
                if outcome.attempts > 1 {
                    info!(
                        operation,
                        identifier,
                        attempts = outcome.attempts,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "Registry change confirmed"
                    );
                }
                record_reconcile(operation, "confirmed", attempts, elapsed);
            }
            Err(err) => record_reconcile(operation, err.outcome_label(), attempts, elapsed),
        }

        result
    }

    fn timeout(&self, operation: &'static str, identifier: &str, attempts: u32) -> ReconcileError {
        warn!(
            operation,
            identifier,
            attempts,
            max_attempts = self.policy.max_attempts,
            deadline_ms = self.policy.deadline.as_millis() as u64,
            "Registry change not confirmed within poll policy"
        );
        ReconcileError::Timeout {
            operation,
            identifier: identifier.to_string(),
            attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn quick(max_attempts: u32) -> ConfirmationPoller {
        ConfirmationPoller::new(PollPolicy::fixed(Duration::from_millis(1), max_attempts))
    }

    #[test]
    fn test_default_policy_is_fixed_100ms() {
        let policy = PollPolicy::default();
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(10), Duration::from_millis(100));
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = PollPolicy::fixed(Duration::from_millis(100), 10)
            .with_backoff(2.0, Duration::from_millis(500));
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after(3), Duration::from_millis(400));
        assert_eq!(policy.delay_after(4), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_true_on_nth_evaluation_queries_exactly_n_times() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let outcome = quick(10)
            .confirm("test_op", "dev-1", &CancellationToken::new(), || {
                let counter = counter.clone();
                async move { Ok(counter.fetch_add(1, Ordering::SeqCst) + 1 >= 4) }
            })
            .await
            .unwrap();

        assert_eq!(outcome.attempts, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_delays_between_evaluations() {
        let poller = ConfirmationPoller::new(PollPolicy::fixed(Duration::from_millis(20), 10));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let outcome = poller
            .confirm("test_op", "dev-1", &CancellationToken::new(), || {
                let counter = counter.clone();
                async move { Ok(counter.fetch_add(1, Ordering::SeqCst) + 1 >= 3) }
            })
            .await
            .unwrap();

        // Three evaluations, two sleeps in between.
        assert!(outcome.elapsed >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_immediate_success_does_not_sleep() {
        let poller = ConfirmationPoller::new(PollPolicy::fixed(Duration::from_secs(10), 3));
        let outcome = poller
            .confirm("test_op", "dev-1", &CancellationToken::new(), || async { Ok(true) })
            .await
            .unwrap();

        assert_eq!(outcome.attempts, 1);
        assert!(outcome.elapsed < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_times_out_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let err = quick(5)
            .confirm("test_op", "dev-1", &CancellationToken::new(), || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(false)
                }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ReconcileError::Timeout { attempts: 5, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_times_out_at_deadline() {
        let poller = ConfirmationPoller::new(
            PollPolicy::fixed(Duration::from_millis(50), 1_000)
                .with_deadline(Duration::from_millis(120)),
        );

        let err = poller
            .confirm("test_op", "dev-1", &CancellationToken::new(), || async { Ok(false) })
            .await
            .unwrap_err();

        match err {
            ReconcileError::Timeout { attempts, .. } => assert!(attempts <= 3),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_query_fault_propagates_without_retry() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let err = quick(10)
            .confirm("test_op", "dev-1", &CancellationToken::new(), || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(RegistryError::Transient {
                        operation: "query_devices",
                        id: "dev-1".to_string(),
                        message: "503".to_string(),
                    })
                }
            })
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ReconcileError::Registry(RegistryError::Transient { .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transient_faults_absorbed_when_allowed() {
        let poller = ConfirmationPoller::new(
            PollPolicy::fixed(Duration::from_millis(1), 10).with_transient_retries(2),
        );
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let outcome = poller
            .confirm("test_op", "dev-1", &CancellationToken::new(), || {
                let counter = counter.clone();
                async move {
                    match counter.fetch_add(1, Ordering::SeqCst) {
                        0 | 1 => Err(RegistryError::Transient {
                            operation: "query_devices",
                            id: "dev-1".to_string(),
                            message: "throttled".to_string(),
                        }),
                        _ => Ok(true),
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(outcome.attempts, 3);
    }

    #[tokio::test]
    async fn test_cancellation_stops_the_loop() {
        let poller = ConfirmationPoller::new(PollPolicy::fixed(Duration::from_secs(60), 10));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();

        tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = poller
            .confirm("test_op", "dev-1", &cancel, || async { Ok(false) })
            .await
            .unwrap_err();

        assert!(matches!(err, ReconcileError::Cancelled { .. }));
    }
}
