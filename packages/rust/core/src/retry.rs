//! Retry policy shared by every stage.
//!
//! Collaborators only say *what* failed. This module decides whether that is
//! worth another attempt, and how long to wait first.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use larder_shared::{LarderError, ReasonCode, RetryConfig};

/// How the pipeline reacts to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry with backoff until the attempt budget runs out.
    Transient,
    /// Record in the failure ledger, never retry.
    Permanent,
    /// Abort the run without committing the current batch.
    Fatal,
}

/// Classify an error for retry purposes.
pub fn classify(err: &LarderError) -> ErrorClass {
    match err {
        LarderError::Network(_)
        | LarderError::Timeout(_)
        | LarderError::RateLimited(_)
        | LarderError::Parse { .. }
        | LarderError::Transform(_)
        | LarderError::Io { .. } => ErrorClass::Transient,
        LarderError::NotFound(_) | LarderError::Validation { .. } => ErrorClass::Permanent,
        LarderError::Config { .. } | LarderError::Storage(_) => ErrorClass::Fatal,
    }
}

/// Result of one item after the retry loop has run.
#[derive(Debug)]
pub enum Attempt<T> {
    Success(T),
    /// The last attempt failed transiently and no budget is left.
    TransientFailure(LarderError),
    PermanentFailure(LarderError),
    /// Cancelled while waiting to retry. The item was not completed.
    Interrupted,
}

impl<T> Attempt<T> {
    /// Ledger reason for a failed attempt, or `None` on success/interruption.
    pub fn reason(&self) -> Option<ReasonCode> {
        match self {
            Self::TransientFailure(_) => Some(ReasonCode::RetriesExhausted),
            Self::PermanentFailure(err) if err.is_not_found() => Some(ReasonCode::NotFound),
            Self::PermanentFailure(_) => Some(ReasonCode::Rejected),
            Self::Success(_) | Self::Interrupted => None,
        }
    }
}

/// Attempt budget and exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per item, the first one included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }
}

impl RetryPolicy {
    /// Policy with no waiting between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay after failed attempt `attempt` (1-based): `base * 2^(attempt-1)`, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails permanently, or the budget runs out.
    ///
    /// `before_attempt` is awaited ahead of every call and is where callers
    /// enforce request spacing. Returns the outcome and the number of calls
    /// made. A fatal error is returned as `Err` straight away.
    pub async fn run<T, Op, Fut, Pace, PaceFut>(
        &self,
        cancel: &CancellationToken,
        mut before_attempt: Pace,
        mut op: Op,
    ) -> (Result<Attempt<T>, LarderError>, u32)
    where
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<T, LarderError>>,
        Pace: FnMut() -> PaceFut,
        PaceFut: Future<Output = ()>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            before_attempt().await;

            let err = match op().await {
                Ok(value) => return (Ok(Attempt::Success(value)), attempt),
                Err(err) => err,
            };

            match classify(&err) {
                ErrorClass::Fatal => return (Err(err), attempt),
                ErrorClass::Permanent => return (Ok(Attempt::PermanentFailure(err)), attempt),
                ErrorClass::Transient if attempt >= self.max_attempts => {
                    return (Ok(Attempt::TransientFailure(err)), attempt);
                }
                ErrorClass::Transient => {
                    let delay = self.backoff(attempt);
                    debug!(attempt, ?delay, error = %err, "transient failure, backing off");
                    tokio::select! {
                        _ = cancel.cancelled() => return (Ok(Attempt::Interrupted), attempt),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    async fn no_pace() {}

    #[test]
    fn classification() {
        assert_eq!(classify(&LarderError::Timeout("t".into())), ErrorClass::Transient);
        assert_eq!(classify(&LarderError::RateLimited("429".into())), ErrorClass::Transient);
        assert_eq!(classify(&LarderError::parse("bad json")), ErrorClass::Transient);
        assert_eq!(classify(&LarderError::NotFound("x".into())), ErrorClass::Permanent);
        assert_eq!(classify(&LarderError::validation("no")), ErrorClass::Permanent);
        assert_eq!(classify(&LarderError::Storage("disk".into())), ErrorClass::Fatal);
        assert_eq!(classify(&LarderError::config("bad")), ErrorClass::Fatal);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(350));
        assert_eq!(policy.backoff(40), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn budget_counts_total_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::immediate(3);
        let cancel = CancellationToken::new();

        // Fails three times, would succeed on the fourth call.
        let (result, attempts) = policy
            .run(&cancel, no_pace, || {
                let calls = calls.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    if n <= 3 {
                        Err(LarderError::Transform("503".into()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let attempt = result.unwrap();
        assert!(matches!(attempt, Attempt::TransientFailure(_)));
        assert_eq!(attempt.reason(), Some(ReasonCode::RetriesExhausted));
    }

    #[tokio::test]
    async fn success_within_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::immediate(3);
        let cancel = CancellationToken::new();

        let (result, attempts) = policy
            .run(&cancel, no_pace, || {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(LarderError::Timeout("slow".into()))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(attempts, 3);
        assert!(matches!(result.unwrap(), Attempt::Success("done")));
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::immediate(3);
        let cancel = CancellationToken::new();

        let (result, attempts) = policy
            .run(&cancel, no_pace, || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(LarderError::NotFound("gone".into()))
                }
            })
            .await;

        assert_eq!(attempts, 1);
        let attempt = result.unwrap();
        assert_eq!(attempt.reason(), Some(ReasonCode::NotFound));
    }

    #[tokio::test]
    async fn fatal_error_short_circuits() {
        let policy = RetryPolicy::immediate(3);
        let cancel = CancellationToken::new();
        let (result, attempts) = policy
            .run(&cancel, no_pace, || async {
                Err::<(), _>(LarderError::Storage("read-only".into()))
            })
            .await;
        assert_eq!(attempts, 1);
        assert!(matches!(result, Err(LarderError::Storage(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_backoff_interrupts() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(60),
        };
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();

        let (result, attempts) = policy
            .run(&cancel, no_pace, || {
                trigger.cancel();
                async { Err::<(), _>(LarderError::Network("reset".into())) }
            })
            .await;

        assert_eq!(attempts, 1);
        assert!(matches!(result.unwrap(), Attempt::Interrupted));
    }
}
