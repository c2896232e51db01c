use std::any::Any;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::config::OrchestratorConfig;
use crate::workflow::types::{ErrorKind, Stage};

/// Floor for retry delays so a flapping dependency is never hammered.
const MIN_BACKOFF: Duration = Duration::from_millis(10);

/// Exponential backoff between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max }
    }

    /// Delay to wait after the given number of failed attempts (1-based).
    pub fn delay_for(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1).min(16);
        let delay = self.initial.saturating_mul(1u32 << exponent);
        delay.min(self.max).max(MIN_BACKOFF)
    }
}

impl From<&OrchestratorConfig> for Backoff {
    fn from(config: &OrchestratorConfig) -> Self {
        Self::new(
            Duration::from_millis(config.retry_backoff_ms),
            Duration::from_millis(config.retry_backoff_max_ms),
        )
    }
}

/// Why a single attempt did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageError {
    /// Technical failure; retried.
    Failed(String),
    /// The attempt missed its deadline and was abandoned.
    Timeout(Duration),
    /// The collaborator panicked; treated like any other technical failure.
    Panicked(String),
}

impl StageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StageError::Failed(_) | StageError::Panicked(_) => ErrorKind::Transient,
            StageError::Timeout(_) => ErrorKind::Timeout,
        }
    }
}

impl fmt::Display for StageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageError::Failed(msg) => write!(f, "{msg}"),
            StageError::Timeout(after) => write!(f, "timed out after {}ms", after.as_millis()),
            StageError::Panicked(msg) => write!(f, "collaborator panicked: {msg}"),
        }
    }
}

/// Result of running one stage through the executor.
#[derive(Debug)]
pub enum StageOutcome<T> {
    Succeeded { value: T, attempts: u32 },
    Failed { error: StageError, attempts: u32 },
}

/// Aborts the attempt task if it is abandoned before finishing.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Runs collaborator calls under a per-attempt deadline with bounded retries.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    backoff: Backoff,
}

impl RetryExecutor {
    pub fn new(backoff: Backoff) -> Self {
        Self { backoff }
    }

    /// Invoke `operation` up to `max_attempts` times, each bounded by `timeout`.
    ///
    /// Each attempt runs as its own task so that a panic is contained and a
    /// late attempt can be aborted.
    pub async fn execute<T, F, Fut>(
        &self,
        stage: Stage,
        timeout: Duration,
        max_attempts: u32,
        mut operation: F,
    ) -> StageOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, StageError>> + Send + 'static,
        T: Send + 'static,
    {
        let max_attempts = max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            let error = match run_attempt(timeout, operation()).await {
                Ok(value) => {
                    tracing::debug!(stage = %stage, attempt, "Stage attempt succeeded");
                    return StageOutcome::Succeeded {
                        value,
                        attempts: attempt,
                    };
                }
                Err(error) => error,
            };

            if attempt >= max_attempts {
                tracing::warn!(
                    stage = %stage,
                    attempts = attempt,
                    error = %error,
                    "Stage exhausted retries"
                );
                return StageOutcome::Failed {
                    error,
                    attempts: attempt,
                };
            }

            let delay = self.backoff.delay_for(attempt);
            tracing::warn!(
                stage = %stage,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                kind = ?error.kind(),
                error = %error,
                "Stage attempt failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

async fn run_attempt<T, Fut>(timeout: Duration, attempt: Fut) -> std::result::Result<T, StageError>
where
    Fut: Future<Output = std::result::Result<T, StageError>> + Send + 'static,
    T: Send + 'static,
{
    let mut task = AbortOnDrop(tokio::spawn(attempt));

    match tokio::time::timeout(timeout, &mut task.0).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_error)) if join_error.is_panic() => Err(StageError::Panicked(
            panic_message(join_error.into_panic()),
        )),
        Ok(Err(join_error)) => Err(StageError::Failed(format!(
            "attempt task ended unexpectedly: {join_error}"
        ))),
        // Dropping `task` aborts the abandoned attempt.
        Err(_) => Err(StageError::Timeout(timeout)),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    fn executor() -> RetryExecutor {
        RetryExecutor::new(Backoff::new(
            Duration::from_millis(100),
            Duration::from_millis(1_000),
        ))
    }

    /// Operation that fails its first `failures` calls.
    fn flaky(
        calls: &Arc<AtomicU32>,
        failures: u32,
    ) -> impl FnMut() -> std::pin::Pin<
        Box<dyn Future<Output = std::result::Result<u32, StageError>> + Send>,
    > {
        let calls = Arc::clone(calls);
        move || {
            let calls = Arc::clone(&calls);
            Box::pin(async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n <= failures {
                    Err(StageError::Failed(format!("flake {n}")))
                } else {
                    Ok(n)
                }
            })
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(backoff.delay_for(1), Duration::from_millis(100));
        assert_eq!(backoff.delay_for(2), Duration::from_millis(200));
        assert_eq!(backoff.delay_for(3), Duration::from_millis(350));
        assert_eq!(backoff.delay_for(40), Duration::from_millis(350));
    }

    #[test]
    fn test_backoff_is_never_immediate() {
        let backoff = Backoff::new(Duration::ZERO, Duration::ZERO);
        assert_eq!(backoff.delay_for(1), MIN_BACKOFF);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_then_succeed() {
        let calls = Arc::new(AtomicU32::new(0));
        let outcome = executor()
            .execute(Stage::Analysis, Duration::from_secs(1), 3, flaky(&calls, 2))
            .await;

        match outcome {
            StageOutcome::Succeeded { value, attempts } => {
                assert_eq!(value, 3);
                assert_eq!(attempts, 3);
            }
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let outcome = executor()
            .execute(Stage::Review, Duration::from_secs(1), 3, flaky(&calls, u32::MAX))
            .await;

        match outcome {
            StageOutcome::Failed { error, attempts } => {
                assert_eq!(attempts, 3);
                assert_eq!(error, StageError::Failed("flake 3".to_string()));
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_wait_for_backoff() {
        let calls = Arc::new(AtomicU32::new(0));
        let start = Instant::now();
        let _ = executor()
            .execute(Stage::Analysis, Duration::from_secs(1), 3, flaky(&calls, u32::MAX))
            .await;

        // 100ms after the first failure, 200ms after the second.
        assert!(start.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_abandons_and_aborts_attempt() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);
        let start = Instant::now();

        let outcome: StageOutcome<()> = executor()
            .execute(Stage::Resolution, Duration::from_millis(500), 1, move || {
                let flag = Arc::clone(&flag);
                async move {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    flag.store(true, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;

        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(matches!(
            outcome,
            StageOutcome::Failed {
                error: StageError::Timeout(_),
                attempts: 1
            }
        ));

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_panic_is_contained_and_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let outcome = executor()
            .execute(Stage::PrGeneration, Duration::from_secs(1), 2, move || {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n == 1 {
                        panic!("malformed response");
                    }
                    Ok(n)
                }
            })
            .await;

        assert!(matches!(outcome, StageOutcome::Succeeded { value: 2, attempts: 2 }));
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(StageError::Failed(String::new()).kind(), ErrorKind::Transient);
        assert_eq!(StageError::Panicked(String::new()).kind(), ErrorKind::Transient);
        assert_eq!(StageError::Timeout(Duration::from_secs(1)).kind(), ErrorKind::Timeout);
    }
}
