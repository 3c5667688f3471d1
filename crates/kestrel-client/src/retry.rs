//! Retry strategies.
//!
//! A strategy runs an attempt closure until it succeeds, fails with an error
//! the policy does not consider transient, or runs out of attempts. Attempts
//! are strictly sequential.

use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use kestrel_common::config::{RetryConfig, RetryStrategyKind};
use kestrel_common::protocol::{ErrorKind, RpcError, Stage};
use rand::Rng;
use tokio::time::Instant;

/// What an attempt knows about the call it belongs to.
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// 1-based attempt number
    pub attempt: u32,
    pub max_attempts: u32,
    /// Failure of the previous attempt, if any
    pub last_error: Option<RpcError>,
}

/// Delay before retry number `n` (the first retry is `n = 1`).
#[derive(Debug, Clone, PartialEq)]
pub enum BackoffSpec {
    None,
    Fixed(Duration),
    Exponential {
        initial: Duration,
        max: Duration,
        multiplier: f64,
        /// Pick uniformly from `[d/2, d]` instead of `d`
        jitter: bool,
    },
}

impl BackoffSpec {
    pub fn delay(&self, retry: u32) -> Duration {
        match self {
            BackoffSpec::None => Duration::ZERO,
            BackoffSpec::Fixed(delay) => *delay,
            BackoffSpec::Exponential {
                initial,
                max,
                multiplier,
                jitter,
            } => {
                let exponent = retry.saturating_sub(1) as i32;
                let scaled = initial.as_secs_f64() * multiplier.powi(exponent);
                let capped = Duration::from_secs_f64(scaled.min(max.as_secs_f64()).max(0.0));
                if *jitter && !capped.is_zero() {
                    let half = capped / 2;
                    rand::thread_rng().gen_range(half..=capped)
                } else {
                    capped
                }
            }
        }
    }
}

/// Attempt budget, backoff, and which failures are worth another attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub backoff: BackoffSpec,
    pub retryable: HashSet<ErrorKind>,
}

impl RetryPolicy {
    /// Transport failures, timeouts and an unreachable registry.
    pub fn default_retryable() -> HashSet<ErrorKind> {
        [ErrorKind::Transport, ErrorKind::Timeout, ErrorKind::RegistryUnavailable]
            .into_iter()
            .collect()
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: BackoffSpec::Fixed(delay),
            retryable: Self::default_retryable(),
        }
    }

    pub fn exponential(max_attempts: u32, initial: Duration, max: Duration, multiplier: f64, jitter: bool) -> Self {
        Self {
            max_attempts,
            backoff: BackoffSpec::Exponential {
                initial,
                max,
                multiplier,
                jitter,
            },
            retryable: Self::default_retryable(),
        }
    }

    pub fn with_retryable(mut self, retryable: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.retryable = retryable.into_iter().collect();
        self
    }

    pub fn is_retryable(&self, error: &RpcError) -> bool {
        self.retryable.contains(&error.kind())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RetryStrategy {
    /// One attempt; its error is returned unchanged
    NoRetry,
    FixedInterval(RetryPolicy),
    Exponential(RetryPolicy),
}

impl RetryStrategy {
    pub fn from_config(kind: RetryStrategyKind, config: &RetryConfig) -> Self {
        match kind {
            RetryStrategyKind::NoRetry => RetryStrategy::NoRetry,
            RetryStrategyKind::FixedInterval => RetryStrategy::FixedInterval(RetryPolicy::fixed(
                config.max_attempts,
                Duration::from_millis(config.delay_ms),
            )),
            RetryStrategyKind::Exponential => RetryStrategy::Exponential(RetryPolicy::exponential(
                config.max_attempts,
                Duration::from_millis(config.delay_ms),
                Duration::from_millis(config.max_delay_ms),
                config.multiplier,
                config.jitter,
            )),
        }
    }

    fn policy(&self) -> Option<&RetryPolicy> {
        match self {
            RetryStrategy::NoRetry => None,
            RetryStrategy::FixedInterval(policy) | RetryStrategy::Exponential(policy) => Some(policy),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.policy().map(|p| p.max_attempts.max(1)).unwrap_or(1)
    }

    /// Runs `attempt` under this strategy.
    ///
    /// - Success is returned immediately.
    /// - A failure outside the policy's retryable set is returned as-is.
    /// - A retryable failure on the last attempt becomes
    ///   [`RpcError::RetryExhausted`] carrying it.
    /// - With a `deadline`, an attempt still running at the deadline, or a
    ///   backoff that would end past it, aborts with [`RpcError::Timeout`].
    pub async fn execute<T, F, Fut>(&self, deadline: Option<Instant>, mut attempt: F) -> Result<T, RpcError>
    where
        F: FnMut(RetryContext) -> Fut,
        Fut: Future<Output = Result<T, RpcError>>,
    {
        let started = Instant::now();
        let max_attempts = self.max_attempts();
        let mut last_error: Option<RpcError> = None;
        let mut number = 1;

        loop {
            let ctx = RetryContext {
                attempt: number,
                max_attempts,
                last_error: last_error.clone(),
            };

            let outcome = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, attempt(ctx)).await {
                    Ok(outcome) => outcome,
                    Err(_) => return Err(deadline_exceeded(started, last_error.as_ref())),
                },
                None => attempt(ctx).await,
            };

            let error = match outcome {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            let Some(policy) = self.policy() else {
                return Err(error);
            };

            if !policy.is_retryable(&error) {
                tracing::debug!(attempt = number, error = %error, "Not retrying");
                return Err(error);
            }

            if number >= max_attempts {
                return Err(RpcError::RetryExhausted {
                    attempts: number,
                    last: Box::new(error),
                });
            }

            let delay = policy.backoff.delay(number);
            if let Some(deadline) = deadline {
                if Instant::now() + delay >= deadline {
                    return Err(deadline_exceeded(started, Some(&error)));
                }
            }

            tracing::warn!(
                attempt = number,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Attempt failed, retrying"
            );

            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            last_error = Some(error);
            number += 1;
        }
    }
}

fn deadline_exceeded(started: Instant, last_error: Option<&RpcError>) -> RpcError {
    RpcError::Timeout {
        stage: last_error.map(RpcError::stage).unwrap_or(Stage::Send),
        instance: last_error.and_then(|e| e.instance()).map(str::to_string),
        after_ms: started.elapsed().as_millis() as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_common::protocol::{ErrorInfo, ErrorInfoKind, TransportError};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn timeout_error() -> RpcError {
        RpcError::from_transport(Stage::Send, "h:1", TransportError::Timeout(10))
    }

    fn application_error() -> RpcError {
        RpcError::Application(ErrorInfo::new(ErrorInfoKind::Application, "boom"))
    }

    async fn run(strategy: &RetryStrategy, error: RpcError) -> (Result<(), RpcError>, u32) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = strategy
            .execute(None, |_| {
                let counter = counter.clone();
                let error = error.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(error)
                }
            })
            .await;
        (result, calls.load(Ordering::SeqCst))
    }

    #[tokio::test]
    async fn test_success_returns_immediately() {
        let strategy = RetryStrategy::FixedInterval(RetryPolicy::fixed(3, Duration::from_millis(1)));
        let result = strategy.execute(None, |_| async { Ok::<_, RpcError>(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_application_error_is_not_retried() {
        let strategy = RetryStrategy::FixedInterval(RetryPolicy::fixed(3, Duration::from_millis(10)));
        let (result, calls) = run(&strategy, application_error()).await;
        assert_eq!(calls, 1);
        assert_eq!(result.unwrap_err(), application_error());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_exhausts_all_attempts() {
        let strategy = RetryStrategy::FixedInterval(RetryPolicy::fixed(3, Duration::from_millis(10)));
        let (result, calls) = run(&strategy, timeout_error()).await;
        assert_eq!(calls, 3);
        match result.unwrap_err() {
            RpcError::RetryExhausted { attempts, last } => {
                assert_eq!(attempts, 3);
                assert_eq!(*last, timeout_error());
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_no_retry_passes_error_through() {
        let (result, calls) = run(&RetryStrategy::NoRetry, timeout_error()).await;
        assert_eq!(calls, 1);
        assert_eq!(result.unwrap_err(), timeout_error());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_interval_waits_between_attempts() {
        let strategy = RetryStrategy::FixedInterval(RetryPolicy::fixed(3, Duration::from_millis(100)));
        let started = Instant::now();
        let _ = run(&strategy, timeout_error()).await;
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_context_reports_attempt_and_last_error() {
        let strategy = RetryStrategy::FixedInterval(RetryPolicy::fixed(3, Duration::ZERO));
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let log = seen.clone();

        let result = strategy
            .execute(None, |ctx| {
                log.lock().push((ctx.attempt, ctx.max_attempts, ctx.last_error.is_some()));
                async move {
                    if ctx.attempt < 3 {
                        Err(timeout_error())
                    } else {
                        Ok(ctx.attempt)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(*seen.lock(), vec![(1, 3, false), (2, 3, true), (3, 3, true)]);
    }

    #[test]
    fn test_exponential_backoff_sequence_is_capped() {
        let spec = BackoffSpec::Exponential {
            initial: Duration::from_millis(50),
            max: Duration::from_millis(150),
            multiplier: 2.0,
            jitter: false,
        };
        assert_eq!(spec.delay(1), Duration::from_millis(50));
        assert_eq!(spec.delay(2), Duration::from_millis(100));
        assert_eq!(spec.delay(3), Duration::from_millis(150));
        assert_eq!(spec.delay(10), Duration::from_millis(150));
    }

    #[test]
    fn test_exponential_jitter_stays_in_upper_half() {
        let spec = BackoffSpec::Exponential {
            initial: Duration::from_millis(400),
            max: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: true,
        };
        for _ in 0..100 {
            let delay = spec.delay(2);
            assert!(delay >= Duration::from_millis(400) && delay <= Duration::from_millis(800), "{:?}", delay);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_aborts_hanging_attempt() {
        let strategy = RetryStrategy::FixedInterval(RetryPolicy::fixed(3, Duration::from_millis(10)));
        let deadline = Instant::now() + Duration::from_millis(100);

        let result: Result<(), RpcError> = strategy
            .execute(Some(deadline), |_| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .await;

        assert_eq!(result.unwrap_err().kind(), ErrorKind::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_past_deadline_aborts_without_sleeping() {
        let strategy = RetryStrategy::FixedInterval(RetryPolicy::fixed(3, Duration::from_secs(5)));
        let deadline = Instant::now() + Duration::from_secs(1);
        let started = Instant::now();

        let result: Result<(), RpcError> = strategy.execute(Some(deadline), |_| async { Err(timeout_error()) }).await;

        let err = result.unwrap_err();
        assert!(matches!(err, RpcError::Timeout { stage: Stage::Send, .. }));
        assert_eq!(err.instance(), Some("h:1"));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_from_config() {
        let config = RetryConfig {
            max_attempts: 4,
            delay_ms: 20,
            ..RetryConfig::default()
        };
        assert_eq!(RetryStrategy::from_config(RetryStrategyKind::NoRetry, &config).max_attempts(), 1);
        assert_eq!(
            RetryStrategy::from_config(RetryStrategyKind::FixedInterval, &config),
            RetryStrategy::FixedInterval(RetryPolicy::fixed(4, Duration::from_millis(20)))
        );
        assert_eq!(RetryStrategy::from_config(RetryStrategyKind::Exponential, &config).max_attempts(), 4);
    }
}
