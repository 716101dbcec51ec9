use crate::archive::{ArchiveError, RemoteServiceError, RequestError};
use crate::conf::{RateLimitConfig, RetryConfig};

use rand::Rng;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Exponential backoff bounded by a total time budget.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    pub initial: Duration,
    pub max_delay: Duration,
    pub max_elapsed: Duration,
    pub factor: f64,
    /// Draw each wait uniformly from zero up to the exponential value.
    pub jitter: bool,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for Backoff {
    fn from(config: &RetryConfig) -> Self {
        Backoff {
            initial: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_secs(config.max_delay_secs),
            max_elapsed: Duration::from_secs(config.max_elapsed_secs),
            factor: 2.0,
            jitter: config.jitter,
        }
    }
}

impl Backoff {
    /// Wait before retry number `attempt` (1-based), before jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(62) as i32;
        let secs = self.initial.as_secs_f64() * self.factor.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter {
            base.mul_f64(rand::rng().random_range(0.0..=1.0))
        } else {
            base
        }
    }
}

/// Sliding-window limiter: at most `calls` acquisitions per `period`.
///
/// Callers over the quota sleep until a slot frees up. One limiter is
/// shared by every task talking to the same service.
#[derive(Debug)]
pub struct RateLimiter {
    calls: usize,
    period: Duration,
    window: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(calls: u32, period: Duration) -> Self {
        let calls = calls.max(1) as usize;
        RateLimiter {
            calls,
            period,
            window: Mutex::new(VecDeque::with_capacity(calls)),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        RateLimiter::new(config.calls, config.period())
    }

    pub async fn acquire(&self) {
        let mut window = self.window.lock().await;
        let now = Instant::now();
        while window
            .front()
            .is_some_and(|oldest| now.duration_since(*oldest) >= self.period)
        {
            window.pop_front();
        }
        if window.len() >= self.calls {
            if let Some(oldest) = window.pop_front() {
                let ready = oldest + self.period;
                debug!(wait = ?ready.saturating_duration_since(now), "rate limit reached, waiting");
                tokio::time::sleep_until(ready).await;
            }
        }
        window.push_back(Instant::now());
    }
}

/// Retry and rate limiting wrapped around raw requests to one service.
#[derive(Debug, Clone)]
pub struct Middleware {
    service: String,
    backoff: Backoff,
    limiter: Arc<RateLimiter>,
}

impl Middleware {
    pub fn new(service: impl Into<String>, backoff: Backoff, limiter: Arc<RateLimiter>) -> Self {
        Middleware {
            service: service.into(),
            backoff,
            limiter,
        }
    }

    pub fn from_config(service: &str, retry: &RetryConfig, rate_limit: &RateLimitConfig) -> Self {
        Middleware::new(
            service,
            Backoff::from(retry),
            Arc::new(RateLimiter::from_config(rate_limit)),
        )
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn limiter(&self) -> Arc<RateLimiter> {
        Arc::clone(&self.limiter)
    }

    /// Run `request` until it succeeds, fails permanently, or the time
    /// budget is spent.
    ///
    /// Each attempt first takes a rate-limit slot. Transient failures are
    /// retried after a backoff wait, never longer than what is left of the
    /// budget. Permanent failures surface at once.
    pub async fn call<T, F, Fut>(&self, operation: &str, mut request: F) -> Result<T, ArchiveError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RequestError>>,
    {
        let start = Instant::now();
        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            self.limiter.acquire().await;
            let error = match request().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if !error.is_transient() {
                warn!(
                    error.message = %error,
                    service = %self.service,
                    operation,
                    "request rejected"
                );
                return Err(ArchiveError::Rejected {
                    service: self.service.clone(),
                    operation: operation.to_string(),
                    source: error,
                });
            }

            let elapsed = start.elapsed();
            if elapsed >= self.backoff.max_elapsed {
                warn!(
                    error.message = %error,
                    service = %self.service,
                    operation,
                    attempts,
                    "retry budget exhausted"
                );
                return Err(RemoteServiceError {
                    service: self.service.clone(),
                    operation: operation.to_string(),
                    attempts,
                    elapsed,
                    last_error: error,
                }
                .into());
            }

            let delay = self
                .backoff
                .delay(attempts)
                .min(self.backoff.max_elapsed - elapsed);
            warn!(
                error.message = %error,
                service = %self.service,
                operation,
                attempts,
                ?delay,
                "transient failure, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn backoff(max_elapsed_secs: u64) -> Backoff {
        Backoff {
            initial: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_elapsed: Duration::from_secs(max_elapsed_secs),
            factor: 2.0,
            jitter: false,
        }
    }

    fn unlimited() -> Arc<RateLimiter> {
        Arc::new(RateLimiter::new(1000, Duration::from_secs(1)))
    }

    fn unavailable() -> RequestError {
        RequestError::Unavailable("service down".to_string())
    }

    #[test]
    fn test_base_delay_is_exponential_and_capped() {
        let backoff = Backoff {
            max_delay: Duration::from_secs(5),
            ..backoff(600)
        };
        let delays: Vec<u64> = (1..=5).map(|a| backoff.base_delay(a).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 5, 5]);
    }

    #[test]
    fn test_jitter_stays_below_base() {
        let backoff = Backoff {
            jitter: true,
            ..backoff(600)
        };
        for attempt in 1..8 {
            assert!(backoff.delay(attempt) <= backoff.base_delay(attempt));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let middleware = Middleware::new("archive", backoff(600), unlimited());
        let calls = AtomicU32::new(0);
        let start = Instant::now();
        let result = middleware
            .call("object_search", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 3 {
                        Err(unavailable())
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(result, 3);
        assert_eq!(start.elapsed(), Duration::from_secs(1 + 2 + 4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_exhaustion() {
        let middleware = Middleware::new("archive", backoff(10), unlimited());
        let start = Instant::now();
        let error = middleware
            .call("cone_search", || async { Err::<(), _>(unavailable()) })
            .await
            .unwrap_err();
        match error {
            ArchiveError::RemoteService(error) => {
                // waits of 1, 2, 4 and a final 3 capped by the budget
                assert_eq!(error.attempts, 5);
                assert_eq!(error.operation, "cone_search");
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(start.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_is_not_retried() {
        let middleware = Middleware::new("archive", backoff(600), unlimited());
        let calls = AtomicU32::new(0);
        let error = middleware
            .call("object_search", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err::<(), _>(RequestError::Status {
                        url: "http://archive/object/x".to_string(),
                        status: 400,
                        body: "bad request".to_string(),
                    })
                }
            })
            .await
            .unwrap_err();
        assert!(matches!(error, ArchiveError::Rejected { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limiter_spreads_calls() {
        let limiter = RateLimiter::new(2, Duration::from_secs(1));
        let start = Instant::now();
        for _ in 0..5 {
            limiter.acquire().await;
        }
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limiter_is_shared() {
        let limiter = Arc::new(RateLimiter::new(3, Duration::from_secs(1)));
        let start = Instant::now();
        let handles: Vec<_> = (0..9)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                tokio::spawn(async move { limiter.acquire().await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }
}
