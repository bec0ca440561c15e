use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::connectivity::Probe;
use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt. `0` means a single try.
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self { Self { max_retries: 3, base_delay: Duration::from_millis(1000) } }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self { Self { max_retries, base_delay } }

    pub fn delay(&self, attempt: u32, jitter: f64) -> Duration { backoff_delay(self.base_delay, attempt, jitter) }
}

/// `base * 2^attempt * (0.5 + jitter)` with `jitter` in `[0, 1)`, so the result
/// lies in `[0.5, 1.5)` times the plain exponential value. Saturates instead of
/// overflowing for very large attempt numbers.
pub fn backoff_delay(base: Duration, attempt: u32, jitter: f64) -> Duration {
    let jitter = if jitter.is_finite() { jitter.clamp(0.0, 1.0 - f64::EPSILON) } else { 0.0 };
    let factor = 2f64.powi(attempt.min(i32::MAX as u32) as i32) * (0.5 + jitter);
    Duration::try_from_secs_f64(base.as_secs_f64() * factor).unwrap_or(Duration::MAX)
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// `policy.max_retries + 1` attempts have been made.
///
/// The first attempt runs immediately. Every later attempt first asks `probe`
/// whether the network is reachable; if not, that attempt fails with a
/// connectivity error without calling `operation`. Between attempts the task
/// sleeps for a jittered exponential backoff. The last error is always returned.
pub async fn with_retry<T, F, Fut>(probe: &dyn Probe, policy: RetryPolicy, mut operation: F) -> AppResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AppResult<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        let result = if attempt == 0 || probe.is_connected().await {
            operation().await
        } else {
            Err(AppError::connectivity("offline", "no probe endpoint reachable"))
        };
        let err = match result {
            Ok(v) => {
                if attempt > 0 { debug!(target: "fixdesk::retry", "succeeded on attempt {}", attempt + 1); }
                return Ok(v);
            }
            Err(e) => e,
        };
        if !err.is_retryable() {
            debug!(target: "fixdesk::retry", "not retrying non-retryable error: {}", err);
            return Err(err);
        }
        if attempt >= policy.max_retries {
            warn!(target: "fixdesk::retry", "giving up after {} attempts: {}", attempt + 1, err);
            return Err(err);
        }
        let jitter: f64 = rand::thread_rng().gen();
        let delay = policy.delay(attempt, jitter);
        debug!(target: "fixdesk::retry", "attempt {} failed ({}); retrying in {:?}", attempt + 1, err, delay);
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    struct CountingProbe { online: AtomicBool, calls: AtomicUsize }

    impl CountingProbe {
        fn new(online: bool) -> Self { Self { online: AtomicBool::new(online), calls: AtomicUsize::new(0) } }
        fn calls(&self) -> usize { self.calls.load(Ordering::SeqCst) }
    }

    #[async_trait]
    impl Probe for CountingProbe {
        async fn is_connected(&self) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.online.load(Ordering::SeqCst)
        }
    }

    fn transient() -> AppError { AppError::transient("503", "service unavailable") }

    #[test]
    fn delay_stays_within_jitter_bounds() {
        let base = Duration::from_millis(1000);
        for attempt in 0..6u32 {
            let plain = base.as_secs_f64() * 2f64.powi(attempt as i32);
            let lo = backoff_delay(base, attempt, 0.0).as_secs_f64();
            let hi = backoff_delay(base, attempt, 0.999_999).as_secs_f64();
            assert!((lo - plain * 0.5).abs() < 1e-9);
            assert!(hi < plain * 1.5);
            assert!(hi >= lo);
        }
    }

    #[test]
    fn delay_grows_with_attempt_and_saturates() {
        let base = Duration::from_millis(100);
        assert!(backoff_delay(base, 3, 0.5) > backoff_delay(base, 2, 0.5));
        assert_eq!(backoff_delay(base, 5000, 0.5), Duration::MAX);
        // Out-of-range jitter is clamped
        assert_eq!(backoff_delay(base, 0, -3.0), Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn always_failing_operation_runs_max_retries_plus_one_times() {
        let probe = CountingProbe::new(true);
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let started = Instant::now();
        let res: AppResult<()> = with_retry(&probe, RetryPolicy::new(3, Duration::from_millis(1000)), || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(transient())
            }
        })
        .await;
        assert_eq!(res, Err(transient()));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(probe.calls(), 3);
        // Sleeps after attempts 0, 1 and 2: 1s + 2s + 4s, each jittered into [0.5x, 1.5x)
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(3500), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(10500), "{:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_second_call_after_one_probe_and_one_sleep() {
        let probe = CountingProbe::new(true);
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let started = Instant::now();
        let res = with_retry(&probe, RetryPolicy::new(3, Duration::from_millis(1000)), || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) == 0 { Err(transient()) } else { Ok(42) }
            }
        })
        .await;
        assert_eq!(res, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(probe.calls(), 1);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(500) && elapsed < Duration::from_millis(1500), "{:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn offline_retries_skip_the_operation() {
        let probe = CountingProbe::new(false);
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let res: AppResult<()> = with_retry(&probe, RetryPolicy::new(2, Duration::from_millis(10)), || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(transient())
            }
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(probe.calls(), 2);
        assert!(matches!(res, Err(AppError::Connectivity { .. })));
    }

    #[tokio::test]
    async fn first_attempt_does_not_probe() {
        let probe = CountingProbe::new(false);
        let res = with_retry(&probe, RetryPolicy::default(), || async { Ok::<_, AppError>("ok") }).await;
        assert_eq!(res, Ok("ok"));
        assert_eq!(probe.calls(), 0);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let probe = CountingProbe::new(true);
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let res: AppResult<()> = with_retry(&probe, RetryPolicy::default(), || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(AppError::permanent("42501", "permission denied for table"))
            }
        })
        .await;
        assert!(matches!(res, Err(AppError::Permanent { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn zero_retries_means_single_attempt() {
        let probe = CountingProbe::new(true);
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let res: AppResult<()> = with_retry(&probe, RetryPolicy::new(0, Duration::from_millis(1)), || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(transient())
            }
        })
        .await;
        assert!(res.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(probe.calls(), 0);
    }
}
