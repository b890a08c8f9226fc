//! Token-bucket throttle for outbound provider calls.
//!
//! The bucket is a `governor` direct limiter (GCRA) built from
//! `Quota::with_period(1/R).allow_burst(C)`. Its clock reads tokio's clock so
//! waits are driven by `tokio::time` like every other suspension point.
//! Waiters queue on a fair async mutex, so permits are granted in arrival order.

use super::types::GeocodeError;
use governor::clock::Clock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter as GovLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

/// Token-bucket parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitSettings {
    /// Burst size C.
    pub capacity: u32,
    /// Refill rate R in tokens per second.
    pub refill_per_sec: f64,
    /// Default wait ceiling for `acquire`.
    pub acquire_timeout: Duration,
    /// Cap on concurrently held permits.
    pub max_in_flight: Option<usize>,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            capacity: 1,
            refill_per_sec: 1.0,
            acquire_timeout: Duration::from_secs(30),
            max_in_flight: None,
        }
    }
}

/// Governor clock backed by `tokio::time::Instant`, so paused test time applies.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    type Instant = std::time::Instant;

    fn now(&self) -> Self::Instant {
        Instant::now().into_std()
    }
}

type Bucket = GovLimiter<NotKeyed, InMemoryState, TokioClock, NoOpMiddleware<std::time::Instant>>;

/// Admission to make one provider call. Dropping it releases any in-flight slot.
#[derive(Debug)]
pub struct RatePermit {
    _slot: Option<OwnedSemaphorePermit>,
}

impl RatePermit {
    pub fn release(self) {}
}

/// Shared, FIFO-fair rate limiter.
pub struct RateLimiter {
    bucket: Bucket,
    clock: TokioClock,
    queue: Mutex<()>,
    in_flight: Option<Arc<Semaphore>>,
    acquire_timeout: Duration,
}

impl RateLimiter {
    pub fn new(settings: RateLimitSettings) -> Self {
        let burst = NonZeroU32::new(settings.capacity).unwrap_or(NonZeroU32::MIN);
        let rate = if settings.refill_per_sec.is_finite() && settings.refill_per_sec > 0.0 {
            settings.refill_per_sec
        } else {
            1.0
        };
        let quota = Quota::with_period(Duration::from_secs_f64(1.0 / rate))
            .unwrap_or_else(|| Quota::per_second(NonZeroU32::MIN))
            .allow_burst(burst);
        let clock = TokioClock;
        Self {
            bucket: GovLimiter::direct_with_clock(quota, &clock),
            clock,
            queue: Mutex::new(()),
            in_flight: settings
                .max_in_flight
                .map(|n| Arc::new(Semaphore::new(n.max(1)))),
            acquire_timeout: settings.acquire_timeout,
        }
    }

    /// Wait for a permit, up to the configured timeout.
    pub async fn acquire(&self) -> Result<RatePermit, GeocodeError> {
        self.acquire_within(self.acquire_timeout).await
    }

    /// Wait for a permit, up to `timeout`. A timed-out caller consumes no token.
    pub async fn acquire_within(&self, timeout: Duration) -> Result<RatePermit, GeocodeError> {
        let started = Instant::now();
        match tokio::time::timeout(timeout, self.wait_for_permit()).await {
            Ok(permit) => Ok(permit),
            Err(_) => {
                let waited = started.elapsed();
                tracing::warn!(?waited, "rate limiter wait timed out");
                Err(GeocodeError::RateLimitTimeout { waited })
            }
        }
    }

    /// Take a permit only if one is immediately available.
    pub fn try_acquire(&self) -> Option<RatePermit> {
        let slot = match &self.in_flight {
            Some(sem) => Some(Arc::clone(sem).try_acquire_owned().ok()?),
            None => None,
        };
        // Queued waiters go first
        let _turn = self.queue.try_lock().ok()?;
        self.bucket.check().ok()?;
        Some(RatePermit { _slot: slot })
    }

    async fn wait_for_permit(&self) -> RatePermit {
        let slot = match &self.in_flight {
            Some(sem) => Arc::clone(sem).acquire_owned().await.ok(),
            None => None,
        };

        let _turn = self.queue.lock().await;
        while let Err(not_until) = self.bucket.check() {
            let wait = not_until.wait_time_from(self.clock.now());
            tokio::time::sleep(wait).await;
        }
        RatePermit { _slot: slot }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(capacity: u32, rate: f64, timeout_ms: u64) -> Arc<RateLimiter> {
        Arc::new(RateLimiter::new(RateLimitSettings {
            capacity,
            refill_per_sec: rate,
            acquire_timeout: Duration::from_millis(timeout_ms),
            max_in_flight: None,
        }))
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_refill() {
        let rl = limiter(3, 2.0, 10_000);
        let start = Instant::now();
        for _ in 0..3 {
            rl.acquire().await.unwrap();
        }
        assert_eq!(start.elapsed(), Duration::ZERO);

        rl.acquire().await.unwrap();
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(500) && waited < Duration::from_millis(510));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_ceiling_rolling_window() {
        let rl = limiter(1, 4.0, 60_000);
        let admitted = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let start = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..12 {
            let rl = Arc::clone(&rl);
            let admitted = Arc::clone(&admitted);
            handles.push(tokio::spawn(async move {
                rl.acquire().await.unwrap();
                admitted.lock().push(start.elapsed());
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let times = admitted.lock().clone();
        assert_eq!(times.len(), 12);
        for &t in &times {
            let in_window = times
                .iter()
                .filter(|&&u| u >= t && u < t + Duration::from_secs(1))
                .count();
            assert!(in_window <= 4, "{} admissions in window at {:?}", in_window, t);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_typed() {
        let rl = limiter(1, 1.0, 100);
        rl.acquire().await.unwrap();
        match rl.acquire().await {
            Err(GeocodeError::RateLimitTimeout { waited }) => {
                assert!(waited >= Duration::from_millis(100));
            }
            other => panic!("expected RateLimitTimeout, got {:?}", other),
        }
        // The timed-out caller took no token: one is due at t=1s
        tokio::time::sleep(Duration::from_millis(900)).await;
        assert!(rl.try_acquire().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifo_order() {
        let rl = limiter(1, 10.0, 60_000);
        rl.acquire().await.unwrap();

        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..5 {
            let rl = Arc::clone(&rl);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                rl.acquire().await.unwrap();
                order.lock().push(i);
            }));
            // Let the task reach the queue before spawning the next one
            tokio::task::yield_now().await;
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_acquire_rejects_when_empty() {
        let rl = limiter(2, 1.0, 1_000);
        assert!(rl.try_acquire().is_some());
        assert!(rl.try_acquire().is_some());
        assert!(rl.try_acquire().is_none());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(rl.try_acquire().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_in_flight_released_on_drop() {
        let rl = Arc::new(RateLimiter::new(RateLimitSettings {
            capacity: 10,
            refill_per_sec: 100.0,
            acquire_timeout: Duration::from_millis(50),
            max_in_flight: Some(1),
        }));
        let held = rl.acquire().await.unwrap();
        assert!(matches!(
            rl.acquire().await,
            Err(GeocodeError::RateLimitTimeout { .. })
        ));
        held.release();
        assert!(rl.acquire().await.is_ok());
    }
}
