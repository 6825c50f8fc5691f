// Request rate limiter.
// A GCRA token bucket (governor) bounds requests per second and a semaphore
// bounds requests in flight. Callers are delayed, never rejected, unless
// their deadline passes or they are cancelled.

use b24_core::{B24Error, RestrictionPolicy};
use governor::clock::{Clock, DefaultClock};
use governor::{DefaultDirectRateLimiter, Quota};
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

/// Slot held for the duration of one request; released on drop
#[derive(Debug)]
pub struct RatePermit {
    _slot: OwnedSemaphorePermit,
}

pub struct RateLimiter {
    policy: RestrictionPolicy,
    bucket: DefaultDirectRateLimiter,
    clock: DefaultClock,
    slots: Arc<Semaphore>,
    /// New acquisitions wait until this instant after a server-side rejection
    cooldown_until: Mutex<Option<Instant>>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("policy", &self.policy)
            .field("available_slots", &self.slots.available_permits())
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    pub fn new(policy: RestrictionPolicy) -> Result<Self, B24Error> {
        policy.validate().map_err(B24Error::Configuration)?;
        let burst = NonZeroU32::new(policy.burst)
            .ok_or_else(|| B24Error::configuration("burst must be at least 1"))?;
        let quota = policy
            .min_interval()
            .and_then(Quota::with_period)
            .ok_or_else(|| B24Error::configuration("request interval must be positive"))?
            .allow_burst(burst);

        Ok(Self {
            bucket: governor::RateLimiter::direct(quota),
            clock: DefaultClock::default(),
            slots: Arc::new(Semaphore::new(policy.max_concurrent_batch_commands)),
            cooldown_until: Mutex::new(None),
            policy,
        })
    }

    pub fn policy(&self) -> &RestrictionPolicy {
        &self.policy
    }

    /// Requests currently holding a permit
    pub fn in_flight(&self) -> usize {
        self.policy.max_concurrent_batch_commands - self.slots.available_permits()
    }

    /// Wait for a concurrency slot and a rate token.
    ///
    /// `deadline` bounds the total wait; exceeding it yields
    /// [`B24Error::RateLimitTimeout`]. A triggered `cancel` yields
    /// [`B24Error::Cancelled`].
    pub async fn acquire(
        &self,
        deadline: Option<Duration>,
        cancel: Option<&CancellationToken>,
    ) -> Result<RatePermit, B24Error> {
        let started = Instant::now();
        let wait = self.wait_for_permit();

        let outcome = match deadline {
            Some(limit) => match tokio::time::timeout(limit, with_cancel(wait, cancel)).await {
                Ok(result) => result,
                Err(_) => Err(B24Error::RateLimitTimeout {
                    waited: started.elapsed(),
                }),
            },
            None => with_cancel(wait, cancel).await,
        };

        if outcome.is_ok() && started.elapsed() > Duration::from_millis(1) {
            trace!(waited = ?started.elapsed(), "Rate limiter delayed request");
        }
        outcome
    }

    async fn wait_for_permit(&self) -> Result<RatePermit, B24Error> {
        let slot = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| B24Error::Cancelled)?;

        loop {
            let cooldown = self.cooldown_until.lock().ok().and_then(|c| *c);
            if let Some(until) = cooldown {
                if until > Instant::now() {
                    tokio::time::sleep_until(until).await;
                    continue;
                }
            }

            match self.bucket.check() {
                Ok(()) => return Ok(RatePermit { _slot: slot }),
                Err(not_until) => {
                    let pause = not_until.wait_time_from(self.clock.now());
                    tokio::time::sleep(pause).await;
                }
            }
        }
    }

    /// Pause new acquisitions for the policy's sleep interval.
    ///
    /// Called when the server reports that the portal's limit was exceeded.
    pub fn penalize(&self) {
        let until = Instant::now() + self.policy.sleep_interval();
        if let Ok(mut cooldown) = self.cooldown_until.lock() {
            if cooldown.is_none_or(|current| current < until) {
                *cooldown = Some(until);
            }
        }
        warn!(
            sleep_ms = self.policy.sleep_interval_ms,
            "Server rejected request rate, cooling down"
        );
    }
}

async fn with_cancel<F>(fut: F, cancel: Option<&CancellationToken>) -> Result<RatePermit, B24Error>
where
    F: std::future::Future<Output = Result<RatePermit, B24Error>>,
{
    match cancel {
        Some(token) => tokio::select! {
            _ = token.cancelled() => Err(B24Error::Cancelled),
            result = fut => result,
        },
        None => fut.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(rps: f64, burst: u32, concurrent: usize) -> RestrictionPolicy {
        RestrictionPolicy {
            max_requests_per_second: rps,
            burst,
            max_concurrent_batch_commands: concurrent,
            sleep_interval_ms: 100,
        }
    }

    #[test]
    fn test_rejects_invalid_policy() {
        assert!(RateLimiter::new(policy(0.0, 1, 1)).is_err());
        assert!(RateLimiter::new(policy(1.0, 0, 1)).is_err());
        assert!(RateLimiter::new(policy(1.0, 1, 0)).is_err());
        assert!(RateLimiter::new(policy(1e-300, 1, 1)).is_err());
    }

    #[tokio::test]
    async fn test_calls_are_spaced_after_burst() {
        let limiter = RateLimiter::new(policy(20.0, 1, 4)).unwrap();
        let started = std::time::Instant::now();
        let mut last = started;
        for i in 0..5 {
            let _permit = limiter.acquire(None, None).await.unwrap();
            let now = std::time::Instant::now();
            if i > 0 {
                // 1/R = 50ms, allow scheduler jitter
                assert!(now - last >= Duration::from_millis(40), "call {} too early", i);
            }
            last = now;
        }
        // (M-1)/R = 200ms
        assert!(started.elapsed() >= Duration::from_millis(190));
    }

    #[tokio::test]
    async fn test_burst_is_immediate() {
        let limiter = RateLimiter::new(policy(1.0, 5, 5)).unwrap();
        let started = std::time::Instant::now();
        let mut permits = Vec::new();
        for _ in 0..5 {
            permits.push(limiter.acquire(None, None).await.unwrap());
        }
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(limiter.in_flight(), 5);
        drop(permits);
        assert_eq!(limiter.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_deadline_on_exhausted_slots() {
        let limiter = RateLimiter::new(policy(100.0, 10, 1)).unwrap();
        let _held = limiter.acquire(None, None).await.unwrap();
        let result = limiter
            .acquire(Some(Duration::from_millis(30)), None)
            .await;
        assert!(matches!(result, Err(B24Error::RateLimitTimeout { .. })));
    }

    #[tokio::test]
    async fn test_cancel_releases_waiter() {
        let limiter = RateLimiter::new(policy(100.0, 10, 1)).unwrap();
        let held = limiter.acquire(None, None).await.unwrap();

        let token = CancellationToken::new();
        token.cancel();
        let result = limiter.acquire(None, Some(&token)).await;
        assert!(matches!(result, Err(B24Error::Cancelled)));

        drop(held);
        assert!(limiter.acquire(None, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_penalize_delays_next_acquire() {
        let limiter = RateLimiter::new(policy(100.0, 10, 2)).unwrap();
        limiter.penalize();
        let started = std::time::Instant::now();
        let _permit = limiter.acquire(None, None).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(90));
    }
}
