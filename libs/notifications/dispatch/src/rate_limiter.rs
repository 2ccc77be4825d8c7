//! Per-channel rate limiting
//!
//! Permits are spaced `60s / rate_per_minute` apart. At most `burst` of them
//! (one by default) are available back to back, so idle time never builds up
//! a backlog of sends and no rolling minute sees more than `rate_per_minute`
//! acquisitions.
//!
//! The GCRA state lives in a `governor` limiter driven by the tokio clock,
//! so paused-time tests and the timers in the worker pool agree on `now`.

use governor::clock::{Clock, Reference};
use governor::middleware::NoOpMiddleware;
use governor::nanos::Nanos;
use governor::state::{InMemoryState, NotKeyed};
use governor::Quota;
use std::num::NonZeroU32;
use std::ops::Add;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::trace;

const MINUTE: Duration = Duration::from_secs(60);

/// `tokio::time::Instant` as a governor time reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct TokioInstant(Instant);

impl Add<Nanos> for TokioInstant {
    type Output = Self;

    fn add(self, other: Nanos) -> Self {
        Self(self.0 + Duration::from(other))
    }
}

impl Reference for TokioInstant {
    fn duration_since(&self, earlier: Self) -> Nanos {
        self.0.saturating_duration_since(earlier.0).into()
    }

    fn saturating_sub(&self, duration: Nanos) -> Self {
        Self(self.0.checked_sub(duration.into()).unwrap_or(self.0))
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct TokioClock;

impl Clock for TokioClock {
    type Instant = TokioInstant;

    fn now(&self) -> TokioInstant {
        TokioInstant(Instant::now())
    }
}

type DirectLimiter =
    governor::RateLimiter<NotKeyed, InMemoryState, TokioClock, NoOpMiddleware<TokioInstant>>;

pub struct RateLimiter {
    rate_per_minute: u32,
    limiter: Option<Mutex<DirectLimiter>>,
}

impl RateLimiter {
    /// `rate_per_minute == 0` disables limiting.
    pub fn new(rate_per_minute: u32) -> Self {
        Self::with_burst(rate_per_minute, 1)
    }

    /// Limiter allowing up to `burst` back-to-back acquisitions.
    /// `burst` is clamped to `1..=rate_per_minute`.
    pub fn with_burst(rate_per_minute: u32, burst: u32) -> Self {
        if rate_per_minute == 0 {
            return Self::unlimited();
        }

        let burst = NonZeroU32::new(burst.clamp(1, rate_per_minute)).unwrap_or(NonZeroU32::MIN);
        let Some(quota) = Quota::with_period(MINUTE / rate_per_minute) else {
            return Self::unlimited();
        };

        Self {
            rate_per_minute,
            limiter: Some(Mutex::new(DirectLimiter::direct_with_clock(
                quota.allow_burst(burst),
                TokioClock,
            ))),
        }
    }

    pub fn unlimited() -> Self {
        Self {
            rate_per_minute: 0,
            limiter: None,
        }
    }

    pub fn rate_per_minute(&self) -> u32 {
        self.rate_per_minute
    }

    pub fn is_unlimited(&self) -> bool {
        self.limiter.is_none()
    }

    /// Wait for a permit.
    ///
    /// Waiters are served in arrival order: the limiter lock is fair and is
    /// held while sleeping, so later callers queue behind the sleeper.
    pub async fn acquire(&self) {
        let Some(limiter) = &self.limiter else {
            return;
        };

        let limiter = limiter.lock().await;
        while let Err(not_until) = limiter.check() {
            let wait = not_until.wait_time_from(TokioClock.now());
            trace!(
                wait_ms = wait.as_millis() as u64,
                rate_per_minute = self.rate_per_minute,
                "Rate limit reached, waiting for permit"
            );
            tokio::time::sleep(wait).await;
        }
    }
}
