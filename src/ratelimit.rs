//! Request rate limiting.
//!
//! The runner acquires one permit per outgoing request, right before
//! dispatch. The limiter is shared by every concurrent run of a scan.

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::trace;

use crate::cancel::CancelSignal;
use crate::error::ExecError;

/// Capability: block until `n` permits are available.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Takes `n` permits, waiting for capacity. Returns
    /// [`ExecError::Cancelled`] if `cancel` fires first.
    async fn acquire(&self, n: u32, cancel: &CancelSignal) -> Result<(), ExecError>;
}

/// A limiter that never waits.
#[derive(Clone, Copy, Debug, Default)]
pub struct Unlimited;

#[async_trait]
impl RateLimiter for Unlimited {
    async fn acquire(&self, _n: u32, cancel: &CancelSignal) -> Result<(), ExecError> {
        if cancel.is_cancelled() {
            return Err(ExecError::Cancelled);
        }
        Ok(())
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket refilled continuously at `rate` permits per second, holding
/// at most `burst` permits. Starts full.
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(rate_per_sec: u32, burst: u32) -> Self {
        let rate = f64::from(rate_per_sec.max(1));
        let burst = f64::from(burst.max(1));
        TokenBucket {
            rate,
            burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    /// A bucket whose burst equals its per-second rate.
    pub fn per_second(rate_per_sec: u32) -> Self {
        Self::new(rate_per_sec, rate_per_sec)
    }

    /// Takes `n` permits if available, otherwise returns how long to wait.
    async fn try_take(&self, n: f64) -> Option<Duration> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.burst);
        state.last_refill = now;

        if state.tokens >= n {
            state.tokens -= n;
            None
        } else {
            let deficit = n - state.tokens;
            Some(Duration::from_secs_f64(deficit / self.rate))
        }
    }
}

#[async_trait]
impl RateLimiter for TokenBucket {
    async fn acquire(&self, n: u32, cancel: &CancelSignal) -> Result<(), ExecError> {
        // Requests larger than the bucket would never fit.
        let wanted = f64::from(n).min(self.burst);
        loop {
            if cancel.is_cancelled() {
                return Err(ExecError::Cancelled);
            }
            let Some(wait) = self.try_take(wanted).await else {
                return Ok(());
            };
            trace!(?wait, "rate limit reached; waiting");
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = cancel.cancelled() => return Err(ExecError::Cancelled),
            }
        }
    }
}
