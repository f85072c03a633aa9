/// Admission control for `/ask`.
///
/// Every admitted question holds the local model for a full generation, so excess
/// requests are turned away before retrieval starts. `/health` is never limited.
///
/// Implemented as a generic cell rate algorithm: one timestamp records when the bucket
/// will next be empty, and a request is admitted while that lies no more than
/// `burst - 1` emission intervals in the future.
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("rate limit exceeded ({rps} questions/s, burst {burst}): retry in {}ms", retry_after.as_millis())]
pub struct RateLimited {
    pub rps: u32,
    pub burst: u32,
    pub retry_after: Duration,
}

#[derive(Clone)]
pub struct RateLimiter {
    rps: u32,
    burst: u32,
    interval: Duration,
    tolerance: Duration,
    /// Theoretical arrival time of the next request at the sustained rate.
    next_at: Arc<Mutex<Instant>>,
}

impl RateLimiter {
    /// `None` when either the rate or the burst is zero.
    pub fn new(rps: u32, burst: u32) -> Option<Self> {
        if rps == 0 || burst == 0 {
            return None;
        }
        let interval = Duration::from_secs(1) / rps;
        Some(Self {
            rps,
            burst,
            interval,
            tolerance: interval * (burst - 1),
            next_at: Arc::new(Mutex::new(Instant::now())),
        })
    }

    pub fn rps(&self) -> u32 {
        self.rps
    }

    pub fn burst(&self) -> u32 {
        self.burst
    }

    pub async fn check(&self) -> Result<(), RateLimited> {
        self.check_at(Instant::now()).await
    }

    async fn check_at(&self, now: Instant) -> Result<(), RateLimited> {
        let mut next_at = self.next_at.lock().await;
        let arrival = (*next_at).max(now);
        let backlog = arrival.saturating_duration_since(now);

        if backlog > self.tolerance {
            return Err(RateLimited {
                rps: self.rps,
                burst: self.burst,
                retry_after: backlog - self.tolerance,
            });
        }

        *next_at = arrival + self.interval;
        Ok(())
    }
}
