//! Per-owner ingress rate limiting.
//!
//! Fixed one-minute windows keyed by owner hash. Cheap, lock-free reads via
//! `DashMap`; precision beyond "100 creates a minute per key" is not a goal.

use std::time::{Duration, Instant};

use dashmap::DashMap;

struct Window {
    started: Instant,
    count: u32,
}

/// Fixed-window rate limiter.
pub struct RateLimiter {
    windows: DashMap<String, Window>,
    limit: u32,
    period: Duration,
}

impl RateLimiter {
    pub fn new(limit_per_minute: u32) -> Self {
        Self {
            windows: DashMap::new(),
            limit: limit_per_minute,
            period: Duration::from_secs(60),
        }
    }

    /// Record one request for `owner_hash`. `Ok` admits it; `Err` carries
    /// the seconds until the current window resets (for `Retry-After`).
    pub fn check(&self, owner_hash: &str) -> Result<(), u64> {
        let now = Instant::now();
        let mut entry = self.windows.entry(owner_hash.to_string()).or_insert(Window {
            started: now,
            count: 0,
        });

        if now.duration_since(entry.started) >= self.period {
            entry.started = now;
            entry.count = 0;
        }

        if entry.count >= self.limit {
            let elapsed = now.duration_since(entry.started);
            let retry_after = self.period.saturating_sub(elapsed).as_secs().max(1);
            return Err(retry_after);
        }

        entry.count += 1;
        Ok(())
    }
}
