//! Per-actor sliding-window rate limiting.
//!
//! Each actor owns a window of request timestamps. A check prunes timestamps
//! older than the window, then admits the request (and records it) only while
//! the pruned count is below the limit. Rejected requests are not recorded.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Length of the trailing window.
    pub window: Duration,
    /// Requests admitted per window.
    pub max_requests: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            max_requests: 100,
        }
    }
}

/// Result of a rate limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitResult {
    Allowed {
        /// Requests still available in the current window.
        remaining: usize,
    },
    Limited {
        /// When the oldest request leaves the window.
        retry_after: Duration,
    },
}

impl RateLimitResult {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitResult::Allowed { .. })
    }
}

#[derive(Debug)]
struct Windows {
    by_actor: HashMap<String, VecDeque<Instant>>,
    last_sweep: Instant,
}

impl Windows {
    // Drops windows that have emptied out; returns how many were removed.
    fn sweep(&mut self, now: Instant, length: Duration) -> usize {
        let before = self.by_actor.len();
        self.by_actor.retain(|_, w| {
            prune(w, now, length);
            !w.is_empty()
        });
        self.last_sweep = now;
        before - self.by_actor.len()
    }
}

/// Sliding-window limiter keyed by actor.
///
/// Idle actors are dropped once per window length, on the next check.
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: Mutex<Windows>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(Windows {
                by_actor: HashMap::new(),
                last_sweep: Instant::now(),
            }),
        }
    }

    /// Admit or reject one request for `actor_id`.
    pub async fn check(&self, actor_id: &str) -> bool {
        self.check_and_record(actor_id).await.is_allowed()
    }

    pub async fn check_and_record(&self, actor_id: &str) -> RateLimitResult {
        let now = Instant::now();
        let mut windows = self.windows.lock().await;
        if now.saturating_duration_since(windows.last_sweep) >= self.config.window {
            let removed = windows.sweep(now, self.config.window);
            if removed > 0 {
                tracing::debug!(removed, "Dropped idle rate limit windows");
            }
        }
        let window = windows.by_actor.entry(actor_id.to_string()).or_default();

        prune(window, now, self.config.window);

        if window.len() >= self.config.max_requests {
            let retry_after = window
                .front()
                .map(|oldest| (*oldest + self.config.window).saturating_duration_since(now))
                .unwrap_or(self.config.window);
            tracing::debug!(
                actor = actor_id,
                in_window = window.len(),
                "Rate limit reached"
            );
            return RateLimitResult::Limited { retry_after };
        }

        window.push_back(now);
        RateLimitResult::Allowed {
            remaining: self.config.max_requests - window.len(),
        }
    }

    /// Requests currently counted against `actor_id`.
    pub async fn usage(&self, actor_id: &str) -> usize {
        let now = Instant::now();
        let mut windows = self.windows.lock().await;
        windows
            .by_actor
            .get_mut(actor_id)
            .map(|w| {
                prune(w, now, self.config.window);
                w.len()
            })
            .unwrap_or(0)
    }

    /// Drop windows that have emptied out. Returns how many were removed.
    pub async fn sweep(&self) -> usize {
        self.windows
            .lock()
            .await
            .sweep(Instant::now(), self.config.window)
    }

    /// Forget `actor_id`'s window, e.g. after an admin reset.
    pub async fn clear(&self, actor_id: &str) {
        self.windows.lock().await.by_actor.remove(actor_id);
    }

    /// Actors currently tracked.
    pub async fn tracked_actors(&self) -> usize {
        self.windows.lock().await.by_actor.len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

fn prune(window: &mut VecDeque<Instant>, now: Instant, length: Duration) {
    while window
        .front()
        .is_some_and(|t| now.saturating_duration_since(*t) >= length)
    {
        window.pop_front();
    }
}
