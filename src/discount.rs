//! Time-bounded memoization of discount / free-tier lookups.
//!
//! Deciding whether an actor qualifies for a discount on a capability means an
//! expensive on-chain lookup. [`DiscountCache`] keeps the answer per
//! `(actor, capability)` for a TTL, caches failures for a shorter TTL so a
//! failing upstream is not hammered, and never grows past `max_entries`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;

use crate::pricing::{Capability, Discount};

/// The upstream that answers discount questions (e.g. NFT/token holdings).
pub trait DiscountOracle: Send + Sync {
    fn lookup(
        &self,
        actor_id: &str,
        capability: Capability,
    ) -> impl Future<Output = Result<Discount, DiscountLookupError>> + Send;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("discount lookup failed: {0}")]
pub struct DiscountLookupError(pub String);

/// Oracle for deployments without discounts: everyone pays full price.
pub struct NoDiscounts;

impl DiscountOracle for NoDiscounts {
    async fn lookup(
        &self,
        _actor_id: &str,
        _capability: Capability,
    ) -> Result<Discount, DiscountLookupError> {
        Ok(Discount::default())
    }
}

#[derive(Debug, Clone)]
pub struct DiscountCacheConfig {
    /// Lifetime of a successful lookup.
    pub ttl: Duration,
    /// Lifetime of a failed lookup.
    pub error_ttl: Duration,
    pub max_entries: usize,
    /// Retries after the first failed lookup attempt.
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each further retry.
    pub retry_base: Duration,
}

impl Default for DiscountCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(5 * 60),
            error_ttl: Duration::from_secs(30),
            max_entries: 10_000,
            max_retries: 3,
            retry_base: Duration::from_millis(500),
        }
    }
}

impl DiscountCacheConfig {
    /// Delay before retry number `attempt` (0-based).
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        self.retry_base.saturating_mul(2u32.saturating_pow(attempt))
    }
}

/// A cached answer. Failures are cached too, as their error text.
pub type CachedLookup<V> = Result<V, String>;

struct Entry<V> {
    value: CachedLookup<V>,
    inserted_at: Instant,
    ttl: Duration,
}

impl<V> Entry<V> {
    fn is_fresh(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.inserted_at) < self.ttl
    }
}

type Key = (String, Capability);

pub struct DiscountCache<V = Discount> {
    config: DiscountCacheConfig,
    entries: Mutex<HashMap<Key, Entry<V>>>,
}

impl<V: Clone> DiscountCache<V> {
    pub fn new(config: DiscountCacheConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Return the cached answer if it is still fresh; expired entries are evicted.
    pub async fn get(&self, actor_id: &str, capability: Capability) -> Option<CachedLookup<V>> {
        let key = (actor_id.to_string(), capability);
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        match entries.get(&key) {
            Some(entry) if entry.is_fresh(now) => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(&key);
                None
            }
            None => None,
        }
    }

    pub async fn set(&self, actor_id: &str, capability: Capability, value: V) {
        let ttl = self.config.ttl;
        self.insert(actor_id, capability, Ok(value), ttl).await;
    }

    pub async fn set_error(&self, actor_id: &str, capability: Capability, message: String) {
        let ttl = self.config.error_ttl;
        self.insert(actor_id, capability, Err(message), ttl).await;
    }

    pub async fn invalidate(&self, actor_id: &str, capability: Capability) {
        let key = (actor_id.to_string(), capability);
        self.entries.lock().await.remove(&key);
    }

    /// Cached answer, or compute it (retrying with exponential backoff) and cache
    /// whatever comes out, success or failure.
    ///
    /// The lock is not held while `compute` runs, so two concurrent misses for
    /// the same key may both compute; the later insert wins.
    pub async fn get_or_compute<F, Fut, E>(
        &self,
        actor_id: &str,
        capability: Capability,
        mut compute: F,
    ) -> CachedLookup<V>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<V, E>>,
        E: std::fmt::Display,
    {
        if let Some(hit) = self.get(actor_id, capability).await {
            return hit;
        }

        let mut attempt = 0u32;
        let outcome = loop {
            match compute().await {
                Ok(value) => break Ok(value),
                Err(e) if attempt < self.config.max_retries => {
                    let delay = self.config.retry_delay(attempt);
                    tracing::warn!(
                        actor = actor_id,
                        %capability,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Discount lookup failed, retrying"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => break Err(e.to_string()),
            }
        };

        match &outcome {
            Ok(value) => self.set(actor_id, capability, value.clone()).await,
            Err(message) => {
                tracing::warn!(
                    actor = actor_id,
                    %capability,
                    error = %message,
                    "Discount lookup exhausted retries, caching failure"
                );
                self.set_error(actor_id, capability, message.clone()).await
            }
        }
        outcome
    }

    /// Remove expired entries. Returns how many were removed.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, e| e.is_fresh(now));
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    async fn insert(
        &self,
        actor_id: &str,
        capability: Capability,
        value: CachedLookup<V>,
        ttl: Duration,
    ) {
        let key = (actor_id.to_string(), capability);
        let now = Instant::now();
        let mut entries = self.entries.lock().await;

        if !entries.contains_key(&key) && entries.len() >= self.config.max_entries {
            entries.retain(|_, e| e.is_fresh(now));
            if entries.len() >= self.config.max_entries {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, e)| e.inserted_at)
                    .map(|(k, _)| k.clone());
                if let Some(oldest) = oldest {
                    entries.remove(&oldest);
                }
            }
        }

        entries.insert(
            key,
            Entry {
                value,
                inserted_at: now,
                ttl,
            },
        );
    }
}

impl<V: Clone + Send + Sync + 'static> DiscountCache<V> {
    /// Sweep expired entries every `interval` until `cancel` fires.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(interval) => {
                        let removed = self.sweep().await;
                        if removed > 0 {
                            tracing::debug!(removed, "Swept expired discount entries");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn cache() -> DiscountCache<Discount> {
        DiscountCache::new(DiscountCacheConfig::default())
    }

    fn half() -> Discount {
        Discount {
            percent_off: 50,
            free_tier: false,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn value_lives_exactly_one_ttl() {
        let cache = cache();
        cache.set("alice", Capability::Video, half()).await;

        tokio::time::advance(Duration::from_secs(299)).await;
        assert_eq!(cache.get("alice", Capability::Video).await, Some(Ok(half())));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cache.get("alice", Capability::Video).await, None);
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn keys_include_capability() {
        let cache = cache();
        cache.set("alice", Capability::Video, half()).await;
        assert!(cache.get("alice", Capability::Image).await.is_none());
        assert!(cache.get("bob", Capability::Video).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn get_or_compute_caches_success() {
        let cache = cache();
        let calls = AtomicU32::new(0);
        for _ in 0..3 {
            let got = cache
                .get_or_compute("alice", Capability::Image, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, DiscountLookupError>(half())
                })
                .await;
            assert_eq!(got, Ok(half()));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn get_or_compute_retries_then_succeeds() {
        let cache = cache();
        let calls = AtomicU32::new(0);
        let got = cache
            .get_or_compute("alice", Capability::Image, || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(DiscountLookupError("rpc timeout".into()))
                } else {
                    Ok(half())
                }
            })
            .await;
        assert_eq!(got, Ok(half()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_are_cached_for_the_shorter_ttl() {
        let cache = cache();
        let calls = AtomicU32::new(0);
        let lookup = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<Discount, _>(DiscountLookupError("rpc down".into()))
        };

        let got = cache.get_or_compute("alice", Capability::Music, lookup).await;
        assert_eq!(got, Err("discount lookup failed: rpc down".to_string()));
        // First attempt plus three retries.
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        // Cached failure: no new upstream calls.
        let _ = cache.get_or_compute("alice", Capability::Music, lookup).await;
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        tokio::time::advance(Duration::from_secs(30)).await;
        let _ = cache.get_or_compute("alice", Capability::Music, lookup).await;
        assert_eq!(calls.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn retry_delay_doubles() {
        let config = DiscountCacheConfig::default();
        assert_eq!(config.retry_delay(0), Duration::from_millis(500));
        assert_eq!(config.retry_delay(1), Duration::from_millis(1000));
        assert_eq!(config.retry_delay(2), Duration::from_millis(2000));
    }

    #[tokio::test(start_paused = true)]
    async fn size_is_bounded() {
        let cache = DiscountCache::new(DiscountCacheConfig {
            max_entries: 2,
            ..Default::default()
        });
        cache.set("a", Capability::Image, half()).await;
        tokio::time::advance(Duration::from_secs(1)).await;
        cache.set("b", Capability::Image, half()).await;
        tokio::time::advance(Duration::from_secs(1)).await;
        cache.set("c", Capability::Image, half()).await;

        assert_eq!(cache.len().await, 2);
        assert!(cache.get("a", Capability::Image).await.is_none());
        assert!(cache.get("c", Capability::Image).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn invalidate_and_sweep() {
        let cache = cache();
        cache.set("a", Capability::Image, half()).await;
        cache.set("b", Capability::Image, half()).await;
        cache.invalidate("a", Capability::Image).await;
        assert!(cache.get("a", Capability::Image).await.is_none());

        tokio::time::advance(Duration::from_secs(301)).await;
        assert_eq!(cache.sweep().await, 1);
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_task_stops_on_cancel() {
        let cache = Arc::new(cache());
        cache.set("a", Capability::Image, half()).await;
        let cancel = CancellationToken::new();
        let handle = Arc::clone(&cache).spawn_sweeper(Duration::from_secs(60), cancel.clone());

        tokio::time::sleep(Duration::from_secs(400)).await;
        assert_eq!(cache.len().await, 0);

        cancel.cancel();
        handle.await.unwrap();
    }
}
