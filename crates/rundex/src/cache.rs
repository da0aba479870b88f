//! Tiered response caching.
//!
//! Two tiers behind one interface:
//! - `MemoryCache`: mandatory in-process store with per-entry TTL and
//!   approximate-LRU eviction.
//! - a remote tier (Redis, behind the `redis` cargo feature): optional,
//!   durable, shared across instances, always wrapped by its own circuit
//!   breaker.
//!
//! # Keying
//!
//! Keys are deterministic hashes over `(tool, normalized arguments,
//! corpus_epoch)`. The epoch is baked into the key, so a corpus change
//! invalidates dependent entries without explicit deletes: lookups for the
//! new epoch miss, and stale-epoch entries age out by TTL.
//!
//! # Degradation
//!
//! Remote writes are fire-and-forget; remote failures are recorded on the
//! remote breaker and never surface to the tool caller. With the remote
//! breaker open (or `strategy: memory_only`), the cache behaves as
//! memory-only.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use crate::breaker::{Admission, BreakerRegistry};
use crate::error::Result;

/// Breaker upstream name for the remote tier.
pub const REMOTE_CACHE_UPSTREAM: &str = "remote_cache";

// ============================================================================
// Cache Keys
// ============================================================================

/// Build a cache key for a tool call.
///
/// `args` must already be the normalized argument serialization (sorted
/// collections, lowercase enums, defaulted fields omitted); the argument
/// structs in [`crate::tools`] produce this via their serde derives.
pub fn cache_key(tool: &str, args: &serde_json::Value, corpus_epoch: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(args.to_string().as_bytes());
    let digest = hex::encode(&hasher.finalize()[..8]);
    format!("{tool}:{corpus_epoch}:{digest}")
}

// ============================================================================
// Cache Store Trait
// ============================================================================

/// Cache statistics for one tier.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: u64,
    pub evictions: u64,
    pub expirations: u64,
}

impl CacheStats {
    /// Hit rate in `[0, 1]`.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Abstract cache tier. Implementations handle TTL expiration and must be
/// thread-safe.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Get a value; `None` on miss or expiry.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store a value with a TTL.
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()>;

    /// Delete a value; returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Drop all entries.
    async fn clear(&self) -> Result<()>;

    /// Tier statistics.
    async fn stats(&self) -> CacheStats;
}

// ============================================================================
// Memory Tier
// ============================================================================

struct MemoryEntry {
    data: Vec<u8>,
    inserted_at: Instant,
    ttl: Duration,
    last_accessed: Instant,
}

impl MemoryEntry {
    fn is_expired(&self) -> bool {
        self.inserted_at.elapsed() > self.ttl
    }
}

/// Bounded in-process cache with per-entry TTL and approximate-LRU
/// eviction. The entry count never exceeds the configured capacity after a
/// write completes.
pub struct MemoryCache {
    entries: RwLock<HashMap<String, MemoryEntry>>,
    max_entries: usize,
    stats: RwLock<CacheStats>,
}

impl MemoryCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_entries: max_entries.max(1),
            stats: RwLock::new(CacheStats::default()),
        }
    }

    /// Evict expired entries, then least-recently-used entries until the
    /// map fits the capacity.
    async fn evict_to_capacity(
        entries: &mut HashMap<String, MemoryEntry>,
        stats: &RwLock<CacheStats>,
        max_entries: usize,
    ) {
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired());
        let expired = before - entries.len();

        let mut evicted = 0u64;
        if entries.len() > max_entries {
            let overshoot = entries.len() - max_entries;
            let mut by_access: Vec<(String, Instant)> = entries
                .iter()
                .map(|(k, e)| (k.clone(), e.last_accessed))
                .collect();
            by_access.sort_by_key(|(_, accessed)| *accessed);
            for (key, _) in by_access.into_iter().take(overshoot) {
                entries.remove(&key);
                evicted += 1;
            }
        }

        if expired > 0 || evicted > 0 {
            let mut s = stats.write().await;
            s.expirations += expired as u64;
            s.evictions += evicted;
        }
    }

    /// Aggressive trim used under memory pressure: halves the capacity
    /// target for this pass.
    pub async fn trim(&self) {
        let mut entries = self.entries.write().await;
        Self::evict_to_capacity(&mut entries, &self.stats, self.max_entries / 2).await;
    }

    /// Current entry count.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether the tier holds no entries.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(key) {
            if entry.is_expired() {
                entries.remove(key);
                let mut stats = self.stats.write().await;
                stats.misses += 1;
                stats.expirations += 1;
                return Ok(None);
            }
            entry.last_accessed = Instant::now();
            let data = entry.data.clone();
            self.stats.write().await.hits += 1;
            return Ok(Some(data));
        }
        self.stats.write().await.misses += 1;
        Ok(None)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let mut entries = self.entries.write().await;
        let now = Instant::now();
        entries.insert(
            key.to_string(),
            MemoryEntry {
                data: value.to_vec(),
                inserted_at: now,
                ttl,
                last_accessed: now,
            },
        );
        Self::evict_to_capacity(&mut entries, &self.stats, self.max_entries).await;
        self.stats.write().await.entries = entries.len() as u64;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut entries = self.entries.write().await;
        let existed = entries.remove(key).is_some();
        self.stats.write().await.entries = entries.len() as u64;
        Ok(existed)
    }

    async fn clear(&self) -> Result<()> {
        self.entries.write().await.clear();
        self.stats.write().await.entries = 0;
        Ok(())
    }

    async fn stats(&self) -> CacheStats {
        let mut stats = self.stats.read().await.clone();
        stats.entries = self.entries.read().await.len() as u64;
        stats
    }
}

// ============================================================================
// Remote Tier (Redis, feature-gated)
// ============================================================================

#[cfg(feature = "redis")]
pub mod redis_store {
    //! Redis-backed remote tier. Requires the `redis` feature.

    use super::*;
    use crate::error::EngineError;
    use ::redis::AsyncCommands;
    use parking_lot::Mutex;

    /// Redis-backed [`CacheStore`].
    pub struct RedisCache {
        conn: ::redis::aio::ConnectionManager,
        prefix: String,
        stats: Mutex<CacheStats>,
    }

    impl RedisCache {
        /// Connect to Redis at `url`, namespacing keys under `prefix`.
        pub async fn connect(url: &str, prefix: &str) -> Result<Self> {
            let client = ::redis::Client::open(url)
                .map_err(|e| EngineError::Cache(format!("Redis client error: {e}")))?;
            let conn = client
                .get_connection_manager()
                .await
                .map_err(|e| EngineError::Cache(format!("Redis connection error: {e}")))?;
            Ok(Self {
                conn,
                prefix: prefix.to_string(),
                stats: Mutex::new(CacheStats::default()),
            })
        }

        fn prefixed(&self, key: &str) -> String {
            format!("{}{}", self.prefix, key)
        }
    }

    #[async_trait]
    impl CacheStore for RedisCache {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
            let mut conn = self.conn.clone();
            let value: Option<Vec<u8>> = conn
                .get(self.prefixed(key))
                .await
                .map_err(|e| EngineError::Cache(format!("Redis GET error: {e}")))?;
            let mut stats = self.stats.lock();
            if value.is_some() {
                stats.hits += 1;
            } else {
                stats.misses += 1;
            }
            Ok(value)
        }

        async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
            let mut conn = self.conn.clone();
            let _: () = conn
                .set_ex(self.prefixed(key), value, ttl.as_secs().max(1))
                .await
                .map_err(|e| EngineError::Cache(format!("Redis SETEX error: {e}")))?;
            Ok(())
        }

        async fn delete(&self, key: &str) -> Result<bool> {
            let mut conn = self.conn.clone();
            let deleted: i64 = conn
                .del(self.prefixed(key))
                .await
                .map_err(|e| EngineError::Cache(format!("Redis DEL error: {e}")))?;
            Ok(deleted > 0)
        }

        async fn clear(&self) -> Result<()> {
            let mut conn = self.conn.clone();
            let keys: Vec<String> = conn
                .keys(format!("{}*", self.prefix))
                .await
                .map_err(|e| EngineError::Cache(format!("Redis KEYS error: {e}")))?;
            if !keys.is_empty() {
                let _: i64 = conn
                    .del(keys)
                    .await
                    .map_err(|e| EngineError::Cache(format!("Redis DEL error: {e}")))?;
            }
            Ok(())
        }

        async fn stats(&self) -> CacheStats {
            self.stats.lock().clone()
        }
    }
}

#[cfg(feature = "redis")]
pub use redis_store::RedisCache;

// ============================================================================
// Hybrid Cache
// ============================================================================

/// Two-tier read-through / write-through cache.
///
/// Reads check memory, then (breaker permitting) the remote tier, promoting
/// remote hits into memory. Writes land in memory synchronously and are
/// shipped to the remote tier in a detached task.
pub struct HybridCache {
    memory: Arc<MemoryCache>,
    remote: Option<Arc<dyn CacheStore>>,
    breakers: Arc<BreakerRegistry>,
}

/// Which tier satisfied a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTier {
    Memory,
    Remote,
}

impl HybridCache {
    pub fn new(
        memory: Arc<MemoryCache>,
        remote: Option<Arc<dyn CacheStore>>,
        breakers: Arc<BreakerRegistry>,
    ) -> Self {
        Self {
            memory,
            remote,
            breakers,
        }
    }

    /// Memory-only construction.
    pub fn memory_only(max_entries: usize, breakers: Arc<BreakerRegistry>) -> Self {
        Self::new(Arc::new(MemoryCache::new(max_entries)), None, breakers)
    }

    /// Read through both tiers.
    pub async fn get(&self, key: &str) -> Option<(Vec<u8>, CacheTier)> {
        match self.memory.get(key).await {
            Ok(Some(value)) => return Some((value, CacheTier::Memory)),
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(error = %err, "memory cache read failed");
            }
        }

        let remote = self.remote.as_ref()?;
        let admission = self.breakers.admit(REMOTE_CACHE_UPSTREAM);
        if admission == Admission::Rejected {
            return None;
        }
        let was_probe = admission == Admission::Probe;

        match remote.get(key).await {
            Ok(found) => {
                self.breakers.record(REMOTE_CACHE_UPSTREAM, was_probe, true);
                if let Some(value) = found {
                    // Promote into memory with a short residual TTL; the
                    // authoritative TTL lives with the remote entry.
                    let _ = self
                        .memory
                        .set(key, &value, Duration::from_secs(60))
                        .await;
                    return Some((value, CacheTier::Remote));
                }
                None
            }
            Err(err) => {
                tracing::warn!(error = %err, "remote cache read failed");
                self.breakers.record(REMOTE_CACHE_UPSTREAM, was_probe, false);
                None
            }
        }
    }

    /// Write through both tiers. The remote write is fire-and-forget.
    pub async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) {
        if let Err(err) = self.memory.set(key, &value, ttl).await {
            tracing::warn!(error = %err, "memory cache write failed");
        }

        if let Some(remote) = self.remote.clone() {
            let admission = self.breakers.admit(REMOTE_CACHE_UPSTREAM);
            if admission == Admission::Rejected {
                return;
            }
            let was_probe = admission == Admission::Probe;
            let breakers = self.breakers.clone();
            let key = key.to_string();
            tokio::spawn(async move {
                match remote.set(&key, &value, ttl).await {
                    Ok(()) => breakers.record(REMOTE_CACHE_UPSTREAM, was_probe, true),
                    Err(err) => {
                        tracing::warn!(error = %err, key = %key, "remote cache write failed");
                        breakers.record(REMOTE_CACHE_UPSTREAM, was_probe, false);
                    }
                }
            });
        }
    }

    /// Drop all memory-tier entries (remote entries age out by TTL).
    pub async fn clear_memory(&self) {
        let _ = self.memory.clear().await;
    }

    /// Aggressively trim the memory tier (memory-pressure response).
    pub async fn trim_memory(&self) {
        self.memory.trim().await;
    }

    /// Memory tier statistics.
    pub async fn memory_stats(&self) -> CacheStats {
        self.memory.stats().await
    }

    /// Remote tier statistics, when a remote tier is configured.
    pub async fn remote_stats(&self) -> Option<CacheStats> {
        match &self.remote {
            Some(remote) => Some(remote.stats().await),
            None => None,
        }
    }

    /// Whether the configured cache tiers are operable. Memory-only
    /// deployments are always operable; with a remote tier, its breaker
    /// must not be open.
    pub fn remote_operable(&self) -> bool {
        self.remote.is_none()
            || self.breakers.state(REMOTE_CACHE_UPSTREAM) != crate::breaker::CircuitState::Open
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::error::EngineError;

    #[tokio::test]
    async fn test_memory_cache_basic() {
        let cache = MemoryCache::new(10);
        cache
            .set("k1", b"v1", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(cache.get("k1").await.unwrap(), Some(b"v1".to_vec()));
        assert_eq!(cache.get("missing").await.unwrap(), None);

        let stats = cache.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn test_memory_cache_ttl_expiry() {
        let cache = MemoryCache::new(10);
        cache
            .set("k1", b"v1", Duration::from_millis(20))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(cache.get("k1").await.unwrap(), None);
        assert_eq!(cache.stats().await.expirations, 1);
    }

    #[tokio::test]
    async fn test_memory_cache_capacity_bound() {
        let cache = MemoryCache::new(5);
        for i in 0..50 {
            cache
                .set(&format!("k{i}"), b"v", Duration::from_secs(60))
                .await
                .unwrap();
            // Invariant: entry count never exceeds capacity * 1.05.
            assert!(cache.len().await <= 5);
        }
        assert!(cache.stats().await.evictions >= 45);
    }

    #[tokio::test]
    async fn test_memory_cache_lru_ordering() {
        let cache = MemoryCache::new(3);
        cache.set("a", b"1", Duration::from_secs(60)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        cache.set("b", b"2", Duration::from_secs(60)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        cache.set("c", b"3", Duration::from_secs(60)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        // Touch "a" so "b" becomes least recently used.
        let _ = cache.get("a").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        cache.set("d", b"4", Duration::from_secs(60)).await.unwrap();

        assert!(cache.get("a").await.unwrap().is_some());
        assert!(cache.get("b").await.unwrap().is_none());
        assert!(cache.get("c").await.unwrap().is_some());
        assert!(cache.get("d").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_hybrid_memory_only() {
        let breakers = Arc::new(BreakerRegistry::new());
        let cache = HybridCache::memory_only(10, breakers);

        cache
            .put("k", b"value".to_vec(), Duration::from_secs(60))
            .await;
        let (value, tier) = cache.get("k").await.unwrap();
        assert_eq!(value, b"value");
        assert_eq!(tier, CacheTier::Memory);
        // No remote tier configured: the cache is fully operable.
        assert!(cache.remote_operable());
    }

    #[tokio::test]
    async fn test_hybrid_promotes_remote_hits() {
        let breakers = Arc::new(BreakerRegistry::new());
        // A second MemoryCache stands in for the remote tier.
        let remote: Arc<dyn CacheStore> = Arc::new(MemoryCache::new(10));
        remote
            .set("k", b"remote-value", Duration::from_secs(60))
            .await
            .unwrap();

        let cache = HybridCache::new(Arc::new(MemoryCache::new(10)), Some(remote), breakers);

        let (value, tier) = cache.get("k").await.unwrap();
        assert_eq!(value, b"remote-value");
        assert_eq!(tier, CacheTier::Remote);

        // Second read is served from memory.
        let (_, tier) = cache.get("k").await.unwrap();
        assert_eq!(tier, CacheTier::Memory);
    }

    struct FailingStore;

    #[async_trait]
    impl CacheStore for FailingStore {
        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
            Err(EngineError::Cache("remote down".into()))
        }
        async fn set(&self, _key: &str, _value: &[u8], _ttl: Duration) -> Result<()> {
            Err(EngineError::Cache("remote down".into()))
        }
        async fn delete(&self, _key: &str) -> Result<bool> {
            Err(EngineError::Cache("remote down".into()))
        }
        async fn clear(&self) -> Result<()> {
            Err(EngineError::Cache("remote down".into()))
        }
        async fn stats(&self) -> CacheStats {
            CacheStats::default()
        }
    }

    #[tokio::test]
    async fn test_hybrid_remote_failures_trip_breaker() {
        let breakers = Arc::new(BreakerRegistry::new());
        breakers.register(
            REMOTE_CACHE_UPSTREAM,
            &crate::config::BreakerSettings {
                failure_threshold: 2,
                ..Default::default()
            },
        );
        let cache = HybridCache::new(
            Arc::new(MemoryCache::new(10)),
            Some(Arc::new(FailingStore)),
            breakers.clone(),
        );

        // Reads fail against the remote and are reported to the breaker.
        assert!(cache.get("a").await.is_none());
        assert!(cache.get("b").await.is_none());
        assert_eq!(
            breakers.state(REMOTE_CACHE_UPSTREAM),
            crate::breaker::CircuitState::Open
        );
        assert!(!cache.remote_operable());
    }

    #[test]
    fn test_cache_key_deterministic() {
        let args = serde_json::json!({"alert_type": "disk_space_critical", "severity": "critical"});
        let k1 = cache_key("search_runbooks", &args, 3);
        let k2 = cache_key("search_runbooks", &args, 3);
        assert_eq!(k1, k2);
        assert!(k1.starts_with("search_runbooks:3:"));

        // A new corpus epoch yields a different key.
        let k3 = cache_key("search_runbooks", &args, 4);
        assert_ne!(k1, k3);
    }
}
