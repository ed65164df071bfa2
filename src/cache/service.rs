//! Cache Service
//!
//! The façade every caller goes through. Composes the L1 cache, the shared
//! store, the tag index, the invalidation bus, the lock manager and the rate
//! limiter behind one cheaply cloneable handle.
//!
//! Failure policy: the cache is an optimization, so store failures never
//! reach callers of read paths. Reads degrade to misses, invalidations to
//! zero counts, and everything is logged. Only serialization errors and
//! factory errors surface.

use crate::cache::config::CacheConfig;
use crate::cache::entry::{expiry, CacheOptions, Freshness, FreshnessMeta};
use crate::cache::events::{InvalidationBus, InvalidationScope};
use crate::cache::local::LocalCache;
use crate::cache::lock::{LockGuard, LockManager, LockOptions, LockToken};
use crate::cache::metrics::{CacheStats, StatsSnapshot};
use crate::cache::rate_limit::{RateLimitDecision, RateLimiter};
use crate::cache::storage::{bounded, MemoryStore, SharedStoreRef};
use crate::cache::swr::RefreshTracker;
use crate::cache::tags::TagIndex;
use crate::error::{Error, Result};
use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

// =============================================================================
// Cache Service
// =============================================================================

/// Two-tier cache handle; clones share all state
#[derive(Clone)]
pub struct CacheService {
    pub(crate) store: SharedStoreRef,
    pub(crate) local: Arc<LocalCache>,
    pub(crate) tags: Arc<TagIndex>,
    pub(crate) bus: Arc<InvalidationBus>,
    pub(crate) refreshes: Arc<RefreshTracker>,
    pub(crate) locks: Arc<LockManager>,
    pub(crate) limiter: Arc<RateLimiter>,
    pub(crate) stats: Arc<CacheStats>,
    pub(crate) config: Arc<CacheConfig>,
}

impl CacheService {
    /// Create a service over `store` with a fresh instance identity
    pub fn new(store: SharedStoreRef, config: CacheConfig) -> Self {
        let instance_id = Uuid::new_v4().simple().to_string();
        let timeout = config.store_timeout();

        info!(
            backend = store.backend(),
            instance = %instance_id,
            local_ceiling_secs = config.local_ceiling_secs,
            default_ttl_secs = config.default_ttl_secs,
            "Cache service created"
        );

        Self {
            local: Arc::new(LocalCache::new(config.local_ceiling())),
            tags: Arc::new(TagIndex::new(store.clone(), config.tag_ttl_margin(), timeout)),
            bus: Arc::new(InvalidationBus::new(
                store.clone(),
                config.invalidation_channel.clone(),
                instance_id,
                timeout,
            )),
            refreshes: Arc::new(RefreshTracker::new()),
            locks: Arc::new(LockManager::new(store.clone(), config.lock.clone(), timeout)),
            limiter: Arc::new(RateLimiter::new(store.clone(), timeout)),
            stats: Arc::new(CacheStats::new()),
            config: Arc::new(config),
            store,
        }
    }

    /// Create a service over a private in-process store
    pub fn in_memory(config: CacheConfig) -> Self {
        Self::new(Arc::new(MemoryStore::new()), config)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn store(&self) -> &SharedStoreRef {
        &self.store
    }

    /// Identifier stamped on this instance's invalidation notices
    pub fn instance_id(&self) -> &str {
        self.bus.instance_id()
    }

    /// Number of entries currently held in L1
    pub fn local_len(&self) -> usize {
        self.local.len()
    }

    /// Payload bytes held in this instance's L1
    pub fn local_bytes(&self) -> usize {
        self.local.size_bytes()
    }

    /// Stale-while-revalidate refreshes currently running in this instance
    pub fn refreshes_in_flight(&self) -> usize {
        self.refreshes.in_flight()
    }

    fn timeout(&self) -> Duration {
        self.config.store_timeout()
    }

    // =========================================================================
    // Reads and writes
    // =========================================================================

    /// Read a value, consulting L1 first and then the shared store
    ///
    /// A shared-store hit populates L1 for at most the remaining shared TTL
    /// or the L1 ceiling, whichever is shorter. Store failures and values
    /// that do not decode as `T` are reported as misses.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = match self.fetch(key).await {
            Some(bytes) => match serde_json::from_slice(&bytes) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!(key = %key, error = %e, "Failed to decode cached value");
                    None
                }
            },
            None => None,
        };

        if value.is_some() {
            self.stats.record_hit();
        } else {
            self.stats.record_miss();
        }
        value
    }

    async fn fetch(&self, key: &str) -> Option<Arc<Vec<u8>>> {
        if let Some(bytes) = self.local.get(key) {
            return Some(bytes);
        }

        let seen = self.local.generation();
        match bounded("GET", self.timeout(), self.store.get(key)).await {
            Ok(Some(stored)) => {
                let bytes = Arc::new(stored.bytes);
                self.local.fill(key, bytes.clone(), stored.ttl, seen);
                Some(bytes)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(key = %key, error = %e, "Shared store read failed, treating as miss");
                None
            }
        }
    }

    /// Write a value to both tiers
    ///
    /// Serialization errors are returned. A shared-store failure is logged
    /// and the write still lands in L1, so this instance keeps serving it
    /// until the L1 ceiling.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        options: CacheOptions,
    ) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        let ttl = options.resolve_ttl(&self.config);
        self.write(key, bytes, ttl, &options.tags).await;
        Ok(())
    }

    async fn write(&self, key: &str, bytes: Vec<u8>, ttl: Duration, tags: &[String]) {
        let shared_ttl = expiry(ttl);
        self.local.remove(key);
        match bounded("SET", self.timeout(), self.store.set(key, &bytes, shared_ttl)).await {
            Ok(()) => {
                if !tags.is_empty() {
                    if let Err(e) = self.tags.add(key, tags, ttl).await {
                        warn!(key = %key, tags = ?tags, error = %e, "Failed to index tags");
                    }
                }
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Shared store write failed, keeping value in L1 only");
            }
        }

        // After the store call, so a reader that fetched the old value cannot
        // leave it in L1
        self.local.insert(key, Arc::new(bytes), shared_ttl);
        self.stats.record_write();
    }

    /// Read-through: return the cached value or compute, store and return it
    ///
    /// On a miss the factory runs exactly once; its error is returned and
    /// nothing is cached.
    pub async fn get_or_set<T, F, Fut>(&self, key: &str, factory: F, options: CacheOptions) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        if let Some(value) = self.get(key).await {
            return Ok(value);
        }

        let value = factory().await.map_err(Error::Factory)?;
        self.set(key, &value, options).await?;
        Ok(value)
    }

    /// Read many keys; every requested key appears in the result
    ///
    /// L1 is consulted per key and the rest are fetched in one batch. Batch
    /// results carry no TTL, so they are not copied into L1.
    pub async fn mget<T: DeserializeOwned>(&self, keys: &[String]) -> HashMap<String, Option<T>> {
        let mut found: HashMap<String, Option<Arc<Vec<u8>>>> = HashMap::with_capacity(keys.len());
        let mut missing = Vec::new();
        for key in keys {
            match self.local.get(key) {
                Some(bytes) => {
                    found.insert(key.clone(), Some(bytes));
                }
                None => missing.push(key.clone()),
            }
        }

        if !missing.is_empty() {
            match bounded("MGET", self.timeout(), self.store.mget(&missing)).await {
                Ok(values) => {
                    for (key, value) in missing.into_iter().zip(values) {
                        found.insert(key, value.map(Arc::new));
                    }
                }
                Err(e) => {
                    warn!(keys = missing.len(), error = %e, "Shared store batch read failed");
                    for key in missing {
                        found.insert(key, None);
                    }
                }
            }
        }

        found
            .into_iter()
            .map(|(key, bytes)| {
                let value = bytes.and_then(|bytes| match serde_json::from_slice(&bytes) {
                    Ok(value) => Some(value),
                    Err(e) => {
                        warn!(key = %key, error = %e, "Failed to decode cached value");
                        None
                    }
                });
                if value.is_some() {
                    self.stats.record_hit();
                } else {
                    self.stats.record_miss();
                }
                (key, value)
            })
            .collect()
    }

    /// Write many keys with the same options
    ///
    /// Every value is serialized before anything is written, so a value
    /// that cannot be encoded leaves the cache untouched.
    pub async fn mset<K, T, I>(&self, entries: I, options: CacheOptions) -> Result<()>
    where
        I: IntoIterator<Item = (K, T)>,
        K: Into<String>,
        T: Serialize,
    {
        let encoded = entries
            .into_iter()
            .map(|(key, value)| Ok((key.into(), serde_json::to_vec(&value)?)))
            .collect::<Result<Vec<(String, Vec<u8>)>>>()?;

        let ttl = options.resolve_ttl(&self.config);
        let tags = &options.tags;
        join_all(
            encoded
                .into_iter()
                .map(|(key, bytes)| async move { self.write(&key, bytes, ttl, tags).await }),
        )
        .await;
        Ok(())
    }

    // =========================================================================
    // Invalidation
    // =========================================================================

    /// Remove one key from both tiers and tell peers to drop it
    ///
    /// L1 is purged again once the store DEL returns, which discards any
    /// value a concurrent read fetched while the delete was in flight.
    pub async fn delete(&self, key: &str) {
        self.local.remove(key);

        match bounded("DEL", self.timeout(), self.store.delete(&[key.to_string()])).await {
            Ok(removed) => self.stats.record_deletes(removed),
            Err(e) => warn!(key = %key, error = %e, "Shared store delete failed"),
        }
        self.local.remove(key);

        self.announce(InvalidationScope::Key { key: key.to_string() }).await;
    }

    /// Remove every key matching a glob pattern from both tiers
    ///
    /// Returns how many shared-store keys were removed, 0 on failure.
    pub async fn delete_by_pattern(&self, pattern: &str) -> u64 {
        let mut purged = self.local.purge_matching(pattern);

        let removed = match self.delete_matching(pattern).await {
            Ok(removed) => removed,
            Err(e) => {
                warn!(pattern = %pattern, error = %e, "Pattern delete failed");
                0
            }
        };
        purged += self.local.purge_matching(pattern);
        self.stats.record_deletes(removed);

        self.announce(InvalidationScope::Pattern {
            pattern: pattern.to_string(),
        })
        .await;

        debug!(pattern = %pattern, removed = removed, local_purged = purged, "Deleted by pattern");
        removed
    }

    async fn delete_matching(&self, pattern: &str) -> Result<u64> {
        let keys = bounded("SCAN", self.timeout(), self.store.keys(pattern)).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        bounded("DEL", self.timeout(), self.store.delete(&keys)).await
    }

    /// Remove every key written under `tag`, returning how many there were
    pub async fn invalidate_by_tag(&self, tag: &str) -> u64 {
        let keys = match self.tags.invalidate(tag).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(tag = %tag, error = %e, "Tag invalidation failed");
                return 0;
            }
        };
        if keys.is_empty() {
            return 0;
        }

        self.local.purge_keys(&keys);
        let count = keys.len() as u64;
        self.stats.record_deletes(count);

        self.announce(InvalidationScope::Tag {
            tag: tag.to_string(),
            keys,
        })
        .await;
        count
    }

    /// Invalidate several tags in turn, returning the total
    ///
    /// A failing tag is logged and skipped; the others still run.
    pub async fn invalidate_by_tags<S: AsRef<str>>(&self, tags: &[S]) -> u64 {
        let mut total = 0;
        for tag in tags {
            total += self.invalidate_by_tag(tag.as_ref()).await;
        }
        total
    }

    async fn announce(&self, scope: InvalidationScope) {
        if let Err(e) = self.bus.publish(scope).await {
            warn!(error = %e, "Failed to publish invalidation; peers keep stale L1 until the ceiling");
        }
    }

    // =========================================================================
    // Freshness
    // =========================================================================

    /// Classify a key written by `get_stale_while_revalidate`
    pub async fn freshness(&self, key: &str, stale_after: Duration) -> Freshness {
        match self.fetch(key).await {
            Some(bytes) => match serde_json::from_slice::<FreshnessMeta>(&bytes) {
                Ok(meta) => meta.freshness(stale_after),
                Err(_) => Freshness::Absent,
            },
            None => Freshness::Absent,
        }
    }

    // =========================================================================
    // Coordination
    // =========================================================================

    /// Count a request against `max` per `window` for `key`
    pub async fn check_rate_limit(&self, key: &str, max: u64, window: Duration) -> RateLimitDecision {
        self.limiter.check(key, max, window).await
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Try once to take the named lock
    pub async fn acquire_lock(&self, name: &str, ttl: Duration) -> Option<LockToken> {
        self.locks.acquire(name, ttl).await
    }

    /// Release the named lock if still held under `token`
    pub async fn release_lock(&self, name: &str, token: &LockToken) -> bool {
        self.locks.release(name, token).await
    }

    /// Try once to take the named lock as a scoped guard
    pub async fn lock(&self, name: &str, ttl: Duration) -> Option<LockGuard> {
        self.locks.lock(name, ttl).await
    }

    /// Run `f` under the named lock; `None` if it could not be taken
    pub async fn with_lock<F, Fut, T>(&self, name: &str, f: F, options: LockOptions) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.locks.with_lock(name, f, options).await
    }

    // =========================================================================
    // Operations
    // =========================================================================

    pub fn get_stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn reset_stats(&self) {
        self.stats.reset();
    }

    /// Whether the shared store answers within the store timeout
    pub async fn health_check(&self) -> bool {
        match bounded("PING", self.timeout(), self.store.ping()).await {
            Ok(()) => true,
            Err(e) => {
                warn!(backend = self.store.backend(), error = %e, "Cache health check failed");
                false
            }
        }
    }

    /// Start the L1 sweeper and the invalidation listener
    pub async fn start_background(&self) -> BackgroundTasks {
        let cancel = CancellationToken::new();
        let sweeper = self
            .local
            .spawn_sweeper(self.config.cleanup_interval(), cancel.clone());
        let listener = self.bus.listen(self.local.clone(), cancel.clone()).await;

        info!(
            instance = %self.instance_id(),
            channel = %self.bus.channel(),
            "Cache background tasks started"
        );

        BackgroundTasks {
            cancel,
            handles: vec![sweeper, listener],
        }
    }
}

// =============================================================================
// Background Tasks
// =============================================================================

/// Handles to the service's background tasks
///
/// Dropping this stops the tasks; [`BackgroundTasks::shutdown`] also waits
/// for them to finish.
pub struct BackgroundTasks {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop every task and wait for it to exit
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        for handle in std::mem::take(&mut self.handles) {
            if let Err(e) = handle.await {
                warn!(error = %e, "Cache background task ended abnormally");
            }
        }
        info!("Cache background tasks stopped");
    }
}

impl Drop for BackgroundTasks {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::entry::StoredValue;
    use crate::cache::storage::SharedStore;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use futures::stream::BoxStream;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Widget {
        id: u32,
        title: String,
    }

    fn widget(id: u32) -> Widget {
        Widget {
            id,
            title: format!("widget {}", id),
        }
    }

    fn service(store: &Arc<MemoryStore>) -> CacheService {
        CacheService::new(store.clone(), CacheConfig::default())
    }

    /// Shared store whose GET replies late and whose DEL starts late
    struct LaggingStore {
        inner: Arc<MemoryStore>,
        get_delay: Duration,
        delete_delay: Duration,
    }

    impl LaggingStore {
        fn service(
            inner: &Arc<MemoryStore>,
            get_delay: Duration,
            delete_delay: Duration,
        ) -> CacheService {
            let store = LaggingStore {
                inner: inner.clone(),
                get_delay,
                delete_delay,
            };
            CacheService::new(Arc::new(store), CacheConfig::default())
        }
    }

    #[async_trait]
    impl SharedStore for LaggingStore {
        fn backend(&self) -> &'static str {
            "lagging"
        }

        async fn get(&self, key: &str) -> Result<Option<StoredValue>> {
            let value = self.inner.get(key).await;
            tokio::time::sleep(self.get_delay).await;
            value
        }

        async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
            self.inner.mget(keys).await
        }

        async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
            self.inner.set(key, value, ttl).await
        }

        async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
            self.inner.set_nx(key, value, ttl).await
        }

        async fn delete(&self, keys: &[String]) -> Result<u64> {
            tokio::time::sleep(self.delete_delay).await;
            self.inner.delete(keys).await
        }

        async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
            self.inner.keys(pattern).await
        }

        async fn sadd(&self, set: &str, member: &str) -> Result<()> {
            self.inner.sadd(set, member).await
        }

        async fn smembers(&self, set: &str) -> Result<Vec<String>> {
            self.inner.smembers(set).await
        }

        async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
            self.inner.expire(key, ttl).await
        }

        async fn incr(&self, key: &str) -> Result<i64> {
            self.inner.incr(key).await
        }

        async fn publish(&self, channel: &str, message: &str) -> Result<()> {
            self.inner.publish(channel, message).await
        }

        async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, Result<String>>> {
            self.inner.subscribe(channel).await
        }

        async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<bool> {
            self.inner.compare_and_delete(key, expected).await
        }

        async fn ping(&self) -> Result<()> {
            self.inner.ping().await
        }
    }

    fn unencodable() -> HashMap<(u32, u32), u32> {
        HashMap::from([((1, 2), 3)])
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let store = Arc::new(MemoryStore::new());
        let cache = service(&store);

        cache.set("widget:1", &widget(1), CacheOptions::new()).await.unwrap();
        assert_eq!(cache.get::<Widget>("widget:1").await, Some(widget(1)));
        assert_eq!(cache.get::<Widget>("widget:2").await, None);

        let stats = cache.get_stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.hit_rate, 0.5);
    }

    #[tokio::test]
    async fn test_get_populates_l1_from_shared() {
        let store = Arc::new(MemoryStore::new());
        let writer = service(&store);
        let reader = service(&store);

        writer.set("widget:1", &widget(1), CacheOptions::new()).await.unwrap();
        assert_eq!(reader.local_len(), 0);

        assert_eq!(reader.get::<Widget>("widget:1").await, Some(widget(1)));
        assert_eq!(reader.local_len(), 1);

        // Served from L1 while the store is down
        store.set_available(false);
        assert_eq!(reader.get::<Widget>("widget:1").await, Some(widget(1)));
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let store = Arc::new(MemoryStore::new());
        let cache = service(&store);

        cache
            .set("k", &1, CacheOptions::new().with_ttl(Duration::from_millis(30)))
            .await
            .unwrap();
        assert_eq!(cache.get::<i32>("k").await, Some(1));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(cache.get::<i32>("k").await, None);
    }

    #[tokio::test]
    async fn test_no_expiry_persists() {
        let store = Arc::new(MemoryStore::new());
        let cache = service(&store);

        cache.set("k", &"v", CacheOptions::new().no_expiry()).await.unwrap();
        let stored = store.get("k").await.unwrap().unwrap();
        assert_eq!(stored.ttl, None);
    }

    #[tokio::test]
    async fn test_store_outage_degrades_to_miss() {
        let store = Arc::new(MemoryStore::new());
        let cache = service(&store);
        store.set_available(false);

        assert_eq!(cache.get::<Widget>("missing").await, None);
        assert_eq!(cache.delete_by_pattern("widget:*").await, 0);
        assert_eq!(cache.invalidate_by_tag("T").await, 0);
        assert!(!cache.health_check().await);

        // Writes still land in L1
        cache.set("widget:1", &widget(1), CacheOptions::new()).await.unwrap();
        assert_eq!(cache.get::<Widget>("widget:1").await, Some(widget(1)));
    }

    #[tokio::test]
    async fn test_slow_store_times_out_to_miss() {
        let store = Arc::new(MemoryStore::new());
        let mut config = CacheConfig::default();
        config.store_timeout_ms = 20;
        let cache = CacheService::new(store.clone(), config);

        store.set("k", b"1", None).await.unwrap();
        store.set_latency(Duration::from_millis(200));
        assert_eq!(cache.get::<i32>("k").await, None);
    }

    #[tokio::test]
    async fn test_decode_failure_is_miss() {
        let store = Arc::new(MemoryStore::new());
        let cache = service(&store);

        cache.set("k", &"text", CacheOptions::new()).await.unwrap();
        assert_eq!(cache.get::<Widget>("k").await, None);
        assert_eq!(cache.get_stats().misses, 1);
    }

    #[tokio::test]
    async fn test_get_or_set_runs_factory_once() {
        let store = Arc::new(MemoryStore::new());
        let cache = service(&store);
        let calls = AtomicUsize::new(0);
        let counter = &calls;

        for _ in 0..3 {
            let value = cache
                .get_or_set(
                    "widget:1",
                    move || async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(widget(1))
                    },
                    CacheOptions::new(),
                )
                .await
                .unwrap();
            assert_eq!(value, widget(1));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_get_or_set_surfaces_factory_error() {
        let store = Arc::new(MemoryStore::new());
        let cache = service(&store);

        let result = cache
            .get_or_set::<Widget, _, _>(
                "widget:1",
                || async { Err(anyhow::anyhow!("database unavailable")) },
                CacheOptions::new(),
            )
            .await;
        assert_matches!(result, Err(Error::Factory(_)));
        assert!(store.get("widget:1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mget_mset() {
        let store = Arc::new(MemoryStore::new());
        let cache = service(&store);

        cache
            .mset(
                vec![("widget:1", widget(1)), ("widget:2", widget(2))],
                CacheOptions::new(),
            )
            .await
            .unwrap();

        let keys = vec!["widget:1".to_string(), "widget:2".to_string(), "widget:3".to_string()];
        let values = cache.mget::<Widget>(&keys).await;
        assert_eq!(values.len(), 3);
        assert_eq!(values["widget:1"], Some(widget(1)));
        assert_eq!(values["widget:2"], Some(widget(2)));
        assert_eq!(values["widget:3"], None);

        // Another instance reads through the shared store
        let peer = service(&store);
        let values = peer.mget::<Widget>(&keys).await;
        assert_eq!(values["widget:2"], Some(widget(2)));
        assert_eq!(peer.local_len(), 0);
    }

    #[tokio::test]
    async fn test_set_rejects_unserializable_value() {
        let store = Arc::new(MemoryStore::new());
        let cache = service(&store);

        let result = cache.set("grid:1", &unencodable(), CacheOptions::new()).await;
        assert_matches!(result, Err(Error::Serialization(_)));

        assert!(store.get("grid:1").await.unwrap().is_none());
        assert_eq!(cache.local_len(), 0);
        assert_eq!(cache.get_stats().writes, 0);
    }

    #[tokio::test]
    async fn test_mset_rejects_batch_with_unserializable_value() {
        let store = Arc::new(MemoryStore::new());
        let cache = service(&store);

        let batch = vec![("grid:ok", HashMap::new()), ("grid:bad", unencodable())];
        let result = cache.mset(batch, CacheOptions::new()).await;
        assert_matches!(result, Err(Error::Serialization(_)));

        // The valid entry was not written either
        assert!(store.get("grid:ok").await.unwrap().is_none());
        assert!(store.get("grid:bad").await.unwrap().is_none());
        assert_eq!(cache.local_len(), 0);
        assert_eq!(cache.get_stats().writes, 0);
    }

    #[tokio::test]
    async fn test_delete() {
        let store = Arc::new(MemoryStore::new());
        let cache = service(&store);

        cache.set("widget:1", &widget(1), CacheOptions::new()).await.unwrap();
        cache.delete("widget:1").await;

        assert_eq!(cache.get::<Widget>("widget:1").await, None);
        assert_eq!(cache.local_len(), 0);
        assert_eq!(cache.get_stats().deletes, 1);
    }

    #[tokio::test]
    async fn test_read_during_delete_does_not_resurrect_value() {
        let store = Arc::new(MemoryStore::new());
        let cache = LaggingStore::service(&store, Duration::ZERO, Duration::from_millis(50));
        cache.set("k", "old", CacheOptions::new()).await.unwrap();

        let deleting = tokio::spawn({
            let cache = cache.clone();
            async move { cache.delete("k").await }
        });

        // The store still holds the value, so this read may refill L1
        tokio::time::sleep(Duration::from_millis(10)).await;
        let during = cache.get::<String>("k").await;
        assert_eq!(during.as_deref(), Some("old"));

        deleting.await.unwrap();
        assert_eq!(cache.local_len(), 0);
        assert_eq!(cache.get::<String>("k").await, None);
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_during_pattern_delete_does_not_resurrect_value() {
        let store = Arc::new(MemoryStore::new());
        let cache = LaggingStore::service(&store, Duration::ZERO, Duration::from_millis(50));
        cache.set("report:1", "old", CacheOptions::new()).await.unwrap();

        let deleting = tokio::spawn({
            let cache = cache.clone();
            async move { cache.delete_by_pattern("report:*").await }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(cache.get::<String>("report:1").await.as_deref(), Some("old"));

        assert_eq!(deleting.await.unwrap(), 1);
        assert_eq!(cache.local_len(), 0);
        assert_eq!(cache.get::<String>("report:1").await, None);
    }

    #[tokio::test]
    async fn test_slow_read_does_not_overwrite_newer_write() {
        let store = Arc::new(MemoryStore::new());
        store.set("k", b"\"old\"", None).await.unwrap();
        let cache = LaggingStore::service(&store, Duration::from_millis(50), Duration::ZERO);

        // This read fetches "old" and is still in flight when "new" lands
        let reading = tokio::spawn({
            let cache = cache.clone();
            async move { cache.get::<String>("k").await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        cache.set("k", "new", CacheOptions::new()).await.unwrap();

        assert_eq!(reading.await.unwrap().as_deref(), Some("old"));
        assert_eq!(cache.get::<String>("k").await.as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn test_delete_by_pattern_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let cache = service(&store);

        for id in 1..=3 {
            cache
                .set(&format!("widget:{}", id), &widget(id), CacheOptions::new())
                .await
                .unwrap();
        }
        cache.set("user:1", &1, CacheOptions::new()).await.unwrap();

        assert_eq!(cache.delete_by_pattern("widget:*").await, 3);
        assert_eq!(cache.delete_by_pattern("widget:*").await, 0);
        assert_eq!(cache.get::<Widget>("widget:2").await, None);
        assert_eq!(cache.get::<i32>("user:1").await, Some(1));
    }

    #[tokio::test]
    async fn test_invalidate_by_tag() {
        let store = Arc::new(MemoryStore::new());
        let cache = service(&store);

        let tagged = CacheOptions::new().with_tag("workspace:7");
        cache.set("widget:1", &widget(1), tagged.clone()).await.unwrap();
        cache
            .set("widget:2", &widget(2), tagged.clone().with_tag("portal:1"))
            .await
            .unwrap();
        cache.set("widget:3", &widget(3), CacheOptions::new()).await.unwrap();

        assert_eq!(cache.invalidate_by_tag("workspace:7").await, 2);
        assert_eq!(cache.get::<Widget>("widget:1").await, None);
        assert_eq!(cache.get::<Widget>("widget:2").await, None);
        assert_eq!(cache.get::<Widget>("widget:3").await, Some(widget(3)));

        assert_eq!(cache.invalidate_by_tag("workspace:7").await, 0);
    }

    #[tokio::test]
    async fn test_invalidate_by_tags_sums() {
        let store = Arc::new(MemoryStore::new());
        let cache = service(&store);

        cache.set("a", &1, CacheOptions::new().with_tag("x")).await.unwrap();
        cache.set("b", &2, CacheOptions::new().with_tag("y")).await.unwrap();
        cache.set("c", &3, CacheOptions::new().with_tag("y")).await.unwrap();

        assert_eq!(cache.invalidate_by_tags(&["x", "y", "z"]).await, 3);
    }

    #[tokio::test]
    async fn test_peer_l1_invalidated() {
        let store = Arc::new(MemoryStore::new());
        let a = service(&store);
        let b = service(&store);
        let tasks = b.start_background().await;

        a.set("widget:1", &widget(1), CacheOptions::new()).await.unwrap();
        assert_eq!(b.get::<Widget>("widget:1").await, Some(widget(1)));
        assert_eq!(b.local_len(), 1);

        a.delete("widget:1").await;
        for _ in 0..50 {
            if b.local_len() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(b.local_len(), 0);
        assert_eq!(b.get::<Widget>("widget:1").await, None);

        tasks.shutdown().await;
    }

    #[tokio::test]
    async fn test_freshness() {
        let store = Arc::new(MemoryStore::new());
        let cache = service(&store);

        assert_eq!(cache.freshness("k", Duration::from_secs(60)).await, Freshness::Absent);

        cache
            .set("k", &crate::cache::entry::SwrEnvelope::fresh(5), CacheOptions::new())
            .await
            .unwrap();
        assert_eq!(cache.freshness("k", Duration::from_secs(60)).await, Freshness::Fresh);
        assert_eq!(cache.freshness("k", Duration::ZERO).await, Freshness::Stale);
    }

    #[tokio::test]
    async fn test_reset_stats() {
        let store = Arc::new(MemoryStore::new());
        let cache = service(&store);

        cache.get::<i32>("k").await;
        cache.reset_stats();
        assert_eq!(cache.get_stats(), StatsSnapshot::default());
    }

    #[tokio::test]
    async fn test_health_check() {
        let store = Arc::new(MemoryStore::new());
        let cache = service(&store);
        assert!(cache.health_check().await);
    }
}
