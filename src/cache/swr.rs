//! Stale-While-Revalidate
//!
//! Values are stored wrapped in an [`SwrEnvelope`] recording when they were
//! fetched. A read of a stale value returns it immediately and refreshes it
//! in a detached task, so callers never wait on the factory unless nothing
//! is cached at all.
//!
//! At most one refresh per key runs in this process at a time. Other
//! instances may refresh the same key concurrently; the last write wins.

use crate::cache::entry::{CacheOptions, Freshness, SwrEnvelope, SwrOptions};
use crate::cache::service::CacheService;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

// =============================================================================
// Refresh Tracker
// =============================================================================

/// Keys with a background refresh in flight
#[derive(Debug, Default)]
pub struct RefreshTracker {
    in_flight: DashMap<String, Instant>,
}

impl RefreshTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the refresh for `key`
    ///
    /// Returns `None` if a refresh is already running. The claim is held
    /// until the returned guard is dropped.
    pub fn try_begin(self: &Arc<Self>, key: &str) -> Option<RefreshGuard> {
        match self.in_flight.entry(key.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(Instant::now());
                Some(RefreshGuard {
                    tracker: Arc::clone(self),
                    key: key.to_string(),
                })
            }
        }
    }

    pub fn is_refreshing(&self, key: &str) -> bool {
        self.in_flight.contains_key(key)
    }

    /// Number of refreshes in flight
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

/// Claim on one key's refresh; released on drop
#[derive(Debug)]
pub struct RefreshGuard {
    tracker: Arc<RefreshTracker>,
    key: String,
}

impl Drop for RefreshGuard {
    fn drop(&mut self) {
        if let Some((_, started)) = self.tracker.in_flight.remove(&self.key) {
            debug!(
                key = %self.key,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Refresh finished"
            );
        }
    }
}

// =============================================================================
// Service Operation
// =============================================================================

impl CacheService {
    /// Read with stale-while-revalidate semantics
    ///
    /// - Fresh: returned as is.
    /// - Stale: returned immediately; `factory` runs in the background and
    ///   its result replaces the cached value.
    /// - Absent: `factory` runs inline and its result is cached.
    ///
    /// Returns `None` only when nothing is cached and the factory fails.
    /// Background refresh failures are logged and the stale value stays.
    pub async fn get_stale_while_revalidate<T, F, Fut>(
        &self,
        key: &str,
        factory: F,
        options: SwrOptions,
    ) -> Option<T>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let write_options = CacheOptions {
            ttl: options.ttl,
            tags: Vec::new(),
        };

        match self.get::<SwrEnvelope<T>>(key).await {
            Some(envelope) => {
                if envelope.meta.freshness(options.stale_after) == Freshness::Stale {
                    debug!(key = %key, age_ms = envelope.meta.age().as_millis() as u64, "Serving stale value");
                    self.spawn_refresh(key, factory, write_options);
                }
                Some(envelope.value)
            }
            None => match factory().await {
                Ok(value) => {
                    let envelope = SwrEnvelope::fresh(value);
                    if let Err(e) = self.set(key, &envelope, write_options).await {
                        warn!(key = %key, error = %e, "Failed to cache fetched value");
                    }
                    Some(envelope.value)
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Fetch failed with nothing cached");
                    None
                }
            },
        }
    }

    /// Refresh `key` in a detached task unless one is already running
    fn spawn_refresh<T, F, Fut>(&self, key: &str, factory: F, options: CacheOptions) -> bool
    where
        T: Serialize + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let Some(guard) = self.refreshes.try_begin(key) else {
            debug!(key = %key, "Refresh already in flight");
            return false;
        };

        let service = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            let _guard = guard;
            match factory().await {
                Ok(value) => {
                    if let Err(e) = service.set(&key, &SwrEnvelope::fresh(value), options).await {
                        warn!(key = %key, error = %e, "Failed to store refreshed value");
                    }
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Background refresh failed, keeping stale value");
                }
            }
        });
        true
    }

    /// Whether a background refresh for `key` is running in this process
    pub fn is_refreshing(&self, key: &str) -> bool {
        self.refreshes.is_refreshing(key)
    }
}
