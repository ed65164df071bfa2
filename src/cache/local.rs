//! L1 Local Cache
//!
//! In-process cache using DashMap for concurrent access. Entries are bounded
//! by a short ceiling so a lost invalidation notice can only cause staleness
//! up to that ceiling.

use crate::cache::entry::LocalEntry;
use crate::cache::storage::match_to_glob;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

// =============================================================================
// Key Patterns
// =============================================================================

/// Matches cache keys against an invalidation pattern
///
/// Patterns use the store's `MATCH` syntax (`*`, `?`, `[...]`, `[^...]`,
/// backslash escapes). A pattern without metacharacters is a literal key. A
/// pattern that is not valid glob syntax falls back to substring matching.
#[derive(Debug)]
pub enum KeyMatcher {
    Exact(String),
    Glob(glob::Pattern),
    Substring(String),
}

impl KeyMatcher {
    pub fn new(pattern: &str) -> Self {
        if !pattern.contains(['*', '?', '[', '\\']) {
            return KeyMatcher::Exact(pattern.to_string());
        }
        match glob::Pattern::new(&match_to_glob(pattern)) {
            Ok(glob) => KeyMatcher::Glob(glob),
            Err(e) => {
                warn!(pattern = %pattern, error = %e, "Invalid glob pattern, matching by substring");
                KeyMatcher::Substring(pattern.replace(['*', '?'], ""))
            }
        }
    }

    pub fn matches(&self, key: &str) -> bool {
        match self {
            KeyMatcher::Exact(literal) => key == literal,
            KeyMatcher::Glob(glob) => glob.matches(key),
            KeyMatcher::Substring(part) => key.contains(part.as_str()),
        }
    }
}

// =============================================================================
// Local Cache
// =============================================================================

/// L1 in-process cache backed by DashMap
///
/// Every authoritative write and every removal bumps a generation counter.
/// Read-through fills go through [`LocalCache::fill`], which backs out when
/// the generation moved while the shared store was being read, so a value
/// fetched before a delete or overwrite cannot outlive it in L1.
#[derive(Debug)]
pub struct LocalCache {
    entries: DashMap<String, LocalEntry>,
    ceiling: Duration,
    generation: AtomicU64,
}

impl LocalCache {
    /// Create a local cache whose entries live at most `ceiling`
    pub fn new(ceiling: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ceiling,
            generation: AtomicU64::new(0),
        }
    }

    /// Get the L1 ceiling
    pub fn ceiling(&self) -> Duration {
        self.ceiling
    }

    /// Get a live entry's payload
    ///
    /// Expired entries are removed on the way out.
    pub fn get(&self, key: &str) -> Option<Arc<Vec<u8>>> {
        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired() {
                return Some(Arc::clone(&entry.data));
            }
        } else {
            return None;
        }
        self.entries.remove_if(key, |_, entry| entry.is_expired());
        None
    }

    /// Current write generation, taken before a read-through
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn bump(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Store a payload, capped to `min(ceiling, shared_ttl)`
    pub fn insert(&self, key: &str, data: Arc<Vec<u8>>, shared_ttl: Option<Duration>) {
        self.bump();
        let entry = LocalEntry::new(data, shared_ttl, self.ceiling);
        if entry.is_expired() {
            self.entries.remove(key);
            return;
        }
        self.entries.insert(key.to_string(), entry);
    }

    /// Fill L1 with a value read from the shared store
    ///
    /// `seen` is the generation observed before the read. If any write or
    /// removal happened since, the fill is withdrawn and false is returned.
    pub fn fill(
        &self,
        key: &str,
        data: Arc<Vec<u8>>,
        shared_ttl: Option<Duration>,
        seen: u64,
    ) -> bool {
        if self.generation() != seen {
            return false;
        }
        let entry = LocalEntry::new(Arc::clone(&data), shared_ttl, self.ceiling);
        if entry.is_expired() {
            return false;
        }
        self.entries.insert(key.to_string(), entry);

        // A removal that ran between the check and the insert bumped first
        if self.generation() != seen {
            self.entries
                .remove_if(key, |_, entry| Arc::ptr_eq(&entry.data, &data));
            return false;
        }
        true
    }

    /// Remove a single key
    pub fn remove(&self, key: &str) -> bool {
        self.bump();
        self.entries.remove(key).is_some()
    }

    /// Remove every key matching an invalidation pattern
    ///
    /// Returns the number of entries removed.
    pub fn purge_matching(&self, pattern: &str) -> usize {
        let matcher = KeyMatcher::new(pattern);
        if let KeyMatcher::Exact(key) = &matcher {
            return usize::from(self.remove(key));
        }
        self.bump();

        let keys: Vec<String> = self
            .entries
            .iter()
            .filter(|r| matcher.matches(r.key()))
            .map(|r| r.key().clone())
            .collect();

        keys.iter().filter(|key| self.entries.remove(*key).is_some()).count()
    }

    /// Remove a known set of keys
    pub fn purge_keys<S: AsRef<str>>(&self, keys: &[S]) -> usize {
        self.bump();
        keys.iter().filter(|key| self.remove(key.as_ref())).count()
    }

    /// Evict expired entries
    ///
    /// Collects a snapshot of expired keys first, then removes them one at a
    /// time, so no shard lock is held for the whole sweep. An entry refreshed
    /// between the two steps survives.
    pub fn sweep_expired(&self) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|r| r.value().is_expired())
            .map(|r| r.key().clone())
            .collect();

        expired
            .iter()
            .filter(|key| {
                self.entries
                    .remove_if(key.as_str(), |_, entry| entry.is_expired())
                    .is_some()
            })
            .count()
    }

    /// Current entry count (including not-yet-swept expired entries)
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.bump();
        self.entries.clear();
    }

    /// Total payload bytes held, including not-yet-swept expired entries
    pub fn size_bytes(&self) -> usize {
        self.entries.iter().map(|r| r.value().size_bytes()).sum()
    }

    /// Spawn the periodic expiry sweep
    ///
    /// Runs until `cancel` fires, independent of request handling.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = cache.sweep_expired();
                        if removed > 0 {
                            debug!(removed = removed, remaining = cache.len(), "Swept expired L1 entries");
                        }
                    }
                }
            }
            debug!("L1 sweeper stopped");
        })
    }
}
