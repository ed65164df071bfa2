//! Cache Entry Types
//!
//! Defines L1 entries, values read back from the shared store, write
//! options and the freshness envelope used by stale-while-revalidate.

use crate::cache::config::{CacheConfig, TtlCategory};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// TTL value meaning "never expires"
///
/// Used sparingly: unbounded entries live in L1 only up to the local ceiling
/// and do not extend their tag sets' lifetime.
pub const NO_EXPIRY: Duration = Duration::ZERO;

// =============================================================================
// Local (L1) Entry
// =============================================================================

/// A value held in the in-process cache
///
/// The payload stays serialized so that one map can hold values of every type
/// and a hit costs only an `Arc` clone plus deserialization.
#[derive(Clone, Debug)]
pub struct LocalEntry {
    /// Serialized payload
    pub data: Arc<Vec<u8>>,
    /// Absolute expiry in the shared store, if bounded
    pub expires_at: Option<Instant>,
    /// Absolute L1 expiry, never later than `expires_at`
    pub local_expires_at: Instant,
}

impl LocalEntry {
    /// Create an entry capped to `min(ceiling, shared_ttl)`
    ///
    /// `shared_ttl` of `None` means the shared copy has no expiry.
    pub fn new(data: Arc<Vec<u8>>, shared_ttl: Option<Duration>, ceiling: Duration) -> Self {
        let now = Instant::now();
        let expires_at = shared_ttl.map(|ttl| now + ttl);
        let local_ttl = match shared_ttl {
            Some(ttl) => ttl.min(ceiling),
            None => ceiling,
        };
        Self {
            data,
            expires_at,
            local_expires_at: now + local_ttl,
        }
    }

    /// Check if this entry can no longer be served from L1
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.local_expires_at
    }

    /// Time left before L1 stops trusting this entry
    pub fn remaining(&self) -> Duration {
        self.local_expires_at.saturating_duration_since(Instant::now())
    }

    /// Payload size in bytes
    pub fn size_bytes(&self) -> usize {
        self.data.len()
    }
}

// =============================================================================
// Shared Store Value
// =============================================================================

/// A value read from the shared store together with its remaining lifetime
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredValue {
    pub bytes: Vec<u8>,
    /// Remaining TTL (`None` = no expiry)
    pub ttl: Option<Duration>,
}

impl StoredValue {
    pub fn new(bytes: Vec<u8>, ttl: Option<Duration>) -> Self {
        Self { bytes, ttl }
    }
}

/// Convert a write TTL into the store's representation (`None` = no expiry)
pub(crate) fn expiry(ttl: Duration) -> Option<Duration> {
    if ttl.is_zero() {
        None
    } else {
        Some(ttl)
    }
}

// =============================================================================
// Write Options
// =============================================================================

/// Options for `set` and `get_or_set`
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheOptions {
    /// Lifetime in the shared store; `None` uses the configured default,
    /// [`NO_EXPIRY`] disables expiry
    pub ttl: Option<Duration>,
    /// Tags to index the key under
    pub tags: Vec<String>,
}

impl CacheOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Options using the TTL configured for a data category
    pub fn for_category(config: &CacheConfig, category: TtlCategory) -> Self {
        Self {
            ttl: Some(config.ttl_for(category)),
            tags: Vec::new(),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Never expire in the shared store
    pub fn no_expiry(mut self) -> Self {
        self.ttl = Some(NO_EXPIRY);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Effective TTL after applying the configured default
    pub fn resolve_ttl(&self, config: &CacheConfig) -> Duration {
        self.ttl.unwrap_or_else(|| config.default_ttl())
    }
}

/// Options for `get_stale_while_revalidate`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SwrOptions {
    /// Lifetime in the shared store; `None` uses the configured default
    pub ttl: Option<Duration>,
    /// Age after which a cached value is served stale and refreshed
    pub stale_after: Duration,
}

impl SwrOptions {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            ttl: None,
            stale_after,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

// =============================================================================
// Freshness
// =============================================================================

/// Freshness state of a key under stale-while-revalidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Cached and younger than the staleness threshold
    Fresh,
    /// Cached but older than the threshold: serve and refresh
    Stale,
    /// Nothing cached
    Absent,
}

/// Freshness metadata stored alongside a value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreshnessMeta {
    pub fetched_at: DateTime<Utc>,
}

impl FreshnessMeta {
    pub fn now() -> Self {
        Self {
            fetched_at: Utc::now(),
        }
    }

    /// Age of the value; clock skew between instances clamps to zero
    pub fn age(&self) -> Duration {
        Utc::now()
            .signed_duration_since(self.fetched_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    pub fn freshness(&self, stale_after: Duration) -> Freshness {
        if self.age() < stale_after {
            Freshness::Fresh
        } else {
            Freshness::Stale
        }
    }
}

/// A value stored together with when it was fetched
///
/// Kept under the key itself so that every instance sees the same metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwrEnvelope<T> {
    pub value: T,
    #[serde(flatten)]
    pub meta: FreshnessMeta,
}

impl<T> SwrEnvelope<T> {
    pub fn fresh(value: T) -> Self {
        Self {
            value,
            meta: FreshnessMeta::now(),
        }
    }
}
