//! Shared Store Adapters
//!
//! The networked key-value service every instance shares. It is the only
//! point of cross-process coordination: cached values, tag sets, lock
//! tokens, rate counters and the invalidation channel all live here.

mod memory;
mod remote;

pub(crate) use memory::match_to_glob;
pub use memory::MemoryStore;
pub use remote::RedisStore;

use crate::cache::entry::StoredValue;
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// SharedStore Trait
// =============================================================================

/// Port for the shared key-value store
///
/// Implementations must make `set_nx`, `incr` and `compare_and_delete`
/// atomic with respect to every other client of the same store.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Short backend name for logs and health output
    fn backend(&self) -> &'static str;

    /// Get a value and its remaining TTL
    async fn get(&self, key: &str) -> Result<Option<StoredValue>>;

    /// Get several values in one round trip, in key order
    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>>;

    /// Store a value; `ttl` of `None` means no expiry
    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()>;

    /// Store a value only if the key does not exist
    ///
    /// Returns whether the value was written.
    async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool>;

    /// Delete keys, returning how many existed
    async fn delete(&self, keys: &[String]) -> Result<u64>;

    /// Enumerate keys matching a glob pattern
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;

    /// Add a member to a set
    async fn sadd(&self, set: &str, member: &str) -> Result<()>;

    /// Get every member of a set
    async fn smembers(&self, set: &str) -> Result<Vec<String>>;

    /// Set a key's TTL, returning whether the key exists
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Atomically increment a counter, returning the new value
    async fn incr(&self, key: &str) -> Result<i64>;

    /// Publish a message on a channel
    async fn publish(&self, channel: &str, message: &str) -> Result<()>;

    /// Subscribe to a channel
    ///
    /// The stream ends when the subscription is lost; callers resubscribe.
    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, Result<String>>>;

    /// Delete a key only if its current value equals `expected`
    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<bool>;

    /// Check the store is reachable
    async fn ping(&self) -> Result<()>;
}

/// Type alias for Arc'd SharedStore
pub type SharedStoreRef = Arc<dyn SharedStore>;

// =============================================================================
// Deadlines
// =============================================================================

/// Run a shared-store call under a deadline
///
/// A slow store must never stall the calling request; an elapsed deadline
/// becomes a transient [`Error::StoreTimeout`].
pub async fn bounded<T, F>(operation: &'static str, timeout: Duration, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(Error::StoreTimeout { operation, timeout }),
    }
}
