//! Distributed Lock Manager
//!
//! Token-based mutual exclusion over the shared store.
//!
//! - Acquire is an atomic set-if-absent with expiry under a fresh token.
//! - Release is an atomic compare-and-delete: a holder whose lock expired and
//!   was taken by someone else can never delete the new holder's token.
//! - Locks are not renewed. A critical section that outlives its TTL loses
//!   mutual exclusion, so callers size the TTL for the slowest expected run.
//!
//! Contention is not an error: acquisition returns `None` and callers decide.

use crate::cache::config::LockConfig;
use crate::cache::storage::{bounded, SharedStoreRef};
use chrono::Utc;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Prefix for lock keys in the shared store
pub const LOCK_KEY_PREFIX: &str = "lock:";

/// Shared-store key for a named lock
pub fn lock_key(name: &str) -> String {
    format!("{}{}", LOCK_KEY_PREFIX, name)
}

// =============================================================================
// Lock Token
// =============================================================================

/// Proof of ownership for one acquisition
///
/// Unique per acquisition: acquisition time in millis plus a random suffix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken(String);

impl LockToken {
    /// Generate a fresh token
    pub fn generate() -> Self {
        Self(format!(
            "{}-{}",
            Utc::now().timestamp_millis(),
            Uuid::new_v4().simple()
        ))
    }

    /// Wrap a token received from elsewhere (e.g. another task)
    pub fn from_string(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Options
// =============================================================================

/// Overrides for `with_lock`; unset fields use [`LockConfig`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockOptions {
    pub ttl: Option<Duration>,
    pub retries: Option<u32>,
    pub retry_delay: Option<Duration>,
}

impl LockOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }
}

// =============================================================================
// Lock Manager
// =============================================================================

/// Acquires and releases named locks in the shared store
pub struct LockManager {
    store: SharedStoreRef,
    config: LockConfig,
    timeout: Duration,
}

impl LockManager {
    pub fn new(store: SharedStoreRef, config: LockConfig, timeout: Duration) -> Self {
        Self {
            store,
            config,
            timeout,
        }
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Try once to take `name` for `ttl`
    ///
    /// Returns the token on success and `None` if the lock is held or the
    /// store could not be reached.
    pub async fn acquire(&self, name: &str, ttl: Duration) -> Option<LockToken> {
        let token = LockToken::generate();
        let key = lock_key(name);
        match bounded(
            "SET NX",
            self.timeout,
            self.store.set_nx(&key, token.as_str().as_bytes(), ttl),
        )
        .await
        {
            Ok(true) => {
                debug!(lock = %name, ttl_ms = ttl.as_millis() as u64, "Lock acquired");
                Some(token)
            }
            Ok(false) => {
                debug!(lock = %name, "Lock held elsewhere");
                None
            }
            Err(e) => {
                warn!(lock = %name, error = %e, "Lock acquisition failed");
                None
            }
        }
    }

    /// Release `name` if it is still held under `token`
    ///
    /// Returns whether a token was actually removed.
    pub async fn release(&self, name: &str, token: &LockToken) -> bool {
        release_lock(&self.store, self.timeout, name, token).await
    }

    /// Try once to take `name`, returning a guard that releases on drop
    pub async fn lock(&self, name: &str, ttl: Duration) -> Option<LockGuard> {
        let token = self.acquire(name, ttl).await?;
        Some(LockGuard {
            store: self.store.clone(),
            name: name.to_string(),
            token,
            timeout: self.timeout,
            released: false,
        })
    }

    /// Run `f` while holding `name`
    ///
    /// Makes up to `retries` acquisition attempts, waiting `retry_delay *
    /// attempt` after each failed one. Returns `None` if the lock could not be
    /// taken. The lock is released on every exit path: normally after `f`
    /// completes, or by the guard's drop if `f` panics or the call is
    /// cancelled.
    pub async fn with_lock<F, Fut, T>(&self, name: &str, f: F, options: LockOptions) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let ttl = options.ttl.unwrap_or_else(|| self.config.ttl());
        let attempts = options.retries.unwrap_or(self.config.retries).max(1);
        let retry_delay = options
            .retry_delay
            .unwrap_or_else(|| self.config.retry_delay());

        let mut guard = None;
        for attempt in 1..=attempts {
            if let Some(acquired) = self.lock(name, ttl).await {
                guard = Some(acquired);
                break;
            }
            if attempt < attempts {
                tokio::time::sleep(retry_delay * attempt).await;
            }
        }

        let Some(guard) = guard else {
            debug!(lock = %name, attempts = attempts, "Gave up acquiring lock");
            return None;
        };

        let result = f().await;
        guard.release().await;
        Some(result)
    }
}

async fn release_lock(
    store: &SharedStoreRef,
    timeout: Duration,
    name: &str,
    token: &LockToken,
) -> bool {
    let key = lock_key(name);
    match bounded(
        "COMPARE AND DELETE",
        timeout,
        store.compare_and_delete(&key, token.as_str().as_bytes()),
    )
    .await
    {
        Ok(released) => {
            if released {
                debug!(lock = %name, "Lock released");
            } else {
                debug!(lock = %name, "Lock no longer held under this token");
            }
            released
        }
        Err(e) => {
            warn!(lock = %name, error = %e, "Lock release failed");
            false
        }
    }
}

// =============================================================================
// Lock Guard
// =============================================================================

/// Scoped ownership of a named lock
///
/// Call [`LockGuard::release`] on the normal path. Dropping an unreleased
/// guard spawns the release on the current runtime; if the lock cannot be
/// released it simply expires with its TTL.
pub struct LockGuard {
    store: SharedStoreRef,
    name: String,
    token: LockToken,
    timeout: Duration,
    released: bool,
}

impl LockGuard {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn token(&self) -> &LockToken {
        &self.token
    }

    /// Release the lock now, returning whether a token was removed
    pub async fn release(mut self) -> bool {
        self.released = true;
        release_lock(&self.store, self.timeout, &self.name, &self.token).await
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("name", &self.name)
            .field("token", &self.token)
            .field("released", &self.released)
            .finish()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let store = self.store.clone();
                let name = std::mem::take(&mut self.name);
                let token = self.token.clone();
                let timeout = self.timeout;
                handle.spawn(async move {
                    release_lock(&store, timeout, &name, &token).await;
                });
            }
            Err(_) => {
                warn!(lock = %self.name, "No runtime to release dropped lock; it will expire");
            }
        }
    }
}
