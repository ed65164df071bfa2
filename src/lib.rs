//! Portal Cache - Two-Tier Application Cache
//!
//! Caching for a multi-tenant portal backend: a per-process L1 in front of a
//! shared Redis L2, with cross-instance invalidation, tag-based group
//! invalidation, stale-while-revalidate reads, distributed locks and
//! fixed-window rate limiting.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────┐   ┌───────────────────────┐
//! │   portal instance A   │   │   portal instance B   │
//! │  ┌─────────────────┐  │   │  ┌─────────────────┐  │
//! │  │  CacheService   │  │   │  │  CacheService   │  │
//! │  │  L1 (≤ 30s)     │  │   │  │  L1 (≤ 30s)     │  │
//! │  └────────┬────────┘  │   │  └────────┬────────┘  │
//! └───────────┼───────────┘   └───────────┼───────────┘
//!             │      values · tags · locks │
//!             └────────────┬───────────────┘
//!                  ┌───────┴────────┐
//!                  │  Shared Store  │ ── cache:invalidate (pub/sub)
//!                  │    (Redis)     │
//!                  └────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`cache`]: Cache service, tiers, invalidation and coordination primitives
//! - [`error`]: Error types and handling

pub mod cache;
pub mod error;

// Re-export commonly used types
pub use cache::{
    BackgroundTasks, CacheConfig, CacheOptions, CacheService, Freshness, LockGuard, LockOptions,
    LockToken, MemoryStore, RateLimitDecision, RedisStore, SharedStore, SharedStoreRef,
    StatsSnapshot, SwrOptions, TtlCategory, NO_EXPIRY,
};

pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
