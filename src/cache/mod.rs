//! Two-Tier Application Cache
//!
//! A cache for a multi-tenant portal backend running as several processes:
//! - **L1 Local**: per-process map with a short ceiling lifetime
//! - **L2 Shared**: a networked key-value store (Redis) shared by every process
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                            CacheService                                  │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐        ┌──────────────────────────────────────────┐   │
//! │  │  L1 Local    │ miss → │            L2 Shared Store               │   │
//! │  │  (DashMap)   │        │   (RedisStore / MemoryStore)             │   │
//! │  │  ≤ ceiling   │ ← fill │   values · tag sets · locks · counters   │   │
//! │  └──────┬───────┘        └───────────────────┬──────────────────────┘   │
//! │         │                                    │                           │
//! │         │ purge          ┌───────────────────┴──────────┐                │
//! │         └────────────────┤  Invalidation Bus (pub/sub)  │                │
//! │                          └──────────────────────────────┘                │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │  Tag Index · Stale-While-Revalidate · Distributed Locks · Rate Limiter  │
//! │  Cache-line aligned statistics                                          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use portal_cache::cache::{CacheConfig, CacheOptions, CacheService, RedisStore};
//! use std::sync::Arc;
//!
//! let store = Arc::new(RedisStore::connect("redis://127.0.0.1:6379")?);
//! let cache = CacheService::new(store, CacheConfig::default());
//! let background = cache.start_background().await;
//!
//! cache
//!     .set("widget:42", &widget, CacheOptions::new().with_tag("workspace:7"))
//!     .await?;
//! let cached: Option<Widget> = cache.get("widget:42").await;
//!
//! // Drops every key written under the tag, on every instance
//! cache.invalidate_by_tag("workspace:7").await;
//!
//! background.shutdown().await;
//! ```

pub mod config;
pub mod entry;
pub mod events;
pub mod local;
pub mod lock;
pub mod metrics;
pub mod rate_limit;
pub mod service;
pub mod storage;
pub mod swr;
pub mod tags;

// Re-export main types
pub use config::{CacheConfig, LockConfig, TtlCategory, TtlTable};
pub use entry::{CacheOptions, Freshness, FreshnessMeta, SwrEnvelope, SwrOptions, NO_EXPIRY};
pub use events::{InvalidationBus, InvalidationNotice, InvalidationScope};
pub use local::LocalCache;
pub use lock::{LockGuard, LockManager, LockOptions, LockToken};
pub use metrics::{CacheStats, StatsSnapshot};
pub use rate_limit::{RateLimitDecision, RateLimiter};
pub use service::{BackgroundTasks, CacheService};
pub use storage::{MemoryStore, RedisStore, SharedStore, SharedStoreRef};
pub use tags::TagIndex;
