//! Cache Configuration
//!
//! TTL categories, L1 bounds, lock defaults and shared-store deadlines.
//! Every field has a default so a partial YAML document is a valid config.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

// =============================================================================
// Defaults
// =============================================================================

/// Longest time an L1 entry is trusted, regardless of the shared TTL
pub const DEFAULT_LOCAL_CEILING_SECS: u64 = 30;

/// Interval between L1 expiry sweeps
pub const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 60;

/// Extra lifetime given to a tag set beyond its member's TTL
pub const DEFAULT_TAG_TTL_MARGIN_SECS: u64 = 60;

/// Deadline applied to every shared-store round trip
pub const DEFAULT_STORE_TIMEOUT_MS: u64 = 2_000;

/// Pub/sub channel carrying invalidation notices
pub const DEFAULT_INVALIDATION_CHANNEL: &str = "cache:invalidate";

// =============================================================================
// TTL Categories
// =============================================================================

/// Well-known data categories with their own default lifetimes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TtlCategory {
    Session,
    User,
    Workspace,
    Widget,
    Dashboard,
    Integration,
    Analytics,
    Static,
}

impl TtlCategory {
    /// All categories, in table order
    pub fn all() -> &'static [TtlCategory] {
        &[
            TtlCategory::Session,
            TtlCategory::User,
            TtlCategory::Workspace,
            TtlCategory::Widget,
            TtlCategory::Dashboard,
            TtlCategory::Integration,
            TtlCategory::Analytics,
            TtlCategory::Static,
        ]
    }
}

impl fmt::Display for TtlCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TtlCategory::Session => write!(f, "session"),
            TtlCategory::User => write!(f, "user"),
            TtlCategory::Workspace => write!(f, "workspace"),
            TtlCategory::Widget => write!(f, "widget"),
            TtlCategory::Dashboard => write!(f, "dashboard"),
            TtlCategory::Integration => write!(f, "integration"),
            TtlCategory::Analytics => write!(f, "analytics"),
            TtlCategory::Static => write!(f, "static"),
        }
    }
}

/// Default TTL, in seconds, per category
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TtlTable {
    pub session: u64,
    pub user: u64,
    pub workspace: u64,
    pub widget: u64,
    pub dashboard: u64,
    pub integration: u64,
    pub analytics: u64,
    #[serde(rename = "static")]
    pub static_content: u64,
}

impl Default for TtlTable {
    fn default() -> Self {
        Self {
            session: 3600,
            user: 1800,
            workspace: 900,
            widget: 300,
            dashboard: 600,
            integration: 60,
            analytics: 120,
            static_content: 86400,
        }
    }
}

impl TtlTable {
    /// Look up the TTL for a category
    pub fn get(&self, category: TtlCategory) -> Duration {
        let secs = match category {
            TtlCategory::Session => self.session,
            TtlCategory::User => self.user,
            TtlCategory::Workspace => self.workspace,
            TtlCategory::Widget => self.widget,
            TtlCategory::Dashboard => self.dashboard,
            TtlCategory::Integration => self.integration,
            TtlCategory::Analytics => self.analytics,
            TtlCategory::Static => self.static_content,
        };
        Duration::from_secs(secs)
    }
}

// =============================================================================
// Lock Configuration
// =============================================================================

/// Defaults for the distributed lock manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Lock lifetime when the caller does not give one
    pub ttl_secs: u64,
    /// Acquisition attempts made by `with_lock`
    pub retries: u32,
    /// Base delay between attempts; attempt `n` waits `n * retry_delay`
    pub retry_delay_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 30,
            retries: 3,
            retry_delay_ms: 100,
        }
    }
}

impl LockConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

// =============================================================================
// Cache Configuration
// =============================================================================

/// Configuration for the cache service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Per-category TTL table
    pub ttl: TtlTable,
    /// TTL used when a write specifies none
    pub default_ttl_secs: u64,
    /// L1 ceiling
    pub local_ceiling_secs: u64,
    /// L1 sweep interval
    pub cleanup_interval_secs: u64,
    /// Tag set lifetime beyond its member's TTL
    pub tag_ttl_margin_secs: u64,
    /// Deadline for a single shared-store round trip
    pub store_timeout_ms: u64,
    /// Pub/sub channel for invalidation notices
    pub invalidation_channel: String,
    /// Lock defaults
    pub lock: LockConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: TtlTable::default(),
            default_ttl_secs: 300,
            local_ceiling_secs: DEFAULT_LOCAL_CEILING_SECS,
            cleanup_interval_secs: DEFAULT_CLEANUP_INTERVAL_SECS,
            tag_ttl_margin_secs: DEFAULT_TAG_TTL_MARGIN_SECS,
            store_timeout_ms: DEFAULT_STORE_TIMEOUT_MS,
            invalidation_channel: DEFAULT_INVALIDATION_CHANNEL.to_string(),
            lock: LockConfig::default(),
        }
    }
}

impl CacheConfig {
    /// Parse a configuration from a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Load a configuration from a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    /// TTL for a data category
    pub fn ttl_for(&self, category: TtlCategory) -> Duration {
        self.ttl.get(category)
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn local_ceiling(&self) -> Duration {
        Duration::from_secs(self.local_ceiling_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn tag_ttl_margin(&self) -> Duration {
        Duration::from_secs(self.tag_ttl_margin_secs)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_ttl_table() {
        let config = CacheConfig::default();
        assert_eq!(config.ttl_for(TtlCategory::Session), Duration::from_secs(3600));
        assert_eq!(config.ttl_for(TtlCategory::User), Duration::from_secs(1800));
        assert_eq!(config.ttl_for(TtlCategory::Workspace), Duration::from_secs(900));
        assert_eq!(config.ttl_for(TtlCategory::Widget), Duration::from_secs(300));
        assert_eq!(config.ttl_for(TtlCategory::Dashboard), Duration::from_secs(600));
        assert_eq!(config.ttl_for(TtlCategory::Integration), Duration::from_secs(60));
        assert_eq!(config.ttl_for(TtlCategory::Analytics), Duration::from_secs(120));
        assert_eq!(config.ttl_for(TtlCategory::Static), Duration::from_secs(86400));
    }

    #[test]
    fn test_default_bounds() {
        let config = CacheConfig::default();
        assert_eq!(config.local_ceiling(), Duration::from_secs(30));
        assert_eq!(config.cleanup_interval(), Duration::from_secs(60));
        assert_eq!(config.lock.ttl(), Duration::from_secs(30));
        assert_eq!(config.lock.retries, 3);
        assert_eq!(config.lock.retry_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r#"
local_ceiling_secs: 10
ttl:
  widget: 45
  static: 7200
lock:
  retries: 5
"#;
        let config = CacheConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.local_ceiling_secs, 10);
        assert_eq!(config.ttl_for(TtlCategory::Widget), Duration::from_secs(45));
        assert_eq!(config.ttl_for(TtlCategory::Static), Duration::from_secs(7200));
        assert_eq!(config.ttl_for(TtlCategory::Session), Duration::from_secs(3600));
        assert_eq!(config.lock.retries, 5);
        assert_eq!(config.lock.ttl_secs, 30);
        assert_eq!(config.invalidation_channel, DEFAULT_INVALIDATION_CHANNEL);
    }

    #[test]
    fn test_yaml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "store_timeout_ms: 250").unwrap();
        writeln!(file, "invalidation_channel: \"tenant-a:invalidate\"").unwrap();

        let config = CacheConfig::from_yaml_file(file.path()).unwrap();
        assert_eq!(config.store_timeout(), Duration::from_millis(250));
        assert_eq!(config.invalidation_channel, "tenant-a:invalidate");
    }

    #[test]
    fn test_invalid_yaml() {
        let err = CacheConfig::from_yaml_str("lock: [not, a, map]").unwrap_err();
        assert!(matches!(err, crate::error::Error::ConfigParse(_)));
    }

    #[test]
    fn test_category_display() {
        assert_eq!(TtlCategory::Static.to_string(), "static");
        assert_eq!(TtlCategory::all().len(), 8);
    }
}
