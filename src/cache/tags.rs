//! Tag Index
//!
//! Maintains, per tag, the set of cache keys written with that tag so a whole
//! group can be invalidated at once. Tag sets outlive their members by a
//! safety margin; an index that expires early only makes a member
//! untaggable, the member still expires on its own TTL.

use crate::cache::storage::{bounded, SharedStoreRef};
use crate::error::Result;
use std::time::Duration;
use tracing::debug;

/// Prefix for tag set keys in the shared store
pub const TAG_KEY_PREFIX: &str = "tag:";

/// Shared-store key holding a tag's members
pub fn tag_key(tag: &str) -> String {
    format!("{}{}", TAG_KEY_PREFIX, tag)
}

/// Index from tag to member keys, kept in the shared store
pub struct TagIndex {
    store: SharedStoreRef,
    margin: Duration,
    timeout: Duration,
}

impl TagIndex {
    pub fn new(store: SharedStoreRef, margin: Duration, timeout: Duration) -> Self {
        Self {
            store,
            margin,
            timeout,
        }
    }

    /// Record `key` under every tag
    ///
    /// Each tag set's TTL is refreshed to `ttl + margin`. Members written with
    /// no expiry leave the set's TTL untouched: the margin is a heuristic for
    /// bounded lifetimes only.
    pub async fn add(&self, key: &str, tags: &[String], ttl: Duration) -> Result<()> {
        for tag in tags {
            let set = tag_key(tag);
            bounded("SADD", self.timeout, self.store.sadd(&set, key)).await?;
            if !ttl.is_zero() {
                bounded("EXPIRE", self.timeout, self.store.expire(&set, ttl + self.margin))
                    .await?;
            }
        }
        Ok(())
    }

    /// Keys currently recorded under a tag
    pub async fn members(&self, tag: &str) -> Result<Vec<String>> {
        bounded("SMEMBERS", self.timeout, self.store.smembers(&tag_key(tag))).await
    }

    /// Delete every member of a tag and the tag set itself in one batch
    ///
    /// Returns the member keys that were invalidated (empty if the tag had
    /// none, in which case nothing is deleted).
    pub async fn invalidate(&self, tag: &str) -> Result<Vec<String>> {
        let members = self.members(tag).await?;
        if members.is_empty() {
            return Ok(members);
        }

        let mut batch = members.clone();
        batch.push(tag_key(tag));
        let removed = bounded("DEL", self.timeout, self.store.delete(&batch)).await?;

        debug!(tag = %tag, members = members.len(), removed = removed, "Invalidated tag");
        Ok(members)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::storage::{MemoryStore, SharedStore};
    use std::sync::Arc;

    fn index(store: &Arc<MemoryStore>) -> TagIndex {
        TagIndex::new(store.clone(), Duration::from_secs(60), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_add_and_members() {
        let store = Arc::new(MemoryStore::new());
        let tags = index(&store);

        let tag_list = vec!["workspace:1".to_string(), "portal:9".to_string()];
        tags.add("widget:1", &tag_list, Duration::from_secs(300)).await.unwrap();
        tags.add("widget:2", &tag_list[..1], Duration::from_secs(300)).await.unwrap();

        let mut members = tags.members("workspace:1").await.unwrap();
        members.sort();
        assert_eq!(members, vec!["widget:1", "widget:2"]);
        assert_eq!(tags.members("portal:9").await.unwrap(), vec!["widget:1"]);
    }

    #[tokio::test]
    async fn test_tag_set_outlives_member() {
        let store = Arc::new(MemoryStore::new());
        let tags = TagIndex::new(store.clone(), Duration::from_millis(100), Duration::from_secs(1));

        tags.add("k", &["t".to_string()], Duration::from_millis(20)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(tags.members("t").await.unwrap(), vec!["k"]);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(tags.members("t").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalidate() {
        let store = Arc::new(MemoryStore::new());
        let tags = index(&store);

        store.set("a", b"1", None).await.unwrap();
        store.set("b", b"2", None).await.unwrap();
        let t = vec!["T".to_string()];
        tags.add("a", &t, Duration::from_secs(60)).await.unwrap();
        tags.add("b", &t, Duration::from_secs(60)).await.unwrap();

        let mut invalidated = tags.invalidate("T").await.unwrap();
        invalidated.sort();
        assert_eq!(invalidated, vec!["a", "b"]);
        assert!(store.get("a").await.unwrap().is_none());
        assert!(store.get("b").await.unwrap().is_none());
        assert!(store.smembers(&tag_key("T")).await.unwrap().is_empty());

        assert!(tags.invalidate("T").await.unwrap().is_empty());
    }
}
