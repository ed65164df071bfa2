//! In-Process Shared Store
//!
//! A [`SharedStore`] kept entirely in memory. Used for single-instance
//! deployments and tests; several `CacheService`s holding the same
//! `Arc<MemoryStore>` behave like several processes sharing one Redis.

use crate::cache::entry::StoredValue;
use crate::cache::storage::SharedStore;
use crate::error::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

/// Buffered messages per pub/sub channel before slow subscribers lag
const CHANNEL_CAPACITY: usize = 1024;

// =============================================================================
// Slots
// =============================================================================

#[derive(Debug, Clone)]
enum SlotData {
    Bytes(Vec<u8>),
    Set(HashSet<String>),
}

#[derive(Debug, Clone)]
struct Slot {
    data: SlotData,
    expires_at: Option<Instant>,
}

impl Slot {
    fn new(data: SlotData, ttl: Option<Duration>) -> Self {
        Self {
            data,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    fn remaining(&self, now: Instant) -> Option<Duration> {
        self.expires_at.map(|at| at.saturating_duration_since(now))
    }
}

// =============================================================================
// Memory Store
// =============================================================================

/// Shared store held in process memory
pub struct MemoryStore {
    slots: Mutex<HashMap<String, Slot>>,
    channels: DashMap<String, broadcast::Sender<String>>,
    /// When false every operation fails as if the store were unreachable
    available: AtomicBool,
    /// Artificial delay added to every operation
    latency_ms: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            channels: DashMap::new(),
            available: AtomicBool::new(true),
            latency_ms: AtomicU64::new(0),
        }
    }

    /// Simulate the store going down or coming back
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    /// Add a fixed delay to every operation
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::Release);
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.slots
            .lock()
            .values()
            .filter(|slot| !slot.is_expired(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn enter(&self) -> Result<()> {
        let latency = self.latency_ms.load(Ordering::Acquire);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.available.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::StoreUnavailable {
                backend: self.backend().to_string(),
            })
        }
    }

    /// Run `f` against the live slot map, dropping expired slots first
    fn with_live<T>(&self, key: &str, f: impl FnOnce(&mut HashMap<String, Slot>) -> T) -> T {
        let mut slots = self.slots.lock();
        let now = Instant::now();
        if slots.get(key).is_some_and(|slot| slot.is_expired(now)) {
            slots.remove(key);
        }
        f(&mut slots)
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Rewrite a Redis `MATCH` pattern into `glob` crate syntax
///
/// Redis negates a class with `[^…]` and escapes with a backslash; `glob`
/// uses `[!…]` and bracketed literals. Runs of `*` collapse to one, since
/// `glob` rejects `**` outside a path component. Ranges and `?` are the same
/// in both.
pub(crate) fn match_to_glob(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    let mut chars = pattern.chars().peekable();
    let mut in_class = false;

    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some(escaped @ ('*' | '?' | '[')) if !in_class => {
                    out.push('[');
                    out.push(escaped);
                    out.push(']');
                }
                Some(escaped) => out.push(escaped),
                None => out.push('\\'),
            },
            '[' if !in_class => {
                in_class = true;
                out.push('[');
                if chars.peek() == Some(&'^') {
                    chars.next();
                    out.push('!');
                }
            }
            ']' if in_class => {
                in_class = false;
                out.push(']');
            }
            '*' if !in_class => {
                out.push('*');
                while chars.peek() == Some(&'*') {
                    chars.next();
                }
            }
            other => out.push(other),
        }
    }
    out
}

fn wrong_type(key: &str) -> Error {
    Error::WrongType {
        key: key.to_string(),
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<StoredValue>> {
        self.enter().await?;
        self.with_live(key, |slots| match slots.get(key) {
            None => Ok(None),
            Some(slot) => match &slot.data {
                SlotData::Bytes(bytes) => Ok(Some(StoredValue::new(
                    bytes.clone(),
                    slot.remaining(Instant::now()),
                ))),
                SlotData::Set(_) => Err(wrong_type(key)),
            },
        })
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        self.enter().await?;
        let slots = self.slots.lock();
        let now = Instant::now();
        Ok(keys
            .iter()
            .map(|key| match slots.get(key) {
                Some(slot) if !slot.is_expired(now) => match &slot.data {
                    SlotData::Bytes(bytes) => Some(bytes.clone()),
                    SlotData::Set(_) => None,
                },
                _ => None,
            })
            .collect())
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        self.enter().await?;
        self.slots.lock().insert(
            key.to_string(),
            Slot::new(SlotData::Bytes(value.to_vec()), ttl),
        );
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        self.enter().await?;
        self.with_live(key, |slots| {
            if slots.contains_key(key) {
                return Ok(false);
            }
            slots.insert(
                key.to_string(),
                Slot::new(SlotData::Bytes(value.to_vec()), Some(ttl)),
            );
            Ok(true)
        })
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        self.enter().await?;
        let mut slots = self.slots.lock();
        let now = Instant::now();
        let removed = keys
            .iter()
            .filter_map(|key| slots.remove(key))
            .filter(|slot| !slot.is_expired(now))
            .count();
        Ok(removed as u64)
    }

    /// Keys matching a Redis `MATCH` pattern, translated by [`match_to_glob`]
    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        self.enter().await?;
        let pattern = glob::Pattern::new(&match_to_glob(pattern))
            .map_err(|e| Error::Internal(format!("invalid key pattern {}: {}", pattern, e)))?;
        let now = Instant::now();
        Ok(self
            .slots
            .lock()
            .iter()
            .filter(|(key, slot)| !slot.is_expired(now) && pattern.matches(key))
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn sadd(&self, set: &str, member: &str) -> Result<()> {
        self.enter().await?;
        self.with_live(set, |slots| {
            let slot = slots
                .entry(set.to_string())
                .or_insert_with(|| Slot::new(SlotData::Set(HashSet::new()), None));
            match &mut slot.data {
                SlotData::Set(members) => {
                    members.insert(member.to_string());
                    Ok(())
                }
                SlotData::Bytes(_) => Err(wrong_type(set)),
            }
        })
    }

    async fn smembers(&self, set: &str) -> Result<Vec<String>> {
        self.enter().await?;
        self.with_live(set, |slots| match slots.get(set) {
            None => Ok(Vec::new()),
            Some(Slot {
                data: SlotData::Set(members),
                ..
            }) => Ok(members.iter().cloned().collect()),
            Some(_) => Err(wrong_type(set)),
        })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.enter().await?;
        self.with_live(key, |slots| match slots.get_mut(key) {
            Some(slot) => {
                slot.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        })
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        self.enter().await?;
        self.with_live(key, |slots| {
            let slot = slots
                .entry(key.to_string())
                .or_insert_with(|| Slot::new(SlotData::Bytes(b"0".to_vec()), None));
            let SlotData::Bytes(bytes) = &mut slot.data else {
                return Err(wrong_type(key));
            };
            let current: i64 = std::str::from_utf8(bytes)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| wrong_type(key))?;
            let next = current + 1;
            *bytes = next.to_string().into_bytes();
            Ok(next)
        })
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        self.enter().await?;
        // No subscribers is not an error
        let _ = self.sender(channel).send(message.to_string());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, Result<String>>> {
        self.enter().await?;
        let rx = self.sender(channel).subscribe();
        let stream = stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(message) => return Some((Ok(message), rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<bool> {
        self.enter().await?;
        self.with_live(key, |slots| {
            let matches = matches!(
                slots.get(key),
                Some(Slot { data: SlotData::Bytes(bytes), .. }) if bytes.as_slice() == expected
            );
            if matches {
                slots.remove(key);
            }
            Ok(matches)
        })
    }

    async fn ping(&self) -> Result<()> {
        self.enter().await
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_get_set_delete() {
        let store = MemoryStore::new();

        store.set("k", b"v", Some(Duration::from_secs(60))).await.unwrap();
        let value = store.get("k").await.unwrap().unwrap();
        assert_eq!(value.bytes, b"v");
        assert!(value.ttl.unwrap() <= Duration::from_secs(60));

        store.set("forever", b"v", None).await.unwrap();
        assert_eq!(store.get("forever").await.unwrap().unwrap().ttl, None);

        let deleted = store
            .delete(&["k".to_string(), "missing".to_string()])
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expiry() {
        let store = MemoryStore::new();
        store.set("k", b"v", Some(Duration::from_millis(20))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(store.get("k").await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_set_nx() {
        let store = MemoryStore::new();
        assert!(store.set_nx("lock", b"a", Duration::from_secs(10)).await.unwrap());
        assert!(!store.set_nx("lock", b"b", Duration::from_secs(10)).await.unwrap());
        assert_eq!(store.get("lock").await.unwrap().unwrap().bytes, b"a");
    }

    #[tokio::test]
    async fn test_set_nx_after_expiry() {
        let store = MemoryStore::new();
        assert!(store.set_nx("lock", b"a", Duration::from_millis(10)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(store.set_nx("lock", b"b", Duration::from_secs(10)).await.unwrap());
    }

    #[tokio::test]
    async fn test_keys_pattern() {
        let store = MemoryStore::new();
        store.set("widget:1", b"a", None).await.unwrap();
        store.set("widget:2", b"b", None).await.unwrap();
        store.set("user:1", b"c", None).await.unwrap();

        let mut keys = store.keys("widget:*").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["widget:1", "widget:2"]);
    }

    #[tokio::test]
    async fn test_keys_follow_redis_match_syntax() {
        let store = MemoryStore::new();
        for key in ["a1", "b1", "c1", "a**", "q?"] {
            store.set(key, b"x", None).await.unwrap();
        }

        let mut keys = store.keys("[^a]1").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["b1", "c1"]);

        let mut keys = store.keys("a**").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["a**", "a1"]);

        assert_eq!(store.keys("a\\*\\*").await.unwrap(), vec!["a**"]);
        assert_eq!(store.keys("q\\?").await.unwrap(), vec!["q?"]);
    }

    #[test]
    fn test_match_to_glob() {
        assert_eq!(match_to_glob("user:*"), "user:*");
        assert_eq!(match_to_glob("[^a]1"), "[!a]1");
        assert_eq!(match_to_glob("[a-c]?"), "[a-c]?");
        assert_eq!(match_to_glob("a***b"), "a*b");
        assert_eq!(match_to_glob("report\\[2024]"), "report[[]2024]");
        assert_eq!(match_to_glob("[*]"), "[*]");
    }

    #[tokio::test]
    async fn test_sets() {
        let store = MemoryStore::new();
        store.sadd("tag:t", "a").await.unwrap();
        store.sadd("tag:t", "b").await.unwrap();
        store.sadd("tag:t", "a").await.unwrap();

        let mut members = store.smembers("tag:t").await.unwrap();
        members.sort();
        assert_eq!(members, vec!["a", "b"]);
        assert!(store.smembers("tag:none").await.unwrap().is_empty());

        store.set("plain", b"v", None).await.unwrap();
        assert_matches!(store.sadd("plain", "a").await, Err(Error::WrongType { .. }));
    }

    #[tokio::test]
    async fn test_incr_and_expire() {
        let store = MemoryStore::new();
        assert_eq!(store.incr("c").await.unwrap(), 1);
        assert_eq!(store.incr("c").await.unwrap(), 2);
        assert!(store.expire("c", Duration::from_millis(20)).await.unwrap());
        assert!(!store.expire("missing", Duration::from_secs(1)).await.unwrap());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.incr("c").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_compare_and_delete() {
        let store = MemoryStore::new();
        store.set("lock", b"token-a", None).await.unwrap();

        assert!(!store.compare_and_delete("lock", b"token-b").await.unwrap());
        assert!(store.get("lock").await.unwrap().is_some());

        assert!(store.compare_and_delete("lock", b"token-a").await.unwrap());
        assert!(store.get("lock").await.unwrap().is_none());
        assert!(!store.compare_and_delete("lock", b"token-a").await.unwrap());
    }

    #[tokio::test]
    async fn test_pubsub() {
        let store = MemoryStore::new();
        let mut first = store.subscribe("chan").await.unwrap();
        let mut second = store.subscribe("chan").await.unwrap();

        store.publish("chan", "hello").await.unwrap();
        store.publish("other", "ignored").await.unwrap();

        assert_eq!(first.next().await.unwrap().unwrap(), "hello");
        assert_eq!(second.next().await.unwrap().unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_unavailable() {
        let store = MemoryStore::new();
        store.set_available(false);
        assert_matches!(store.get("k").await, Err(Error::StoreUnavailable { .. }));
        assert_matches!(store.ping().await, Err(Error::StoreUnavailable { .. }));

        store.set_available(true);
        assert!(store.ping().await.is_ok());
    }
}
