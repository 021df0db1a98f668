use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug)]
struct Entry {
    value: Value,
    tags: HashSet<String>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    tag_index: HashMap<String, HashSet<String>>,
    invalidations: HashMap<String, u64>,
}

impl Inner {
    fn unlink(&mut self, key: &str) -> Option<Entry> {
        let entry = self.entries.remove(key)?;
        for tag in &entry.tags {
            if let Some(keys) = self.tag_index.get_mut(tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.tag_index.remove(tag);
                }
            }
        }
        Some(entry)
    }
}

/// Tagged content cache. Clones share the same store.
#[derive(Debug, Clone, Default)]
pub struct CacheManager {
    inner: Arc<RwLock<Inner>>,
}

impl CacheManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` under `key`, replacing any previous entry and its tags.
    pub async fn put(&self, key: &str, value: Value, tags: &[&str], ttl: Option<Duration>) {
        let mut inner = self.inner.write().await;
        inner.unlink(key);
        let tags: HashSet<String> = tags.iter().map(|t| t.to_string()).collect();
        for tag in &tags {
            inner
                .tag_index
                .entry(tag.clone())
                .or_default()
                .insert(key.to_string());
        }
        inner.entries.insert(
            key.to_string(),
            Entry {
                value,
                tags,
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
    }

    /// Fetch a live entry. Expired entries are dropped on read.
    pub async fn get(&self, key: &str) -> Option<Value> {
        let now = Instant::now();
        {
            let inner = self.inner.read().await;
            match inner.entries.get(key) {
                Some(entry) if !entry.is_expired(now) => return Some(entry.value.clone()),
                Some(_) => {}
                None => return None,
            }
        }
        let mut inner = self.inner.write().await;
        if inner.entries.get(key).is_some_and(|e| e.is_expired(now)) {
            inner.unlink(key);
        }
        None
    }

    pub async fn remove(&self, key: &str) -> bool {
        self.inner.write().await.unlink(key).is_some()
    }

    /// Remove every entry carrying any of `tags`. Returns the number removed.
    pub async fn invalidate_tags(&self, tags: &[String]) -> usize {
        let mut inner = self.inner.write().await;
        let mut keys = HashSet::new();
        for tag in tags {
            if let Some(tagged) = inner.tag_index.get(tag) {
                keys.extend(tagged.iter().cloned());
            }
            *inner.invalidations.entry(tag.clone()).or_insert(0) += 1;
        }
        let removed = keys
            .iter()
            .filter(|key| inner.unlink(key).is_some())
            .count();
        debug!(tags = ?tags, removed, "cache tags invalidated");
        removed
    }

    /// How many times `tag` has been invalidated.
    pub async fn invalidation_count(&self, tag: &str) -> u64 {
        self.inner
            .read()
            .await
            .invalidations
            .get(tag)
            .copied()
            .unwrap_or(0)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
