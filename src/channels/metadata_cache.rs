//! Shared cache of per-conversation metadata resolved from platform APIs.
//!
//! Entries are keyed by conversation and optional thread. Lookups that miss or
//! fail are never fatal: the caller proceeds without the metadata.

use crate::config::MetadataCacheConfig;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    conversation: String,
    thread: Option<String>,
}

impl CacheKey {
    fn new(conversation: &str, thread: Option<&str>) -> Self {
        Self {
            conversation: conversation.to_string(),
            thread: thread.map(str::to_string),
        }
    }
}

struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
}

pub struct MetadataCache<V> {
    entries: RwLock<HashMap<CacheKey, CacheEntry<V>>>,
    ttl: Duration,
    max_entries: usize,
}

impl<V: Clone> MetadataCache<V> {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    pub fn from_config(config: &MetadataCacheConfig) -> Self {
        Self::new(Duration::from_secs(config.ttl_secs), config.max_entries)
    }

    /// Cached value for `(conversation, thread)` if present and not expired.
    pub fn get(&self, conversation: &str, thread: Option<&str>) -> Option<V> {
        let key = CacheKey::new(conversation, thread);
        let entries = self.entries.read();
        entries
            .get(&key)
            .filter(|entry| entry.inserted_at.elapsed() < self.ttl)
            .map(|entry| entry.value.clone())
    }

    pub fn insert(&self, conversation: &str, thread: Option<&str>, value: V) {
        let mut entries = self.entries.write();
        let ttl = self.ttl;
        entries.retain(|_, entry| entry.inserted_at.elapsed() < ttl);

        let key = CacheKey::new(conversation, thread);
        if !entries.contains_key(&key) && entries.len() >= self.max_entries {
            let oldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.inserted_at)
                .map(|(key, _)| key.clone());
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
            }
        }

        entries.insert(
            key,
            CacheEntry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cached value, or the result of `fetch` on a miss. Fetch errors and
    /// empty results are treated as a miss and are not cached.
    pub async fn resolve_with<F, Fut>(
        &self,
        conversation: &str,
        thread: Option<&str>,
        fetch: F,
    ) -> Option<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Option<V>>>,
    {
        if let Some(hit) = self.get(conversation, thread) {
            return Some(hit);
        }

        match fetch().await {
            Ok(Some(value)) => {
                self.insert(conversation, thread, value.clone());
                Some(value)
            }
            Ok(None) => None,
            Err(err) => {
                tracing::debug!(
                    conversation,
                    thread = thread.unwrap_or(""),
                    error = %err,
                    "metadata lookup failed; continuing without it"
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn resolve_with_caches_successful_fetch() {
        let cache = MetadataCache::new(Duration::from_secs(60), 10);
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let value = cache
                .resolve_with("chat-1", Some("42"), || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(Some("starter".to_string()))
                })
                .await;
            assert_eq!(value.as_deref(), Some("starter"));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fetch_error_is_a_non_fatal_miss() {
        let cache: MetadataCache<String> = MetadataCache::new(Duration::from_secs(60), 10);
        let value = cache
            .resolve_with("chat-1", None, || async { anyhow::bail!("api down") })
            .await;
        assert!(value.is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn thread_is_part_of_the_key() {
        let cache = MetadataCache::new(Duration::from_secs(60), 10);
        cache.insert("chat-1", Some("1"), 1);
        cache.insert("chat-1", None, 2);
        assert_eq!(cache.get("chat-1", Some("1")), Some(1));
        assert_eq!(cache.get("chat-1", None), Some(2));
        assert_eq!(cache.get("chat-1", Some("2")), None);
    }

    #[test]
    fn expired_entries_are_not_returned() {
        let cache = MetadataCache::new(Duration::ZERO, 10);
        cache.insert("chat-1", None, 1);
        assert_eq!(cache.get("chat-1", None), None);
    }

    #[test]
    fn capacity_evicts_oldest_entry() {
        let cache = MetadataCache::new(Duration::from_secs(60), 2);
        cache.insert("a", None, 1);
        std::thread::sleep(Duration::from_millis(2));
        cache.insert("b", None, 2);
        std::thread::sleep(Duration::from_millis(2));
        cache.insert("c", None, 3);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a", None), None);
        assert_eq!(cache.get("c", None), Some(3));
    }

    #[test]
    fn concurrent_inserts_are_safe() {
        let cache = Arc::new(MetadataCache::new(Duration::from_secs(60), 1000));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        cache.insert(&format!("chat-{t}"), Some(&i.to_string()), i);
                        let _ = cache.get(&format!("chat-{t}"), Some(&i.to_string()));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cache.len(), 400);
    }
}
