use async_std::sync::Mutex;
use hashbrown::HashMap;
use log::*;

use super::CacheEntry;

/// process-lifetime cache backed by an in-memory map
#[derive(Debug)]
pub struct MemoryCache {
    name: String,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl MemoryCache {
    pub fn new(name: &str) -> MemoryCache {
        MemoryCache {
            name: name.to_string(),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn get_entry(&self, sha: &str) -> Option<CacheEntry> {
        self.entries.lock().await.get(sha).cloned()
    }

    pub async fn set_entry(&self, entry: CacheEntry) {
        debug!("memory cache {} set sha: {}", self.name, entry.sha);
        self.entries.lock().await.insert(entry.sha.clone(), entry);
    }

    pub async fn values(&self) -> Vec<CacheEntry> {
        self.entries.lock().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_get_clear() {
        async_std::task::block_on(async move {
            let cache = MemoryCache::new("test");
            assert_eq!(cache.len().await, 0);
            assert!(cache.get_entry("abc").await.is_none());

            cache
                .set_entry(CacheEntry::new("abc".to_string(), json!("v1")))
                .await;
            cache
                .set_entry(CacheEntry::new("abc".to_string(), json!("v2")))
                .await;
            assert_eq!(cache.len().await, 1);

            let entry = cache.get_entry("abc").await.expect("entry should exist");
            assert_eq!(entry.val, json!("v2"));

            cache.clear().await;
            assert_eq!(cache.len().await, 0);
            assert!(cache.values().await.is_empty());
        });
    }
}
