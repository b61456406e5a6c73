//! memoizing caches keyed by the canonical hash of a request.
//!
//! three interchangeable backends share one interface:
//! * memory: a process-lifetime map
//! * append log: one `.jsonl` file replayed into memory on first use
//! * blob file: one file per entry, written with an atomic rename
//!
//! reads never fail: a missing, malformed or unreadable entry is a miss. writes
//! surface their errors so a broken cache is never silently permanent.
//!
pub mod append_log;
pub mod blob_file;
pub mod chat;
pub mod entry;
pub mod memory;
pub mod registry;

use futures::future::{self, Either};
use log::*;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::path::Path;
use std::str::FromStr;

pub use append_log::AppendLogCache;
pub use blob_file::BlobFileCache;
pub use entry::{compute_sha, normalize_name, CacheEntry};
pub use memory::MemoryCache;
pub use registry::{CacheOptions, CacheRegistry, SessionState};

use crate::cancel::CancellationToken;
use crate::error::CacheError;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheKind {
    #[default]
    #[serde(rename = "memory")]
    Memory,
    #[serde(rename = "jsonl")]
    AppendLog,
    #[serde(rename = "fs")]
    BlobFile,
}

impl CacheKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheKind::Memory => "memory",
            CacheKind::AppendLog => "jsonl",
            CacheKind::BlobFile => "fs",
        }
    }
}

impl fmt::Display for CacheKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "memory" => Ok(CacheKind::Memory),
            "jsonl" => Ok(CacheKind::AppendLog),
            "fs" => Ok(CacheKind::BlobFile),
            _ => Err(anyhow::anyhow!("unknown cache kind: {}", s)),
        }
    }
}

/// a cache handle; the variant is chosen once by `Cache::open`
#[derive(Debug)]
pub enum Cache {
    Memory(MemoryCache),
    AppendLog(AppendLogCache),
    BlobFile(BlobFileCache),
}

impl Cache {
    /// construct a backend for an already sanitized name without touching storage
    pub fn open(kind: CacheKind, root: &Path, name: &str) -> Cache {
        match kind {
            CacheKind::Memory => Cache::Memory(MemoryCache::new(name)),
            CacheKind::AppendLog => Cache::AppendLog(AppendLogCache::new(root, name)),
            CacheKind::BlobFile => Cache::BlobFile(BlobFileCache::new(root, name)),
        }
    }

    pub fn kind(&self) -> CacheKind {
        match self {
            Cache::Memory(_) => CacheKind::Memory,
            Cache::AppendLog(_) => CacheKind::AppendLog,
            Cache::BlobFile(_) => CacheKind::BlobFile,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Cache::Memory(c) => c.name(),
            Cache::AppendLog(c) => c.name(),
            Cache::BlobFile(c) => c.name(),
        }
    }

    pub async fn get_entry(&self, sha: &str) -> Option<CacheEntry> {
        match self {
            Cache::Memory(c) => c.get_entry(sha).await,
            Cache::AppendLog(c) => c.get_entry(sha).await,
            Cache::BlobFile(c) => c.get_entry(sha).await,
        }
    }

    /// upsert; the last write for a sha wins
    pub async fn set_entry(&self, entry: CacheEntry) -> Result<(), CacheError> {
        match self {
            Cache::Memory(c) => {
                c.set_entry(entry).await;
                Ok(())
            }
            Cache::AppendLog(c) => c.set_entry(entry).await,
            Cache::BlobFile(c) => c.set_entry(entry).await,
        }
    }

    pub async fn values(&self) -> Vec<CacheEntry> {
        match self {
            Cache::Memory(c) => c.values().await,
            Cache::AppendLog(c) => c.values().await,
            Cache::BlobFile(c) => c.values().await,
        }
    }

    pub async fn clear(&self) -> Result<(), CacheError> {
        match self {
            Cache::Memory(c) => {
                c.clear().await;
                Ok(())
            }
            Cache::AppendLog(c) => c.clear().await,
            Cache::BlobFile(c) => c.clear().await,
        }
    }

    /// look up the value stored for `key`; any failure is reported as a miss
    pub async fn get<K, V>(&self, key: &K) -> Option<V>
    where
        K: Serialize + ?Sized,
        V: DeserializeOwned,
    {
        let sha = match compute_sha(key) {
            Ok(sha) => sha,
            Err(e) => {
                warn!("cache {} key error, treating as miss: {}", self.name(), e);
                return None;
            }
        };

        let entry = self.get_entry(&sha).await?;
        match serde_json::from_value(entry.val) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("cache {} entry {} has an unexpected shape: {}", self.name(), sha, e);
                None
            }
        }
    }

    pub async fn set<K, V>(&self, key: &K, value: &V) -> Result<(), CacheError>
    where
        K: Serialize + ?Sized,
        V: Serialize + ?Sized,
    {
        let sha = compute_sha(key)?;
        let val = serde_json::to_value(value)?;
        self.set_entry(CacheEntry::new(sha, val)).await
    }

    /// like `get`, but fails fast with `CacheError::Cancelled` once the token fires
    pub async fn get_cancellable<K, V>(
        &self,
        key: &K,
        token: &CancellationToken,
    ) -> Result<Option<V>, CacheError>
    where
        K: Serialize + ?Sized,
        V: DeserializeOwned,
    {
        token.check()?;

        let lookup = Box::pin(self.get::<K, V>(key));
        let cancelled = Box::pin(token.cancelled());
        match future::select(lookup, cancelled).await {
            Either::Left((value, _)) => Ok(value),
            Either::Right(_) => Err(CacheError::Cancelled),
        }
    }

    /// return the cached value for `key`, or run `producer`, store and return its value
    pub async fn get_or_insert_with<K, V, F, Fut>(
        &self,
        key: &K,
        producer: F,
    ) -> anyhow::Result<V>
    where
        K: Serialize + ?Sized,
        V: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<V>>,
    {
        if let Some(v) = self.get(key).await {
            return Ok(v);
        }

        let value = producer().await?;
        self.set(key, &value).await?;
        Ok(value)
    }
}
