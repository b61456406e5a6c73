//! session scoped factory for cache handles.
//!
//! handles are memoized under `"{kind}:{sanitized name}"` in a map owned by the host
//! session. construction never touches storage, so the map is the only thing that
//! decides which instance lives.
use async_std::sync::Mutex;
use hashbrown::HashMap;
use log::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{normalize_name, Cache, CacheKind};

/// the host supplied map that retains constructed caches
pub type SessionState = Arc<Mutex<HashMap<String, Arc<Cache>>>>;

#[derive(Debug, Default, Clone, Copy)]
pub struct CacheOptions {
    pub kind: CacheKind,
    /// only return an existing instance, never construct one
    pub lookup_only: bool,
}

impl CacheOptions {
    pub fn new(kind: CacheKind) -> CacheOptions {
        CacheOptions {
            kind,
            lookup_only: false,
        }
    }

    pub fn lookup_only(mut self) -> CacheOptions {
        self.lookup_only = true;
        self
    }
}

#[derive(Debug, Clone)]
pub struct CacheRegistry {
    root: PathBuf,
    state: SessionState,
}

impl CacheRegistry {
    /// a registry with its own, fresh session state
    pub fn new(root: impl Into<PathBuf>) -> CacheRegistry {
        CacheRegistry::with_state(root, SessionState::default())
    }

    pub fn with_state(root: impl Into<PathBuf>, state: SessionState) -> CacheRegistry {
        CacheRegistry {
            root: root.into(),
            state,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session_state(&self) -> SessionState {
        self.state.clone()
    }

    pub fn registry_key(kind: CacheKind, name: &str) -> String {
        format!("{}:{}", kind, name)
    }

    /// return the cache for (kind, name), constructing it on first use.
    ///
    /// returns None when the name sanitizes to nothing (caching disabled) or when
    /// `lookup_only` is set and no instance exists yet.
    pub async fn create_cache(&self, name: &str, options: CacheOptions) -> Option<Arc<Cache>> {
        let name = normalize_name(name);
        if name.is_empty() {
            debug!("cache disabled, empty name");
            return None;
        }

        let key = CacheRegistry::registry_key(options.kind, &name);

        // the lock is held across lookup and insert so one key never yields two instances
        let mut state = self.state.lock().await;
        if let Some(cache) = state.get(&key) {
            return Some(cache.clone());
        }

        if options.lookup_only {
            return None;
        }

        info!("creating cache: {}", key);
        let cache = Arc::new(Cache::open(options.kind, &self.root, &name));
        state.insert(key, cache.clone());

        Some(cache)
    }

    pub async fn lookup(&self, name: &str, kind: CacheKind) -> Option<Arc<Cache>> {
        self.create_cache(name, CacheOptions::new(kind).lookup_only())
            .await
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.len()
    }
}
