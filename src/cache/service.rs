//! Cache Service
//!
//! Registry of cache types, created on first use. A general mode applies on
//! top of each type's own mode: when it is not `Full`, it can switch reads or
//! writes off for every type at once.
//!
//! The service is an ordinary value; applications that want a process-wide
//! instance keep one in an `Arc` and pass it around.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::info;

use super::mode::CacheMode;
use super::set::OrganiseReport;
use super::typed::{RaCache, TagPolicy};
use crate::config::{CacheConfig, SettingsProvider};
use crate::error::{Error, Result};
use crate::serializer::{JsonSerializer, Serializer};

/// Every cache type under one cache root
pub struct RaCacheService<K, V, S = JsonSerializer> {
    config: Arc<CacheConfig>,
    serializer: Arc<S>,
    general_mode: RwLock<CacheMode>,
    caches: DashMap<String, Arc<RaCache<K, V, S>>>,
}

impl<K, V, S> RaCacheService<K, V, S>
where
    K: Serialize + DeserializeOwned + PartialEq + Clone + Send + Sync,
    V: Serialize + DeserializeOwned + Clone + Send + Sync,
    S: Serializer,
{
    /// Create a service over `config.root`
    pub fn new(config: CacheConfig, serializer: S) -> Self {
        info!(root = %config.root.display(), "Random access cache service started");
        Self {
            config: Arc::new(config),
            serializer: Arc::new(serializer),
            general_mode: RwLock::new(CacheMode::Full),
            caches: DashMap::new(),
        }
    }

    /// Create a service configured from `settings`
    pub fn from_settings(settings: &dyn SettingsProvider, serializer: S) -> Result<Self> {
        Ok(Self::new(CacheConfig::from_settings(settings)?, serializer))
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    // =========================================================================
    // Data Access
    // =========================================================================

    pub fn get(&self, cache_name: &str, set_name: &str, key: &K) -> Option<Arc<V>> {
        if !self.general_mode().allows_read() {
            return None;
        }
        self.cache(cache_name).get(set_name, key)
    }

    pub fn put(&self, cache_name: &str, set_name: &str, key: K, value: V) {
        if !self.general_mode().allows_write() {
            return;
        }
        self.cache(cache_name).put(set_name, key, value);
    }

    pub fn delete(&self, cache_name: &str, set_name: &str, key: &K) -> bool {
        if !self.general_mode().allows_write() {
            return false;
        }
        self.cache(cache_name).delete(set_name, key)
    }

    pub fn get_keys(&self, cache_name: &str, set_name: &str) -> Vec<K> {
        self.cache(cache_name).get_keys(set_name)
    }

    /// Compact every variant of a set
    pub fn organise(&self, cache_name: &str, set_name: &str) -> OrganiseReport {
        self.cache(cache_name).organise(set_name)
    }

    /// Empty every variant of a set
    pub fn delete_set(&self, cache_name: &str, set_name: &str) {
        self.cache(cache_name).empty_all_sets(set_name);
    }

    // =========================================================================
    // Cache Types
    // =========================================================================

    /// Get or create a cache type
    ///
    /// A new type starts in the general mode with no tag.
    pub fn cache(&self, cache_name: &str) -> Arc<RaCache<K, V, S>> {
        if let Some(cache) = self.caches.get(cache_name) {
            return Arc::clone(cache.value());
        }
        let mode = self.general_mode();
        self.create(cache_name, mode, TagPolicy::default())
    }

    /// Every cache type created so far, by name
    pub fn caches(&self) -> Vec<Arc<RaCache<K, V, S>>> {
        let mut caches: Vec<_> = self.caches.iter().map(|c| Arc::clone(c.value())).collect();
        caches.sort_by(|a, b| a.name().cmp(b.name()));
        caches
    }

    /// Set the mode of one cache type, creating it if needed
    pub fn set_cache_mode(&self, cache_name: &str, mode: CacheMode) {
        match self.caches.get(cache_name) {
            Some(cache) => cache.set_mode(mode),
            None => {
                self.create(cache_name, mode, TagPolicy::default()).set_mode(mode);
            }
        }
    }

    /// Set the mode of every existing cache type
    pub fn set_cache_mode_all(&self, mode: CacheMode) {
        for cache in self.caches.iter() {
            cache.set_mode(mode);
        }
    }

    /// Mode of an existing cache type
    pub fn cache_mode(&self, cache_name: &str) -> Result<CacheMode> {
        self.caches
            .get(cache_name)
            .map(|c| c.mode())
            .ok_or_else(|| Error::UnknownCache(cache_name.to_string()))
    }

    /// Set the active tag of one cache type, creating it if needed
    pub fn set_cache_tag(&self, cache_name: &str, tag: Option<String>, copy_existing: bool) {
        match self.caches.get(cache_name) {
            Some(cache) => cache.set_tag(tag, copy_existing),
            None => {
                let policy = TagPolicy { tag, copy_existing };
                self.create(cache_name, self.general_mode(), policy.clone())
                    .set_tag(policy.tag, policy.copy_existing);
            }
        }
    }

    /// Active tag of an existing cache type
    pub fn cache_tag(&self, cache_name: &str) -> Result<Option<String>> {
        self.caches
            .get(cache_name)
            .map(|c| c.tag())
            .ok_or_else(|| Error::UnknownCache(cache_name.to_string()))
    }

    pub fn general_mode(&self) -> CacheMode {
        *self.general_mode.read()
    }

    /// Set the mode applied on top of every cache type
    pub fn set_general_mode(&self, mode: CacheMode) {
        *self.general_mode.write() = mode;
    }

    // =========================================================================
    // Housekeeping
    // =========================================================================

    /// Pick up changes other processes made to open set files
    pub fn fast_sync(&self) {
        for cache in self.caches() {
            cache.fast_sync();
        }
    }

    /// Drop resident payloads everywhere; indexes are kept
    pub fn clear_memory(&self) {
        for cache in self.caches() {
            cache.clear_memory();
        }
    }

    /// Create a cache type unless another thread got there first
    fn create(&self, cache_name: &str, mode: CacheMode, policy: TagPolicy) -> Arc<RaCache<K, V, S>> {
        let cache = self
            .caches
            .entry(cache_name.to_string())
            .or_insert_with(|| {
                Arc::new(RaCache::new(
                    cache_name,
                    mode,
                    policy,
                    Arc::clone(&self.config),
                    Arc::clone(&self.serializer),
                ))
            });
        Arc::clone(cache.value())
    }
}
