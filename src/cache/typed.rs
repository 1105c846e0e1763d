//! Cache Type Engine
//!
//! A [`RaCache`] holds every set of one named cache type. A set name may
//! exist in several tagged variants, one file each. Reads try the active
//! tag first and then fall back to every other variant; writes always go to
//! the variant of the active tag.
//!
//! Variants are kept in a fixed order (untagged first, then by tag), so
//! when a key is found under more than one tag the pick is repeatable.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use super::index::{key_hash, KeyHasher};
use super::mode::CacheMode;
use super::set::{OrganiseReport, RaCacheSet};
use super::stats::SetStats;
use crate::config::CacheConfig;
use crate::naming;
use crate::serializer::{JsonSerializer, Serializer};

/// Active tag and what to do with hits found under other tags
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagPolicy {
    pub tag: Option<String>,
    /// Copy values found under another tag into the active tag's set
    pub copy_existing: bool,
}

type SetList<K, V, S> = Vec<Arc<RaCacheSet<K, V, S>>>;

/// All sets of one cache type
pub struct RaCache<K, V, S = JsonSerializer> {
    name: String,
    config: Arc<CacheConfig>,
    serializer: Arc<S>,
    hasher: KeyHasher,
    mode: RwLock<CacheMode>,
    policy: RwLock<TagPolicy>,
    sets: RwLock<BTreeMap<String, SetList<K, V, S>>>,
    tag_warnings: AtomicU32,
}

impl<K, V, S> RaCache<K, V, S>
where
    K: Serialize + DeserializeOwned + PartialEq + Clone + Send + Sync,
    V: Serialize + DeserializeOwned + Clone + Send + Sync,
    S: Serializer,
{
    /// Create the cache type and register the set files already on disk
    pub fn new(
        name: impl Into<String>,
        mode: CacheMode,
        policy: TagPolicy,
        config: Arc<CacheConfig>,
        serializer: Arc<S>,
    ) -> Self {
        let cache = Self {
            name: name.into(),
            config,
            serializer,
            hasher: key_hash,
            mode: RwLock::new(mode),
            policy: RwLock::new(policy),
            sets: RwLock::new(BTreeMap::new()),
            tag_warnings: AtomicU32::new(0),
        };
        cache.scan_for_sets();
        cache
    }

    /// Use another key hash function for every set of this type
    pub fn with_hasher(mut self, hasher: KeyHasher) -> Self {
        self.hasher = hasher;
        self.sets.write().clear();
        self.scan_for_sets();
        self
    }

    /// Name of the cache type
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register set files under the cache directory not yet known
    ///
    /// Returns the number of sets added.
    pub fn scan_for_sets(&self) -> usize {
        let dir = naming::cache_dir(&self.config.root, &self.name);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(_) => {
                if let Err(e) = std::fs::create_dir_all(&dir) {
                    warn!(dir = %dir.display(), error = %e, "Failed to create cache directory");
                }
                return 0;
            }
        };

        let mut added = 0;
        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let parsed = match file_name
                .to_str()
                .and_then(|name| naming::parse_set_file_name(name, &self.name))
            {
                Some(parsed) => parsed,
                None => continue,
            };

            let mut sets = self.sets.write();
            let list = sets.entry(parsed.set_name.clone()).or_default();
            if list
                .iter()
                .any(|s| s.tag_name() == parsed.tag_name.as_deref())
            {
                continue;
            }
            debug!(
                cache = %self.name,
                set = %parsed.set_name,
                tag = ?parsed.tag_name,
                "Found cache set file"
            );
            list.push(Arc::new(self.new_set(&parsed.set_name, parsed.tag_name)));
            sort_by_tag(list);
            added += 1;
        }
        added
    }

    // =========================================================================
    // Reads and Writes
    // =========================================================================

    /// Look up `key` in the variants of `set_name`
    pub fn get(&self, set_name: &str, key: &K) -> Option<Arc<V>> {
        if !self.mode().allows_read() {
            return None;
        }

        let mut sets = self.all_sets(set_name);
        if sets.is_empty() {
            // another process may have created it since we last looked
            self.scan_for_sets();
            sets = self.all_sets(set_name);
        }
        if sets.is_empty() {
            return None;
        }

        let policy = self.policy.read().clone();
        let active = policy.tag.as_deref();

        let mut tried = None;
        if let Some(tag) = active {
            if let Some(set) = sets.iter().find(|s| s.tag_name() == Some(tag)) {
                if let Some(value) = set.get(key) {
                    return Some(value);
                }
                tried = Some(Arc::clone(set));
            }
        }

        let mut found: Option<(Arc<V>, Option<String>)> = None;
        for set in &sets {
            if tried.as_ref().is_some_and(|t| Arc::ptr_eq(t, set)) {
                continue;
            }
            let value = match set.get(key) {
                Some(value) => value,
                None => continue,
            };
            match &found {
                None => {
                    found = Some((value, set.tag_name().map(str::to_string)));
                    if self.tag_warnings_suppressed() {
                        break;
                    }
                }
                Some((_, first_tag)) => {
                    self.warn_multiple_tags(set_name, first_tag.as_deref(), set.tag_name(), active)
                }
            }
        }

        let (value, found_tag) = found?;
        if policy.copy_existing && found_tag.as_deref() != active {
            self.put(set_name, key.clone(), V::clone(&value));
        }
        Some(value)
    }

    /// Store `value` in the active tag's variant of `set_name`
    pub fn put(&self, set_name: &str, key: K, value: V) {
        if !self.mode().allows_write() {
            return;
        }
        self.active_set(set_name).put(key, value);
    }

    /// Delete `key` from every variant of `set_name`
    pub fn delete(&self, set_name: &str, key: &K) -> bool {
        if !self.mode().allows_write() {
            return false;
        }
        self.all_sets(set_name)
            .iter()
            .fold(false, |deleted, set| set.delete(key) || deleted)
    }

    /// Keys of every variant of `set_name`, concatenated
    pub fn get_keys(&self, set_name: &str) -> Vec<K> {
        self.all_sets(set_name)
            .iter()
            .flat_map(|set| set.get_all_keys())
            .collect()
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Compact every variant of `set_name` without integrity checking
    pub fn organise(&self, set_name: &str) -> OrganiseReport {
        self.clean_all_sets(set_name, false)
    }

    /// Compact every variant of `set_name`
    ///
    /// A variant that fails is logged and skipped.
    pub fn clean_all_sets(&self, set_name: &str, check_integrity: bool) -> OrganiseReport {
        let mut total = OrganiseReport::default();
        for set in self.all_sets(set_name) {
            if let Ok(report) = set.organise(check_integrity) {
                total.merge(&report);
            }
        }
        total
    }

    /// Empty the file of every variant of `set_name`
    ///
    /// The files stay in place, emptied, so other processes see the change.
    pub fn empty_all_sets(&self, set_name: &str) {
        for set in self.all_sets(set_name) {
            set.clear();
        }
    }

    /// Ask every open set to pick up changes made elsewhere
    pub fn fast_sync(&self) {
        for set in self.every_set() {
            if set.is_open() {
                set.fast_sync();
            }
        }
    }

    /// Drop resident payloads of every set
    pub fn clear_memory(&self) {
        for set in self.every_set() {
            set.clear_memory();
        }
    }

    /// Statistics of every set
    pub fn stats(&self) -> Vec<SetStats> {
        self.every_set().iter().map(|set| set.stats()).collect()
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Every variant of `set_name`, untagged first
    pub fn all_sets(&self, set_name: &str) -> SetList<K, V, S> {
        self.sets
            .read()
            .get(set_name)
            .cloned()
            .unwrap_or_default()
    }

    /// The variant of `set_name` carrying exactly `tag`
    pub fn tagged_set(&self, set_name: &str, tag: Option<&str>) -> Option<Arc<RaCacheSet<K, V, S>>> {
        self.all_sets(set_name)
            .into_iter()
            .find(|s| s.tag_name() == tag)
    }

    /// Names of every known set
    pub fn set_names(&self) -> Vec<String> {
        self.sets.read().keys().cloned().collect()
    }

    pub fn mode(&self) -> CacheMode {
        *self.mode.read()
    }

    pub fn set_mode(&self, mode: CacheMode) {
        *self.mode.write() = mode;
    }

    /// Active tag
    pub fn tag(&self) -> Option<String> {
        self.policy.read().tag.clone()
    }

    pub fn copy_existing(&self) -> bool {
        self.policy.read().copy_existing
    }

    /// Switch the active tag
    pub fn set_tag(&self, tag: Option<String>, copy_existing: bool) {
        *self.policy.write() = TagPolicy { tag, copy_existing };
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn new_set(&self, set_name: &str, tag: Option<String>) -> RaCacheSet<K, V, S> {
        RaCacheSet::new(
            self.name.clone(),
            set_name,
            tag,
            Arc::clone(&self.config),
            Arc::clone(&self.serializer),
        )
        .with_hasher(self.hasher)
    }

    /// Variant for the active tag, created if missing
    fn active_set(&self, set_name: &str) -> Arc<RaCacheSet<K, V, S>> {
        let tag = self.tag();
        if let Some(set) = self.tagged_set(set_name, tag.as_deref()) {
            return set;
        }

        let mut sets = self.sets.write();
        let list = sets.entry(set_name.to_string()).or_default();
        if let Some(set) = list.iter().find(|s| s.tag_name() == tag.as_deref()) {
            return Arc::clone(set);
        }
        let set = Arc::new(self.new_set(set_name, tag));
        list.push(Arc::clone(&set));
        sort_by_tag(list);
        set
    }

    fn every_set(&self) -> SetList<K, V, S> {
        self.sets.read().values().flatten().cloned().collect()
    }

    fn tag_warnings_suppressed(&self) -> bool {
        self.tag_warnings.load(Ordering::Relaxed) >= self.config.max_multiple_tag_warnings
    }

    fn warn_multiple_tags(
        &self,
        set_name: &str,
        first: Option<&str>,
        second: Option<&str>,
        active: Option<&str>,
    ) {
        let count = self.tag_warnings.fetch_add(1, Ordering::Relaxed) + 1;
        if count > self.config.max_multiple_tag_warnings {
            return;
        }
        warn!(
            cache = %self.name,
            set = set_name,
            used_tag = ?first,
            other_tag = ?second,
            active_tag = ?active,
            "Cache entry found under more than one tag, using the first"
        );
        if count == self.config.max_multiple_tag_warnings {
            warn!(cache = %self.name, "Suppressing further multiple tag warnings");
        }
    }
}

fn sort_by_tag<K, V, S>(list: &mut SetList<K, V, S>) {
    list.sort_by(|a, b| a.tag_name().cmp(&b.tag_name()));
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestCache = RaCache<String, u64>;

    fn config(dir: &tempfile::TempDir) -> Arc<CacheConfig> {
        Arc::new(CacheConfig {
            stats_interval: None,
            max_multiple_tag_warnings: 2,
            ..CacheConfig::with_root(dir.path())
        })
    }

    fn cache(config: &Arc<CacheConfig>, tag: Option<&str>, copy_existing: bool) -> TestCache {
        RaCache::new(
            "mag",
            CacheMode::Full,
            TagPolicy {
                tag: tag.map(str::to_string),
                copy_existing,
            },
            Arc::clone(config),
            Arc::new(JsonSerializer),
        )
    }

    fn key(s: &str) -> String {
        s.to_string()
    }

    #[test]
    fn test_put_goes_to_active_tag() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(&config(&dir), Some("run1"), false);
        cache.put("coils", key("a"), 1);

        let sets = cache.all_sets("coils");
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].tag_name(), Some("run1"));

        cache.set_tag(None, false);
        cache.put("coils", key("b"), 2);
        let tags: Vec<Option<String>> = cache
            .all_sets("coils")
            .iter()
            .map(|s| s.tag_name().map(str::to_string))
            .collect();
        assert_eq!(tags, vec![None, Some("run1".to_string())]);
    }

    #[test]
    fn test_get_falls_back_to_other_tags() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(&config(&dir), Some("old"), false);
        cache.put("coils", key("a"), 7);

        cache.set_tag(Some("new".into()), false);
        assert_eq!(cache.get("coils", &key("a")).as_deref(), Some(&7));
        assert!(cache.tagged_set("coils", Some("new")).is_none());
    }

    #[test]
    fn test_copy_existing_warms_active_tag() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(&config(&dir), Some("old"), false);
        cache.put("coils", key("a"), 7);

        cache.set_tag(Some("new".into()), true);
        assert_eq!(cache.get("coils", &key("a")).as_deref(), Some(&7));

        let new_set = cache.tagged_set("coils", Some("new")).unwrap();
        assert_eq!(new_set.get(&key("a")).as_deref(), Some(&7));
    }

    #[test]
    fn test_active_tag_wins_over_others() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(&config(&dir), None, false);
        cache.put("coils", key("a"), 1);
        cache.set_tag(Some("b".into()), false);
        cache.put("coils", key("a"), 2);

        assert_eq!(cache.get("coils", &key("a")).as_deref(), Some(&2));
    }

    #[test]
    fn test_multiple_tags_pick_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(&config(&dir), Some("zeta"), false);
        cache.put("coils", key("a"), 26);
        cache.set_tag(Some("alpha".into()), false);
        cache.put("coils", key("a"), 1);

        // active tag has nothing for this set
        cache.set_tag(Some("none".into()), false);
        for _ in 0..5 {
            assert_eq!(cache.get("coils", &key("a")).as_deref(), Some(&1));
        }
    }

    #[test]
    fn test_mode_gating() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(&config(&dir), None, false);
        cache.put("coils", key("a"), 1);

        cache.set_mode(CacheMode::ReadOnly);
        cache.put("coils", key("b"), 2);
        assert_eq!(cache.get("coils", &key("a")).as_deref(), Some(&1));
        assert!(!cache.delete("coils", &key("a")));

        cache.set_mode(CacheMode::Update);
        assert_eq!(cache.get("coils", &key("a")), None);

        cache.set_mode(CacheMode::Full);
        assert_eq!(cache.get("coils", &key("b")), None);
    }

    #[test]
    fn test_delete_removes_every_tag() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(&config(&dir), Some("x"), false);
        cache.put("coils", key("a"), 1);
        cache.set_tag(Some("y".into()), false);
        cache.put("coils", key("a"), 2);

        assert!(cache.delete("coils", &key("a")));
        assert_eq!(cache.get("coils", &key("a")), None);
        assert!(!cache.delete("coils", &key("a")));
    }

    #[test]
    fn test_scan_finds_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        {
            let writer = cache(&config, Some("run 1"), false);
            writer.put("coil_set", key("a"), 5);
            writer.set_tag(None, false);
            writer.put("other", key("b"), 6);
        }
        std::fs::write(
            naming::cache_dir(&config.root, "mag").join("notes.txt"),
            b"not a cache file",
        )
        .unwrap();

        let reader = cache(&config, None, false);
        assert_eq!(reader.set_names(), vec!["coil_set".to_string(), "other".to_string()]);
        assert_eq!(reader.get("coil_set", &key("a")).as_deref(), Some(&5));
        assert_eq!(reader.scan_for_sets(), 0);
    }

    #[test]
    fn test_get_rescans_for_unknown_sets() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let reader = cache(&config, None, false);
        let writer = cache(&config, None, false);

        writer.put("late", key("a"), 3);
        assert_eq!(reader.get("late", &key("a")).as_deref(), Some(&3));
    }

    #[test]
    fn test_keys_organise_and_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(&config(&dir), Some("t"), false);
        cache.put("coils", key("a"), 1);
        cache.put("coils", key("a"), 2);
        cache.set_tag(None, false);
        cache.put("coils", key("b"), 3);

        let mut keys = cache.get_keys("coils");
        keys.sort();
        assert_eq!(keys, vec![key("a"), key("b")]);

        let report = cache.organise("coils");
        assert_eq!(report.entries_kept, 2);
        assert_eq!(report.entries_removed, 1);

        cache.empty_all_sets("coils");
        assert!(cache.get_keys("coils").is_empty());
        assert_eq!(cache.get("coils", &key("a")), None);
    }

    #[test]
    fn test_tag_warning_budget() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(&config(&dir), Some("p"), false);
        cache.put("coils", key("a"), 1);
        cache.set_tag(Some("q".into()), false);
        cache.put("coils", key("a"), 2);
        cache.set_tag(None, false);

        for _ in 0..4 {
            assert_eq!(cache.get("coils", &key("a")).as_deref(), Some(&1));
        }
        assert!(cache.tag_warnings_suppressed());
    }
}
