//! Settings and Cache Configuration
//!
//! The cache reads its tunables through a [`SettingsProvider`], a plain
//! key/value lookup. [`FileSettings`] loads a flat YAML mapping and lets
//! environment variables override any key; [`MapSettings`] is an in-memory
//! provider for tests and embedding applications.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Root directory of all cache types
pub const KEY_CACHE_PATH: &str = "minerva.cache.path";
/// Lock wait before a diagnostic is logged, in milliseconds
pub const KEY_ATTENTION_SPAN: &str = "minerva.user.attentionSpanMilisecs";
/// Interval between periodic statistics dumps, in milliseconds (0 = off)
pub const KEY_STATS_INTERVAL: &str = "minerva.cache.regularStatsInterval";
/// Fraction of objects lost from memory before warning
pub const KEY_MAX_LOSS_RATE: &str = "minerva.cache.maxMemLossRateBeforeWarning";
/// Number of multiple-tag warnings before they are suppressed
pub const KEY_MAX_TAG_WARNINGS: &str = "minerva.cache.maximumMultipleTagWarnings";
/// Per-set budget for decoded keys and objects kept in memory, in bytes
pub const KEY_RESIDENT_BYTES: &str = "minerva.cache.residentBytes";

// =============================================================================
// Settings Providers
// =============================================================================

/// Key/value settings lookup
pub trait SettingsProvider: Send + Sync {
    /// Value of `key`, or `default` when unset
    fn get_string(&self, key: &str, default: &str) -> String;

    /// Value of `key` as a directory path, created if missing
    fn get_path(&self, key: &str, default: &Path) -> Result<PathBuf> {
        let path = PathBuf::from(self.get_string(key, &default.to_string_lossy()));
        std::fs::create_dir_all(&path)?;
        Ok(path)
    }
}

/// In-memory settings
#[derive(Debug, Clone, Default)]
pub struct MapSettings {
    values: HashMap<String, String>,
}

impl MapSettings {
    /// Create empty settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style setter
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    /// Set a value
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }
}

impl SettingsProvider for MapSettings {
    fn get_string(&self, key: &str, default: &str) -> String {
        self.values
            .get(key)
            .cloned()
            .unwrap_or_else(|| default.to_string())
    }
}

/// Environment variable that overrides a settings key
///
/// `minerva.cache.path` becomes `MINERVA_CACHE_PATH`.
pub fn env_var_name(key: &str) -> String {
    key.to_uppercase().replace('.', "_")
}

/// Settings loaded from a flat YAML file, overridable from the environment
#[derive(Debug, Clone, Default)]
pub struct FileSettings {
    path: Option<PathBuf>,
    values: HashMap<String, String>,
}

impl FileSettings {
    /// Load settings from `path`; a missing file yields empty settings
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            debug!(file = %path.display(), "Settings file not found, using defaults");
            return Ok(Self {
                path: Some(path.to_path_buf()),
                values: HashMap::new(),
            });
        }

        let text = std::fs::read_to_string(path)?;
        let values = parse_flat_yaml(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        debug!(file = %path.display(), entries = values.len(), "Loaded settings");

        Ok(Self {
            path: Some(path.to_path_buf()),
            values,
        })
    }

    /// Find and load the settings file for application `base`
    ///
    /// Looks at `<BASE>_SETTINGS_FILE`, then `$HOME/<base>-settings`, then
    /// `$HOME/.<base>/<base>-settings`, then the temp directory.
    pub fn discover(base: &str) -> Result<Self> {
        Self::load(Self::settings_file_name(base))
    }

    /// Path [`FileSettings::discover`] would load
    pub fn settings_file_name(base: &str) -> PathBuf {
        let file_name = format!("{}-settings", base);

        if let Ok(explicit) = std::env::var(format!("{}_SETTINGS_FILE", base.to_uppercase())) {
            let explicit = PathBuf::from(explicit);
            if explicit.is_file() {
                return explicit;
            }
            debug!(file = %explicit.display(), "Explicit settings file unreadable, looking elsewhere");
        }

        let home = std::env::var_os("HOME").or_else(|| std::env::var_os("USERPROFILE"));
        if let Some(home) = home {
            let home = PathBuf::from(home);
            let direct = home.join(&file_name);
            if direct.is_file() {
                return direct;
            }
            let nested = home.join(format!(".{}", base)).join(&file_name);
            if nested.is_file() {
                return nested;
            }
            return direct;
        }

        std::env::temp_dir().join(file_name)
    }

    /// File these settings were loaded from
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl SettingsProvider for FileSettings {
    fn get_string(&self, key: &str, default: &str) -> String {
        if let Ok(value) = std::env::var(env_var_name(key)) {
            return value;
        }
        self.values
            .get(key)
            .cloned()
            .unwrap_or_else(|| default.to_string())
    }
}

fn parse_flat_yaml(text: &str) -> std::result::Result<HashMap<String, String>, String> {
    let doc: serde_yaml::Value = serde_yaml::from_str(text).map_err(|e| e.to_string())?;
    let mapping = match doc {
        serde_yaml::Value::Null => return Ok(HashMap::new()),
        serde_yaml::Value::Mapping(m) => m,
        _ => return Err("settings file must be a mapping".into()),
    };

    let mut values = HashMap::with_capacity(mapping.len());
    for (key, value) in mapping {
        let key = scalar_to_string(key).ok_or("settings keys must be scalars")?;
        let value = scalar_to_string(value)
            .ok_or_else(|| format!("setting '{}' must be a scalar value", key))?;
        values.insert(key, value);
    }
    Ok(values)
}

fn scalar_to_string(value: serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

// =============================================================================
// Cache Configuration
// =============================================================================

/// Typed cache tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Root directory holding one sub-directory per cache type
    pub root: PathBuf,
    /// Lock wait after which a diagnostic is logged (the wait continues)
    pub attention_span: Duration,
    /// Interval between periodic statistics dumps, `None` to disable
    pub stats_interval: Option<Duration>,
    /// Object loss rate above which a memory warning is logged
    pub max_object_loss_rate: f64,
    /// Minimum time between two memory warnings
    pub loss_warning_interval: Duration,
    /// Multiple-tag warnings logged before further ones are suppressed
    pub max_multiple_tag_warnings: u32,
    /// Per-set budget for resident keys and objects, in package bytes
    pub resident_bytes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            attention_span: Duration::from_millis(5000),
            stats_interval: Some(Duration::from_millis(240_000)),
            max_object_loss_rate: 0.80,
            loss_warning_interval: Duration::from_secs(5),
            max_multiple_tag_warnings: 10,
            resident_bytes: 256 * 1024 * 1024,
        }
    }
}

/// Default cache root under the platform temp directory
pub fn default_root() -> PathBuf {
    std::env::temp_dir().join("minerva").join("cache")
}

impl CacheConfig {
    /// Default configuration rooted at `root`
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Default::default()
        }
    }

    /// Build from a settings provider, creating the root directory
    pub fn from_settings(settings: &dyn SettingsProvider) -> Result<Self> {
        let defaults = Self::default();

        let root = settings.get_path(KEY_CACHE_PATH, &defaults.root)?;
        let attention_ms: u64 = parse_setting(settings, KEY_ATTENTION_SPAN, "5000")?;
        let stats_ms: u64 = parse_setting(settings, KEY_STATS_INTERVAL, "240000")?;
        let max_object_loss_rate: f64 = parse_setting(settings, KEY_MAX_LOSS_RATE, "0.80")?;
        let max_multiple_tag_warnings: u32 = parse_setting(settings, KEY_MAX_TAG_WARNINGS, "10")?;
        let resident_bytes: u64 =
            parse_setting(settings, KEY_RESIDENT_BYTES, &defaults.resident_bytes.to_string())?;

        Ok(Self {
            root,
            attention_span: Duration::from_millis(attention_ms),
            stats_interval: (stats_ms > 0).then(|| Duration::from_millis(stats_ms)),
            max_object_loss_rate,
            loss_warning_interval: defaults.loss_warning_interval,
            max_multiple_tag_warnings,
            resident_bytes,
        })
    }
}

fn parse_setting<T: std::str::FromStr>(
    settings: &dyn SettingsProvider,
    key: &str,
    default: &str,
) -> Result<T> {
    let raw = settings.get_string(key, default);
    raw.trim()
        .parse()
        .map_err(|_| Error::Config(format!("invalid value '{}' for setting '{}'", raw, key)))
}
