//! Cache Modes
//!
//! A mode gates reads and writes before any set is consulted.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Caching mode of a cache type or of the whole service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheMode {
    /// Offline: every read misses and nothing is written
    Off,
    /// Hits are served but new items are not written
    ReadOnly,
    /// Every read misses; recomputed items overwrite the stored ones
    Update,
    /// Hits are served and new items are written
    #[default]
    Full,
}

impl CacheMode {
    /// Whether reads may be served in this mode
    #[inline]
    pub fn allows_read(self) -> bool {
        matches!(self, CacheMode::ReadOnly | CacheMode::Full)
    }

    /// Whether writes are accepted in this mode
    #[inline]
    pub fn allows_write(self) -> bool {
        matches!(self, CacheMode::Update | CacheMode::Full)
    }

    /// Name used in settings and on the command line
    pub fn name(self) -> &'static str {
        match self {
            CacheMode::Off => "off",
            CacheMode::ReadOnly => "read-only",
            CacheMode::Update => "update",
            CacheMode::Full => "full",
        }
    }
}

impl fmt::Display for CacheMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for CacheMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "off" => Ok(CacheMode::Off),
            "read-only" | "readonly" => Ok(CacheMode::ReadOnly),
            "update" => Ok(CacheMode::Update),
            "full" => Ok(CacheMode::Full),
            other => Err(Error::Config(format!("unknown cache mode '{}'", other))),
        }
    }
}
