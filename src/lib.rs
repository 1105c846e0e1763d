//! racache - Random Access Object Cache
//!
//! A disk-backed key/value cache shared by every process on a host. Each
//! cache set lives in one append-only file; processes coordinate through an
//! advisory file lock and a memory-mapped header, and each keeps its own
//! lazily loaded index of the file.
//!
//! # Architecture
//!
//! ```text
//! RaCacheService ──▶ RaCache (per type) ──▶ RaCacheSet (per set and tag)
//!                                                │
//!                                   HashIndex + ResidentStore + SharedFile
//! ```
//!
//! # Modules
//!
//! - [`cache`] - Set, type and service engines
//! - [`config`] - Settings providers and typed configuration
//! - [`error`] - Error types
//! - [`format`] - On-disk header and record codecs
//! - [`metrics`] - Prometheus exposition of set statistics
//! - [`naming`] - Set file naming
//! - [`serializer`] - Key and object serializers

pub mod cache;
pub mod config;
pub mod error;
pub mod format;
pub mod metrics;
pub mod naming;
pub mod serializer;

// Re-export commonly used types
pub use cache::{CacheMode, OrganiseReport, RaCache, RaCacheService, RaCacheSet, SetStats, TagPolicy};
pub use config::{CacheConfig, FileSettings, MapSettings, SettingsProvider};
pub use error::{Error, Result};
pub use metrics::StatsExporter;
pub use serializer::{JsonSerializer, Lz4Serializer, Serializer};
