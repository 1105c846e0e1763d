//! Random Access Cache
//!
//! Three layers, from the bottom up:
//!
//! - [`RaCacheSet`] - one append-only set file, its hash-chain index and a
//!   byte-budgeted store of decoded keys and objects
//! - [`RaCache`] - every set of one cache type, including tagged variants
//! - [`RaCacheService`] - the registry of cache types under one root
//!
//! Set files are shared between processes. All mutations happen under an
//! exclusive file lock; readers notice other writers through a mapped header
//! prefix (see [`sync`]).

pub mod index;
pub mod mode;
pub mod resident;
pub mod service;
pub mod set;
pub mod stats;
pub mod sync;
pub mod typed;

pub use index::{key_hash, KeyHasher};
pub use mode::CacheMode;
pub use service::RaCacheService;
pub use set::{OrganiseReport, RaCacheSet};
pub use stats::SetStats;
pub use typed::{RaCache, TagPolicy};
