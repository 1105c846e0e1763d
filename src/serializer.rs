//! Package Serialization
//!
//! The cache stores keys and objects as opaque byte packages. How a value
//! becomes a package is up to the [`Serializer`] a cache is built with.
//!
//! # Example
//!
//! ```
//! use racache::serializer::{JsonSerializer, Lz4Serializer, Serializer};
//!
//! let codec = Lz4Serializer::new(JsonSerializer);
//! let samples = vec![0.5f64; 1000];
//!
//! let package = codec.serialize(&samples).unwrap();
//! let back: Vec<f64> = codec.deserialize(&package).unwrap();
//! assert_eq!(back, samples);
//! ```

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

/// Turns values into byte packages and back
pub trait Serializer: Send + Sync {
    /// Serialize a value into a package
    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>>;

    /// Rebuild a value from a package
    fn deserialize<T: DeserializeOwned>(&self, package: &[u8]) -> Result<T>;
}

/// JSON packages via serde_json
///
/// Keys must serialize deterministically (no hash maps with unordered
/// iteration), because the key hash is taken over the package bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn deserialize<T: DeserializeOwned>(&self, package: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(package)?)
    }
}

/// Wraps another serializer with LZ4 block compression
#[derive(Debug, Clone, Default)]
pub struct Lz4Serializer<S> {
    inner: S,
}

impl<S> Lz4Serializer<S> {
    /// Compress the packages produced by `inner`
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    /// The wrapped serializer
    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: Serializer> Serializer for Lz4Serializer<S> {
    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        let raw = self.inner.serialize(value)?;
        lz4::block::compress(&raw, Some(lz4::block::CompressionMode::DEFAULT), true).map_err(|e| {
            Error::CompressionFailed {
                algorithm: "LZ4".into(),
                reason: e.to_string(),
            }
        })
    }

    fn deserialize<T: DeserializeOwned>(&self, package: &[u8]) -> Result<T> {
        let raw = lz4::block::decompress(package, None).map_err(|e| Error::DecompressionFailed {
            algorithm: "LZ4".into(),
            reason: e.to_string(),
        })?;
        self.inner.deserialize(&raw)
    }
}
