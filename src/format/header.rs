//! File Header Codec
//!
//! The first 16 bytes (entry count and UUID) are the only part of the header
//! that ever changes after creation. They are kept memory-mapped by the set
//! engine so other processes' appends and compactions can be spotted without
//! taking the file lock.

use std::io::Read;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Identifier every cache file header starts with, followed by the version
pub const IDENTIFIER: &str = "MinervaRandomAccessCacheVer";

/// Format version written and accepted by this build
pub const FORMAT_VERSION: i32 = 1;

/// Length of the entry count + UUID prefix
pub const FIXED_PREFIX_LEN: u64 = 16;

/// Upper bound on a single header string, to reject garbage quickly
const MAX_HEADER_STRING_LEN: i32 = 64 * 1024;

/// Generate a fresh file UUID
pub fn random_uuid() -> u64 {
    uuid::Uuid::new_v4().as_u64_pair().0
}

/// Encode the 16-byte prefix
pub fn encode_prefix(entry_count: u64, uuid: u64) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[..8].copy_from_slice(&entry_count.to_be_bytes());
    out[8..].copy_from_slice(&uuid.to_be_bytes());
    out
}

/// Decode the 16-byte prefix into `(entry_count, uuid)`
pub fn decode_prefix(bytes: &[u8]) -> (u64, u64) {
    let mut count = [0u8; 8];
    let mut uuid = [0u8; 8];
    count.copy_from_slice(&bytes[..8]);
    uuid.copy_from_slice(&bytes[8..16]);
    (u64::from_be_bytes(count), u64::from_be_bytes(uuid))
}

/// Parsed cache file header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    /// Number of records physically present (live or dead)
    pub entry_count: u64,
    /// Regenerated whenever the file is rewritten
    pub uuid: u64,
    /// Cache type name
    pub cache_name: String,
    /// Primary set name
    pub set_name: String,
    /// Optional tag
    pub tag_name: Option<String>,
}

impl FileHeader {
    /// Create a header for an empty file with a fresh UUID
    pub fn new(cache_name: &str, set_name: &str, tag_name: Option<&str>) -> Self {
        Self {
            entry_count: 0,
            uuid: random_uuid(),
            cache_name: cache_name.to_string(),
            set_name: set_name.to_string(),
            tag_name: tag_name.map(str::to_string),
        }
    }

    /// The identifier string with the version appended
    pub fn id_and_version() -> String {
        format!("{}{}", IDENTIFIER, FORMAT_VERSION)
    }

    /// Encode the complete header, prefix included
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len() as usize);
        buf.put_slice(&encode_prefix(self.entry_count, self.uuid));
        put_string(&mut buf, Some(&Self::id_and_version()));
        put_string(&mut buf, Some(&self.cache_name));
        put_string(&mut buf, Some(&self.set_name));
        put_string(&mut buf, self.tag_name.as_deref());
        buf.freeze()
    }

    /// Length of the encoded header, i.e. the offset of the first record
    pub fn encoded_len(&self) -> u64 {
        let strings = [
            Some(Self::id_and_version().len()),
            Some(self.cache_name.len()),
            Some(self.set_name.len()),
            self.tag_name.as_ref().map(String::len),
        ];
        FIXED_PREFIX_LEN + strings.iter().map(|s| 4 + s.unwrap_or(0) as u64).sum::<u64>()
    }

    /// Decode a header from a byte slice
    ///
    /// Returns the header and the number of bytes it occupies.
    pub fn decode(bytes: &[u8]) -> Result<(Self, u64)> {
        Self::read_from(bytes)
    }

    /// Read a header from the start of a stream
    ///
    /// Returns the header and the number of bytes it occupies.
    pub fn read_from<R: Read>(mut reader: R) -> Result<(Self, u64)> {
        let mut prefix = [0u8; 16];
        reader
            .read_exact(&mut prefix)
            .map_err(|_| Error::Format("file shorter than the 16-byte header prefix".into()))?;
        let (entry_count, uuid) = decode_prefix(&prefix);

        let mut consumed = FIXED_PREFIX_LEN;
        let id = read_string(&mut reader, &mut consumed)?;
        let cache_name = read_string(&mut reader, &mut consumed)?;
        let set_name = read_string(&mut reader, &mut consumed)?;
        let tag_name = read_string(&mut reader, &mut consumed)?;

        check_id_and_version(id.as_deref())?;

        let cache_name =
            cache_name.ok_or_else(|| Error::Format("header has no cache name".into()))?;
        let set_name = set_name.ok_or_else(|| Error::Format("header has no set name".into()))?;

        Ok((
            Self {
                entry_count,
                uuid,
                cache_name,
                set_name,
                tag_name,
            },
            consumed,
        ))
    }
}

fn check_id_and_version(id: Option<&str>) -> Result<()> {
    let id = id.ok_or_else(|| Error::Format("missing identifier string".into()))?;
    let version = id.strip_prefix(IDENTIFIER).ok_or_else(|| {
        Error::Format(format!("identifier '{}' does not start with '{}'", id, IDENTIFIER))
    })?;
    let found: i32 = version
        .parse()
        .map_err(|_| Error::Format(format!("unparseable format version '{}'", version)))?;
    if found != FORMAT_VERSION {
        return Err(Error::VersionMismatch {
            found,
            expected: FORMAT_VERSION,
        });
    }
    Ok(())
}

fn put_string(buf: &mut BytesMut, value: Option<&str>) {
    match value {
        Some(s) => {
            buf.put_i32(s.len() as i32);
            buf.put_slice(s.as_bytes());
        }
        None => buf.put_i32(-1),
    }
}

fn read_string<R: Read>(reader: &mut R, consumed: &mut u64) -> Result<Option<String>> {
    let mut len = [0u8; 4];
    reader
        .read_exact(&mut len)
        .map_err(|_| Error::Format("truncated header string length".into()))?;
    *consumed += 4;

    let len = i32::from_be_bytes(len);
    if len < 0 {
        return Ok(None);
    }
    if len > MAX_HEADER_STRING_LEN {
        return Err(Error::Format(format!("header string length {} is implausible", len)));
    }

    let mut data = vec![0u8; len as usize];
    reader
        .read_exact(&mut data)
        .map_err(|_| Error::Format("truncated header string".into()))?;
    *consumed += len as u64;

    String::from_utf8(data)
        .map(Some)
        .map_err(|_| Error::Format("header string is not valid UTF-8".into()))
}

// =============================================================================
// Tests
// =============================================================================
