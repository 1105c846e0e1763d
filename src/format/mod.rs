//! On-disk Cache File Format
//!
//! A cache file is a fixed 16-byte prefix, a variable header section, and
//! an append-only run of records terminated by a single Eof byte.
//!
//! ```text
//! offset 0  : u64 entry_count
//! offset 8  : u64 uuid
//! offset 16 : string id_and_version   (i32 length prefix, -1 = absent)
//!             string cache_name
//!             string set_name
//!             string tag_name
//! ---- records ----
//! u8  entry_code  (0x33 Valid, 0x34 Overwritten, 0x35 Deleted, 0x36 Eof)
//! u32 key_hash
//! u32 key_package_len
//! u32 object_package_len
//! <key package> <object package>
//! ```
//!
//! All fixed-width integers are big-endian (network order), which keeps
//! files interchangeable with caches written by the legacy implementation.

mod header;
mod record;

#[cfg(test)]
mod proptest;

pub use header::{
    decode_prefix, encode_prefix, random_uuid, FileHeader, FIXED_PREFIX_LEN, FORMAT_VERSION,
    IDENTIFIER,
};
pub use record::{
    read_at, read_slot, write_at, write_entry_code, write_eof, EntryCode, RecordHeader, RecordSlot,
    RECORD_HEADER_LEN,
};
