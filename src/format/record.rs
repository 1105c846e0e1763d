//! Record Codec
//!
//! Every record starts with a 13-byte header: one entry code byte followed
//! by the key hash and the two package lengths. The key and object packages
//! follow immediately, in that order. A lone Eof byte terminates the run.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use crate::error::{Error, Result};

/// Size of a record header on disk
pub const RECORD_HEADER_LEN: u64 = 13;

/// Tag byte at the start of every record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EntryCode {
    /// Live record
    Valid = 0x33,
    /// Superseded by a later record for the same key
    Overwritten = 0x34,
    /// Explicitly deleted
    Deleted = 0x35,
    /// End of the record run
    Eof = 0x36,
}

impl EntryCode {
    /// Raw byte value
    #[inline]
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Parse a raw byte, `None` if unrecognized
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x33 => Some(EntryCode::Valid),
            0x34 => Some(EntryCode::Overwritten),
            0x35 => Some(EntryCode::Deleted),
            0x36 => Some(EntryCode::Eof),
            _ => None,
        }
    }

    /// Whether a record with this code has been superseded or deleted
    #[inline]
    pub fn is_dead(self) -> bool {
        matches!(self, EntryCode::Overwritten | EntryCode::Deleted)
    }
}

/// Fixed-size header of a non-Eof record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub code: EntryCode,
    pub key_hash: u32,
    pub key_len: u32,
    pub object_len: u32,
}

impl RecordHeader {
    /// Header for a freshly appended live record
    pub fn valid(key_hash: u32, key_len: u32, object_len: u32) -> Self {
        Self {
            code: EntryCode::Valid,
            key_hash,
            key_len,
            object_len,
        }
    }

    /// Encode as 13 big-endian bytes
    pub fn encode(&self) -> [u8; 13] {
        let mut out = [0u8; 13];
        out[0] = self.code.as_byte();
        out[1..5].copy_from_slice(&self.key_hash.to_be_bytes());
        out[5..9].copy_from_slice(&self.key_len.to_be_bytes());
        out[9..13].copy_from_slice(&self.object_len.to_be_bytes());
        out
    }

    /// Decode a record header read at `offset`
    pub fn decode(offset: u64, bytes: &[u8]) -> Result<Self> {
        let first = *bytes
            .first()
            .ok_or_else(|| Error::corrupt(offset, "empty record header"))?;
        let code = EntryCode::from_byte(first)
            .ok_or_else(|| Error::corrupt(offset, format!("unrecognized entry code {:#04x}", first)))?;
        if code == EntryCode::Eof {
            return Err(Error::corrupt(offset, "Eof marker has no record header"));
        }
        if bytes.len() < RECORD_HEADER_LEN as usize {
            return Err(Error::corrupt(
                offset,
                format!("truncated record header ({} of 13 bytes)", bytes.len()),
            ));
        }

        let word = |i: usize| u32::from_be_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        Ok(Self {
            code,
            key_hash: word(1),
            key_len: word(5),
            object_len: word(9),
        })
    }

    /// Total bytes occupied by this record, header included
    #[inline]
    pub fn record_len(&self) -> u64 {
        RECORD_HEADER_LEN + self.key_len as u64 + self.object_len as u64
    }

    /// Offset of the key package for a record starting at `offset`
    #[inline]
    pub fn key_offset(offset: u64) -> u64 {
        offset + RECORD_HEADER_LEN
    }
}

/// What sits at a given record offset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordSlot {
    /// A complete record
    Record(RecordHeader),
    /// The Eof marker
    Eof,
    /// Physical end of the file with no Eof marker
    EndOfFile,
}

/// Inspect the record starting at `offset`
///
/// Stops with `CorruptRecord` on an unrecognized code, a truncated header,
/// or packages running past `file_len`, rather than guessing forward.
pub fn read_slot(file: &File, offset: u64, file_len: u64) -> Result<RecordSlot> {
    let mut buf = [0u8; RECORD_HEADER_LEN as usize];
    let n = read_at(file, offset, &mut buf)?;
    if n == 0 {
        return Ok(RecordSlot::EndOfFile);
    }
    if buf[0] == EntryCode::Eof.as_byte() {
        return Ok(RecordSlot::Eof);
    }

    let header = RecordHeader::decode(offset, &buf[..n])?;
    if offset + header.record_len() > file_len {
        return Err(Error::corrupt(
            offset,
            format!(
                "record of {} bytes runs past end of file at {}",
                header.record_len(),
                file_len
            ),
        ));
    }
    Ok(RecordSlot::Record(header))
}

/// Overwrite the entry code byte of the record at `offset`
pub fn write_entry_code(file: &File, offset: u64, code: EntryCode) -> Result<()> {
    write_at(file, offset, &[code.as_byte()])
}

/// Write an Eof marker at `offset`
pub fn write_eof(file: &File, offset: u64) -> Result<()> {
    write_entry_code(file, offset, EntryCode::Eof)
}

/// Read into `buf` starting at `offset`, returning the bytes actually read
///
/// Short only at end of file.
pub fn read_at(file: &File, offset: u64, buf: &mut [u8]) -> Result<usize> {
    let mut handle = file;
    handle.seek(SeekFrom::Start(offset))?;
    let mut filled = 0;
    while filled < buf.len() {
        match handle.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

/// Write all of `data` at `offset`
pub fn write_at(file: &File, offset: u64, data: &[u8]) -> Result<()> {
    let mut handle = file;
    handle.seek(SeekFrom::Start(offset))?;
    handle.write_all(data)?;
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
