//! EntityDB Binary Format (EBF).
//!
//! Byte layout of the main file: a fixed 128-byte header, the entity record
//! block, the tag dictionary and the entity index section. All multi-byte
//! integers are little-endian; strings are UTF-8 and length-prefixed.
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -----
//! 0       8     magic "ENTITYDB"
//! 8       4     version
//! 12      4     flags
//! 16      8     file_size
//! 24      8     data_offset
//! 32      8     data_size
//! 40      8     tag_dict_offset
//! 48      8     tag_dict_size
//! 56      8     entity_index_offset
//! 64      8     entity_index_size
//! 72      8     wal_offset
//! 80      8     entity_count (derived from the index at persistence time)
//! 88      8     last_modified (unix seconds)
//! 96      8     wal_sequence (next sequence to hand out)
//! 104     16    reserved (zeros)
//! 120     8     header_checksum (xxh3 of bytes 0..120)
//! ```

use std::io::{Read, Write};

use thiserror::Error;
use xxhash_rust::xxh3::xxh3_64;

use entitydb_core::StoreError;

mod entity;
mod index;
mod tag_dict;

pub use entity::{
    decode_entity, decode_entity_view, decode_wal_entity, encode_entity, encode_wal_entity,
    EntityView, TagView, MAX_ENTITY_BYTES,
};
pub use index::{decode_index, encode_index, IndexEntry};
pub use tag_dict::TagDict;

pub const MAGIC: [u8; 8] = *b"ENTITYDB";
pub const WAL_MAGIC: [u8; 8] = *b"ENTYWAL\0";
pub const FORMAT_VERSION: u32 = 1;
pub const HEADER_SIZE: u64 = 128;

/// Offsets beyond this are treated as corruption wherever they would be used
/// to address into a file.
pub const MAX_OFFSET: u64 = 1 << 31;

#[derive(Debug, Error)]
pub enum FormatError {
    #[error("bad magic")]
    BadMagic,

    #[error("unrecognized format version {0}")]
    UnknownVersion(u32),

    #[error("truncated input: needed {needed} bytes, had {available}")]
    Truncated { needed: usize, available: usize },

    #[error("header checksum mismatch: stored {stored:#x}, computed {computed:#x}")]
    ChecksumMismatch { stored: u64, computed: u64 },

    #[error("field {field} holds offset {value} outside file of {file_size} bytes")]
    OffsetOutOfBounds {
        field: &'static str,
        value: u64,
        file_size: u64,
    },

    #[error("entity exceeds encoded size limit")]
    EntityTooLarge,

    #[error("invalid utf-8 in stored string")]
    BadUtf8,

    #[error("unknown tag id {0}")]
    UnknownTagId(u32),

    #[error("legacy tag form in dictionary: {0}")]
    LegacyTag(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<FormatError> for StoreError {
    fn from(value: FormatError) -> Self {
        match value {
            FormatError::EntityTooLarge => StoreError::EntityTooLarge,
            FormatError::Io(e) => StoreError::Io(e),
            other => StoreError::Corrupt(other.to_string()),
        }
    }
}

/// In-memory image of the on-disk header. Owned by `HeaderSync` at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub magic: [u8; 8],
    pub version: u32,
    pub flags: u32,
    pub file_size: u64,
    pub data_offset: u64,
    pub data_size: u64,
    pub tag_dict_offset: u64,
    pub tag_dict_size: u64,
    pub entity_index_offset: u64,
    pub entity_index_size: u64,
    pub wal_offset: u64,
    pub entity_count: u64,
    pub last_modified: u64,
    pub wal_sequence: u64,
    pub header_checksum: u64,
}

impl Default for Header {
    fn default() -> Self {
        Self::empty()
    }
}

impl Header {
    /// Header of a freshly initialized file with no sections yet.
    pub fn empty() -> Self {
        let mut header = Self {
            magic: MAGIC,
            version: FORMAT_VERSION,
            flags: 0,
            file_size: HEADER_SIZE,
            data_offset: HEADER_SIZE,
            data_size: 0,
            tag_dict_offset: 0,
            tag_dict_size: 0,
            entity_index_offset: 0,
            entity_index_size: 0,
            wal_offset: HEADER_SIZE,
            entity_count: 0,
            last_modified: 0,
            wal_sequence: 0,
            header_checksum: 0,
        };

        header.header_checksum = header.compute_checksum();
        header
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE as usize] {
        let mut buf = [0u8; HEADER_SIZE as usize];

        buf[0..8].copy_from_slice(&self.magic);
        buf[8..12].copy_from_slice(&self.version.to_le_bytes());
        buf[12..16].copy_from_slice(&self.flags.to_le_bytes());
        buf[16..24].copy_from_slice(&self.file_size.to_le_bytes());
        buf[24..32].copy_from_slice(&self.data_offset.to_le_bytes());
        buf[32..40].copy_from_slice(&self.data_size.to_le_bytes());
        buf[40..48].copy_from_slice(&self.tag_dict_offset.to_le_bytes());
        buf[48..56].copy_from_slice(&self.tag_dict_size.to_le_bytes());
        buf[56..64].copy_from_slice(&self.entity_index_offset.to_le_bytes());
        buf[64..72].copy_from_slice(&self.entity_index_size.to_le_bytes());
        buf[72..80].copy_from_slice(&self.wal_offset.to_le_bytes());
        buf[80..88].copy_from_slice(&self.entity_count.to_le_bytes());
        buf[88..96].copy_from_slice(&self.last_modified.to_le_bytes());
        buf[96..104].copy_from_slice(&self.wal_sequence.to_le_bytes());
        buf[120..128].copy_from_slice(&self.header_checksum.to_le_bytes());

        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, FormatError> {
        if buf.len() < HEADER_SIZE as usize {
            return Err(FormatError::Truncated {
                needed: HEADER_SIZE as usize,
                available: buf.len(),
            });
        }

        let mut magic = [0u8; 8];
        magic.copy_from_slice(&buf[0..8]);

        if magic != MAGIC {
            return Err(FormatError::BadMagic);
        }

        let version = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        if version != FORMAT_VERSION {
            return Err(FormatError::UnknownVersion(version));
        }

        let header = Self {
            magic,
            version,
            flags: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
            file_size: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
            data_offset: u64::from_le_bytes(buf[24..32].try_into().unwrap()),
            data_size: u64::from_le_bytes(buf[32..40].try_into().unwrap()),
            tag_dict_offset: u64::from_le_bytes(buf[40..48].try_into().unwrap()),
            tag_dict_size: u64::from_le_bytes(buf[48..56].try_into().unwrap()),
            entity_index_offset: u64::from_le_bytes(buf[56..64].try_into().unwrap()),
            entity_index_size: u64::from_le_bytes(buf[64..72].try_into().unwrap()),
            wal_offset: u64::from_le_bytes(buf[72..80].try_into().unwrap()),
            entity_count: u64::from_le_bytes(buf[80..88].try_into().unwrap()),
            last_modified: u64::from_le_bytes(buf[88..96].try_into().unwrap()),
            wal_sequence: u64::from_le_bytes(buf[96..104].try_into().unwrap()),
            header_checksum: u64::from_le_bytes(buf[120..128].try_into().unwrap()),
        };

        let computed = header.compute_checksum();
        if computed != header.header_checksum {
            return Err(FormatError::ChecksumMismatch {
                stored: header.header_checksum,
                computed,
            });
        }

        Ok(header)
    }

    pub fn compute_checksum(&self) -> u64 {
        let encoded = {
            let mut scratch = *self;
            scratch.header_checksum = 0;
            scratch.encode()
        };

        xxh3_64(&encoded[..120])
    }

    pub fn seal(&mut self) {
        self.header_checksum = self.compute_checksum();
    }

    /// Full validation as applied by HeaderSync on every update.
    ///
    /// `wal_offset = 0` is rejected here; the open path repairs that value
    /// before the header ever reaches HeaderSync.
    pub fn validate(&self) -> Result<(), FormatError> {
        if self.magic != MAGIC {
            return Err(FormatError::BadMagic);
        }

        if self.version != FORMAT_VERSION {
            return Err(FormatError::UnknownVersion(self.version));
        }

        if self.wal_offset < HEADER_SIZE || self.wal_offset > self.file_size {
            return Err(FormatError::OffsetOutOfBounds {
                field: "wal_offset",
                value: self.wal_offset,
                file_size: self.file_size,
            });
        }

        if self.data_offset < HEADER_SIZE {
            return Err(FormatError::OffsetOutOfBounds {
                field: "data_offset",
                value: self.data_offset,
                file_size: self.file_size,
            });
        }

        if self.data_offset.saturating_add(self.data_size) > self.file_size {
            return Err(FormatError::OffsetOutOfBounds {
                field: "data_size",
                value: self.data_offset.saturating_add(self.data_size),
                file_size: self.file_size,
            });
        }

        for (field, offset, size) in [
            ("tag_dict_offset", self.tag_dict_offset, self.tag_dict_size),
            (
                "entity_index_offset",
                self.entity_index_offset,
                self.entity_index_size,
            ),
        ] {
            if offset == 0 {
                continue;
            }

            if offset < HEADER_SIZE
                || offset > MAX_OFFSET
                || offset.saturating_add(size) > self.file_size
            {
                return Err(FormatError::OffsetOutOfBounds {
                    field,
                    value: offset,
                    file_size: self.file_size,
                });
            }
        }

        let computed = self.compute_checksum();
        if computed != self.header_checksum {
            return Err(FormatError::ChecksumMismatch {
                stored: self.header_checksum,
                computed,
            });
        }

        Ok(())
    }
}

/// Writes exactly `HEADER_SIZE` bytes.
pub fn write_header(w: &mut impl Write, header: &Header) -> Result<(), FormatError> {
    w.write_all(&header.encode())?;
    Ok(())
}

/// Reads and structurally validates a header.
///
/// Stored offsets are checked against `file_size`; `wal_offset = 0` is let
/// through because the caller repairs it to `HEADER_SIZE` on first open.
pub fn read_header(r: &mut impl Read, file_size: u64) -> Result<Header, FormatError> {
    let mut buf = [0u8; HEADER_SIZE as usize];
    r.read_exact(&mut buf)?;

    let header = Header::decode(&buf)?;

    for (field, offset) in [
        ("data_offset", header.data_offset),
        ("tag_dict_offset", header.tag_dict_offset),
        ("entity_index_offset", header.entity_index_offset),
    ] {
        if offset == 0 && field != "data_offset" {
            continue;
        }

        if offset < HEADER_SIZE || offset > file_size || offset > MAX_OFFSET {
            return Err(FormatError::OffsetOutOfBounds {
                field,
                value: offset,
                file_size,
            });
        }
    }

    if header.wal_offset != 0 && (header.wal_offset < HEADER_SIZE || header.wal_offset > file_size)
    {
        return Err(FormatError::OffsetOutOfBounds {
            field: "wal_offset",
            value: header.wal_offset,
            file_size,
        });
    }

    Ok(header)
}

/// Bounds-checked little-endian reader over a byte slice.
pub(crate) struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn take(&mut self, len: usize) -> Result<&'a [u8], FormatError> {
        if self.remaining() < len {
            return Err(FormatError::Truncated {
                needed: len,
                available: self.remaining(),
            });
        }

        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    pub fn take_u8(&mut self) -> Result<u8, FormatError> {
        Ok(self.take(1)?[0])
    }

    pub fn take_u16(&mut self) -> Result<u16, FormatError> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn take_u32(&mut self) -> Result<u32, FormatError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn take_u64(&mut self) -> Result<u64, FormatError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn take_str(&mut self, len: usize) -> Result<&'a str, FormatError> {
        std::str::from_utf8(self.take(len)?).map_err(|_| FormatError::BadUtf8)
    }
}
