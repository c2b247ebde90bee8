use entitydb_core::{EntityId, MAX_ID_LEN};

use super::{Cursor, FormatError, MAX_OFFSET};

/// One row of the entity index section: where an entity record lives inside
/// the data block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub id: EntityId,
    pub offset: u64,
    pub len: u32,
}

/// `count(u64) | { id_len(u16) | id | offset(u64) | len(u32) }*`
pub fn encode_index(entries: &[IndexEntry], out: &mut Vec<u8>) {
    out.extend_from_slice(&(entries.len() as u64).to_le_bytes());

    for entry in entries {
        out.extend_from_slice(&(entry.id.len() as u16).to_le_bytes());
        out.extend_from_slice(entry.id.as_bytes());
        out.extend_from_slice(&entry.offset.to_le_bytes());
        out.extend_from_slice(&entry.len.to_le_bytes());
    }
}

pub fn decode_index(buf: &[u8]) -> Result<Vec<IndexEntry>, FormatError> {
    let mut cursor = Cursor::new(buf);
    let count = cursor.take_u64()? as usize;

    let mut entries = Vec::with_capacity(count.min(1 << 20));

    for _ in 0..count {
        let id_len = cursor.take_u16()? as usize;
        if id_len == 0 || id_len > MAX_ID_LEN {
            return Err(FormatError::Corrupt(format!(
                "bad id length {id_len} in index"
            )));
        }

        let id = cursor.take_str(id_len)?.to_string();
        let offset = cursor.take_u64()?;
        let len = cursor.take_u32()?;

        if offset > MAX_OFFSET {
            return Err(FormatError::OffsetOutOfBounds {
                field: "index entry offset",
                value: offset,
                file_size: MAX_OFFSET,
            });
        }

        entries.push(IndexEntry { id, offset, len });
    }

    if !cursor.is_empty() {
        return Err(FormatError::Corrupt(format!(
            "{} trailing bytes after index section",
            cursor.remaining()
        )));
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_round_trips() {
        let entries = vec![
            IndexEntry {
                id: "e1".into(),
                offset: 128,
                len: 64,
            },
            IndexEntry {
                id: "e2".into(),
                offset: 192,
                len: 1024,
            },
        ];

        let mut buf = Vec::new();
        encode_index(&entries, &mut buf);

        assert_eq!(decode_index(&buf).unwrap(), entries);
    }

    #[test]
    fn empty_index_round_trips() {
        let mut buf = Vec::new();
        encode_index(&[], &mut buf);
        assert!(decode_index(&buf).unwrap().is_empty());
    }

    #[test]
    fn giant_offsets_are_corruption() {
        let entries = vec![IndexEntry {
            id: "e1".into(),
            offset: MAX_OFFSET + 1,
            len: 1,
        }];

        let mut buf = Vec::new();
        encode_index(&entries, &mut buf);

        assert!(matches!(
            decode_index(&buf),
            Err(FormatError::OffsetOutOfBounds { .. })
        ));
    }
}
