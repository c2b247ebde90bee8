//! Memory-mapped, read-only access to the main file.
//!
//! A `Reader` corresponds to one published generation of `entities.ebf`.
//! Open validates every header offset against the mapped length before any
//! section is touched; a file that lies about its own geometry never gets
//! decoded. Checkpoints publish a new generation and readers remap on their
//! next call.

use std::{collections::HashMap, fs::File, path::Path};

use memmap2::Mmap;
use tracing::debug;

use entitydb_core::{Entity, EntityId, LegacyTagMode, StoreError};

use crate::format::{
    decode_entity_view, decode_index, EntityView, FormatError, Header, TagDict, HEADER_SIZE,
    MAX_OFFSET,
};

pub struct Reader {
    mmap: Mmap,
    header: Header,
    dict: TagDict,
    offsets: HashMap<EntityId, (u64, u32)>,
    generation: u64,
}

impl Reader {
    pub fn open(
        path: impl AsRef<Path>,
        mode: LegacyTagMode,
        generation: u64,
    ) -> Result<Self, StoreError> {
        let file = File::open(path.as_ref())?;
        let len = file.metadata()?.len();

        if len < HEADER_SIZE {
            return Err(FormatError::Truncated {
                needed: HEADER_SIZE as usize,
                available: len as usize,
            }
            .into());
        }

        // Safety: the writer only replaces this file atomically (tmp +
        // rename); the mapping is never mutated in place.
        let mmap = unsafe { Mmap::map(&file)? };

        let header = Header::decode(&mmap[..HEADER_SIZE as usize]).map_err(StoreError::from)?;

        for (field, offset, size) in [
            ("data_offset", header.data_offset, header.data_size),
            (
                "tag_dict_offset",
                header.tag_dict_offset,
                header.tag_dict_size,
            ),
            (
                "entity_index_offset",
                header.entity_index_offset,
                header.entity_index_size,
            ),
        ] {
            if offset == 0 && field != "data_offset" {
                continue;
            }

            if offset > MAX_OFFSET || offset.saturating_add(size) > len {
                return Err(FormatError::OffsetOutOfBounds {
                    field,
                    value: offset,
                    file_size: len,
                }
                .into());
            }
        }

        let dict = if header.tag_dict_offset != 0 {
            let start = header.tag_dict_offset as usize;
            let end = start + header.tag_dict_size as usize;
            TagDict::decode(&mmap[start..end], mode).map_err(StoreError::from)?
        } else {
            TagDict::new()
        };

        let offsets = if header.entity_index_offset != 0 {
            let start = header.entity_index_offset as usize;
            let end = start + header.entity_index_size as usize;
            let entries = decode_index(&mmap[start..end]).map_err(StoreError::from)?;

            let mut map = HashMap::with_capacity(entries.len());
            for entry in entries {
                let end = header
                    .data_offset
                    .saturating_add(entry.offset)
                    .saturating_add(entry.len as u64);

                if end > header.data_offset + header.data_size {
                    return Err(StoreError::Corrupt(format!(
                        "index entry for {} points past the data block",
                        entry.id
                    )));
                }

                map.insert(entry.id, (entry.offset, entry.len));
            }
            map
        } else {
            HashMap::new()
        };

        debug!(
            generation,
            entities = offsets.len(),
            dict = dict.len(),
            "mapped main file"
        );

        Ok(Self {
            mmap,
            header,
            dict,
            offsets,
            generation,
        })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn dict(&self) -> &TagDict {
        &self.dict
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.offsets.contains_key(id)
    }

    fn record_slice(&self, offset: u64, len: u32) -> &[u8] {
        let start = (self.header.data_offset + offset) as usize;
        &self.mmap[start..start + len as usize]
    }

    /// Borrowed view of one record: tag bodies reference the dictionary,
    /// content references the mapping. No bytes are copied.
    pub fn get_entity_view(&self, id: &str) -> Result<Option<EntityView<'_>>, StoreError> {
        let Some((offset, len)) = self.offsets.get(id) else {
            return Ok(None);
        };

        let view = decode_entity_view(self.record_slice(*offset, *len), &self.dict)
            .map_err(StoreError::from)?;

        if view.id != id {
            return Err(StoreError::Corrupt(format!(
                "index entry for {id} decoded as {}",
                view.id
            )));
        }

        Ok(Some(view))
    }

    /// Owned copy of one record; see [`Reader::get_entity_view`] for the
    /// borrowed form.
    pub fn get_entity(&self, id: &str) -> Result<Option<Entity>, StoreError> {
        Ok(self.get_entity_view(id)?.map(|view| view.to_entity()))
    }

    /// Decodes every entity in the file, in index order.
    pub fn entities(&self) -> impl Iterator<Item = Result<Entity, StoreError>> + '_ {
        self.offsets.iter().map(move |(id, (offset, len))| {
            let view = decode_entity_view(self.record_slice(*offset, *len), &self.dict)
                .map_err(StoreError::from)?;

            if view.id != *id {
                return Err(StoreError::Corrupt(format!(
                    "index entry for {id} decoded as {}",
                    view.id
                )));
            }

            Ok(view.to_entity())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{encode_entity, encode_index, write_header, IndexEntry};
    use entitydb_core::Tag;
    use std::io::Write as _;

    /// Hand-rolls a small valid file: header | records | dict | index.
    fn write_fixture(path: &Path, entities: &[Entity]) {
        let mut dict = TagDict::new();
        let mut data = Vec::new();
        let mut entries = Vec::new();

        for entity in entities {
            let start = data.len() as u64;
            encode_entity(
                &entity.id,
                &entity.tags,
                entity.content.as_deref(),
                &mut dict,
                &mut data,
            )
            .unwrap();

            entries.push(IndexEntry {
                id: entity.id.clone(),
                offset: start,
                len: (data.len() as u64 - start) as u32,
            });
        }

        let mut dict_buf = Vec::new();
        dict.encode(&mut dict_buf);

        let mut index_buf = Vec::new();
        encode_index(&entries, &mut index_buf);

        let mut header = Header::empty();
        header.data_offset = HEADER_SIZE;
        header.data_size = data.len() as u64;
        header.tag_dict_offset = HEADER_SIZE + data.len() as u64;
        header.tag_dict_size = dict_buf.len() as u64;
        header.entity_index_offset = header.tag_dict_offset + dict_buf.len() as u64;
        header.entity_index_size = index_buf.len() as u64;
        header.file_size = header.entity_index_offset + index_buf.len() as u64;
        header.entity_count = entities.len() as u64;
        header.seal();

        let mut file = std::fs::File::create(path).unwrap();
        write_header(&mut file, &header).unwrap();
        file.write_all(&data).unwrap();
        file.write_all(&dict_buf).unwrap();
        file.write_all(&index_buf).unwrap();
    }

    fn sample_entities() -> Vec<Entity> {
        vec![
            Entity {
                id: "e1".into(),
                tags: vec![Tag::new(10, "type:document"), Tag::new(10, "status:active")],
                content: Some(b"hello".to_vec()),
            },
            Entity {
                id: "e2".into(),
                tags: vec![Tag::new(20, "type:note")],
                content: None,
            },
        ]
    }

    #[test]
    fn opens_and_reads_entities() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("entities.ebf");
        write_fixture(&path, &sample_entities());

        let reader = Reader::open(&path, LegacyTagMode::Strict, 1).unwrap();
        assert_eq!(reader.len(), 2);
        assert_eq!(reader.generation(), 1);

        let e1 = reader.get_entity("e1").unwrap().unwrap();
        assert_eq!(e1.content.as_deref(), Some(b"hello".as_slice()));
        assert_eq!(e1.tags.len(), 2);

        assert!(reader.get_entity("missing").unwrap().is_none());

        let all: Vec<_> = reader.entities().collect::<Result<_, _>>().unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn borrowed_view_points_into_the_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("entities.ebf");
        write_fixture(&path, &sample_entities());

        let reader = Reader::open(&path, LegacyTagMode::Strict, 0).unwrap();
        let view = reader.get_entity_view("e1").unwrap().unwrap();

        // the content slice is the mapped file itself, not a copy
        let content = view.content.unwrap();
        assert!(reader.mmap[..].as_ptr_range().contains(&content.as_ptr()));
        assert_eq!(content, b"hello");

        assert_eq!(view.tags[0].body, "type:document");
        assert_eq!(
            view.to_entity(),
            reader.get_entity("e1").unwrap().unwrap()
        );

        assert!(reader.get_entity_view("missing").unwrap().is_none());
    }

    #[test]
    fn refuses_offsets_past_eof() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("entities.ebf");
        write_fixture(&path, &sample_entities());

        // rewrite the header to claim a dict beyond the file end
        let raw = std::fs::read(&path).unwrap();
        let mut header = Header::decode(&raw[..HEADER_SIZE as usize]).unwrap();
        header.tag_dict_offset = raw.len() as u64 + 500;
        header.seal();

        let mut patched = raw.clone();
        patched[..HEADER_SIZE as usize].copy_from_slice(&header.encode());
        std::fs::write(&path, &patched).unwrap();

        assert!(matches!(
            Reader::open(&path, LegacyTagMode::Strict, 1),
            Err(StoreError::Corrupt(_))
        ));
    }

    #[test]
    fn refuses_truncated_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("entities.ebf");
        std::fs::write(&path, b"ENTITYDB").unwrap();

        assert!(Reader::open(&path, LegacyTagMode::Strict, 0).is_err());
    }
}
