use entitydb_core::{Entity, Tag, TimestampNs, MAX_ID_LEN};

use super::{Cursor, FormatError, TagDict};

/// Hard cap on the encoded size of a single entity record.
pub const MAX_ENTITY_BYTES: u64 = 2 * 1024 * 1024 * 1024;

/// A tag borrowed out of a decoded record: the body points into the
/// dictionary, nothing is copied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagView<'a> {
    pub ts: TimestampNs,
    pub body: &'a str,
}

/// Zero-copy projection of an entity record: the id and content reference
/// the encoded bytes, tag bodies reference the dictionary. Callers that
/// need ownership convert with [`EntityView::to_entity`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityView<'a> {
    pub id: &'a str,
    pub tags: Vec<TagView<'a>>,
    pub content: Option<&'a [u8]>,
}

impl EntityView<'_> {
    pub fn to_entity(&self) -> Entity {
        Entity {
            id: self.id.to_string(),
            tags: self
                .tags
                .iter()
                .map(|t| Tag::new(t.ts, t.body))
                .collect(),
            content: self.content.map(|c| c.to_vec()),
        }
    }
}

/// Main-file record layout, tags dictionary-encoded:
///
/// `id_len(u16) | id | tag_count(u32) | { ts(u64) | tag_id(u32) }* |
///  content_len(u32) | content`
///
/// Chunk entities extend their parent's id, so the id field is
/// length-prefixed rather than fixed at the nominal 36 bytes.
pub fn encode_entity(
    id: &str,
    tags: &[Tag],
    content: Option<&[u8]>,
    dict: &mut TagDict,
    out: &mut Vec<u8>,
) -> Result<(), FormatError> {
    if id.is_empty() || id.len() > MAX_ID_LEN {
        return Err(FormatError::Corrupt(format!("bad id length {}", id.len())));
    }

    let content_len = content.map(|c| c.len()).unwrap_or_default();
    let encoded_len = 2 + id.len() + 4 + tags.len() * 12 + 4 + content_len;

    if encoded_len as u64 > MAX_ENTITY_BYTES {
        return Err(FormatError::EntityTooLarge);
    }

    out.extend_from_slice(&(id.len() as u16).to_le_bytes());
    out.extend_from_slice(id.as_bytes());
    out.extend_from_slice(&(tags.len() as u32).to_le_bytes());

    for tag in tags {
        let tag_id = dict.get_or_insert(&tag.body);
        out.extend_from_slice(&tag.ts.to_le_bytes());
        out.extend_from_slice(&tag_id.to_le_bytes());
    }

    out.extend_from_slice(&(content_len as u32).to_le_bytes());
    if let Some(content) = content {
        out.extend_from_slice(content);
    }

    Ok(())
}

/// Decodes a record without copying: the returned view borrows the record
/// bytes for id and content and the dictionary for tag bodies.
pub fn decode_entity_view<'a>(
    buf: &'a [u8],
    dict: &'a TagDict,
) -> Result<EntityView<'a>, FormatError> {
    let mut cursor = Cursor::new(buf);

    let id_len = cursor.take_u16()? as usize;
    if id_len == 0 || id_len > MAX_ID_LEN {
        return Err(FormatError::Corrupt(format!("bad id length {id_len}")));
    }

    let id = cursor.take_str(id_len)?;
    let tag_count = cursor.take_u32()? as usize;

    if tag_count * 12 > cursor.remaining() {
        return Err(FormatError::Truncated {
            needed: tag_count * 12,
            available: cursor.remaining(),
        });
    }

    let mut tags = Vec::with_capacity(tag_count);
    for _ in 0..tag_count {
        let ts = cursor.take_u64()?;
        let tag_id = cursor.take_u32()?;
        let body = dict.lookup(tag_id)?;
        tags.push(TagView {
            ts,
            body: body.as_str(),
        });
    }

    let content_len = cursor.take_u32()? as usize;
    let content = if content_len > 0 {
        Some(cursor.take(content_len)?)
    } else {
        None
    };

    if !cursor.is_empty() {
        return Err(FormatError::Corrupt(format!(
            "{} trailing bytes after entity {id}",
            cursor.remaining()
        )));
    }

    Ok(EntityView { id, tags, content })
}

pub fn decode_entity(buf: &[u8], dict: &TagDict) -> Result<Entity, FormatError> {
    decode_entity_view(buf, dict).map(|view| view.to_entity())
}

/// WAL payload layout, self-contained (no dictionary reference, since the
/// dictionary is only persisted at checkpoints):
///
/// `id_len(u16) | id | tag_count(u32) | { ts(u64) | body_len(u16) | body }* |
///  has_content(u8) | [ content_len(u32) | content ]`
pub fn encode_wal_entity(entity: &Entity, out: &mut Vec<u8>) -> Result<(), FormatError> {
    if entity.id.is_empty() || entity.id.len() > MAX_ID_LEN {
        return Err(FormatError::Corrupt(format!(
            "bad id length {}",
            entity.id.len()
        )));
    }

    out.extend_from_slice(&(entity.id.len() as u16).to_le_bytes());
    out.extend_from_slice(entity.id.as_bytes());
    out.extend_from_slice(&(entity.tags.len() as u32).to_le_bytes());

    for tag in &entity.tags {
        if tag.body.len() > u16::MAX as usize {
            return Err(FormatError::Corrupt("tag body too long".to_string()));
        }

        out.extend_from_slice(&tag.ts.to_le_bytes());
        out.extend_from_slice(&(tag.body.len() as u16).to_le_bytes());
        out.extend_from_slice(tag.body.as_bytes());
    }

    match &entity.content {
        Some(content) => {
            if content.len() as u64 > MAX_ENTITY_BYTES {
                return Err(FormatError::EntityTooLarge);
            }

            out.push(1);
            out.extend_from_slice(&(content.len() as u32).to_le_bytes());
            out.extend_from_slice(content);
        }
        None => out.push(0),
    }

    if out.len() as u64 > MAX_ENTITY_BYTES {
        return Err(FormatError::EntityTooLarge);
    }

    Ok(())
}

pub fn decode_wal_entity(buf: &[u8]) -> Result<Entity, FormatError> {
    let mut cursor = Cursor::new(buf);

    let id_len = cursor.take_u16()? as usize;
    if id_len == 0 || id_len > MAX_ID_LEN {
        return Err(FormatError::Corrupt(format!("bad id length {id_len}")));
    }

    let id = cursor.take_str(id_len)?.to_string();
    let tag_count = cursor.take_u32()? as usize;

    let mut tags = Vec::with_capacity(tag_count.min(4096));
    for _ in 0..tag_count {
        let ts = cursor.take_u64()?;
        let body_len = cursor.take_u16()? as usize;
        let body = cursor.take_str(body_len)?;
        tags.push(Tag::new(ts, body));
    }

    let content = match cursor.take_u8()? {
        0 => None,
        1 => {
            let len = cursor.take_u32()? as usize;
            Some(cursor.take(len)?.to_vec())
        }
        other => {
            return Err(FormatError::Corrupt(format!(
                "bad content flag {other} in wal entity {id}"
            )));
        }
    };

    if !cursor.is_empty() {
        return Err(FormatError::Corrupt(format!(
            "{} trailing bytes after wal entity {id}",
            cursor.remaining()
        )));
    }

    Ok(Entity { id, tags, content })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Entity {
        Entity {
            id: "0b4ef00d-aaaa-bbbb-cccc-1234567890ab".into(),
            tags: vec![
                Tag::new(100, "type:document"),
                Tag::new(200, "status:active"),
            ],
            content: Some(b"hello world".to_vec()),
        }
    }

    #[test]
    fn dict_encoding_round_trips() {
        let entity = sample();
        let mut dict = TagDict::new();
        let mut buf = Vec::new();

        encode_entity(
            &entity.id,
            &entity.tags,
            entity.content.as_deref(),
            &mut dict,
            &mut buf,
        )
        .unwrap();

        let back = decode_entity(&buf, &dict).unwrap();
        assert_eq!(back, entity);
    }

    #[test]
    fn view_borrows_instead_of_copying() {
        let entity = sample();
        let mut dict = TagDict::new();
        let mut buf = Vec::new();

        encode_entity(
            &entity.id,
            &entity.tags,
            entity.content.as_deref(),
            &mut dict,
            &mut buf,
        )
        .unwrap();

        let view = decode_entity_view(&buf, &dict).unwrap();

        // content is a slice of the encoded record itself
        let content = view.content.unwrap();
        let buf_range = buf.as_ptr_range();
        assert!(buf_range.contains(&content.as_ptr()));

        assert_eq!(view.id, entity.id);
        assert_eq!(view.tags.len(), 2);
        assert_eq!(view.tags[1].body, "status:active");
        assert_eq!(view.to_entity(), entity);
    }

    #[test]
    fn empty_content_decodes_as_none() {
        let mut dict = TagDict::new();
        let mut buf = Vec::new();
        let tags = vec![Tag::new(5, "type:chunk")];

        encode_entity("parent-chunk-0", &tags, None, &mut dict, &mut buf).unwrap();

        let back = decode_entity(&buf, &dict).unwrap();
        assert_eq!(back.content, None);
        assert_eq!(back.tags, tags);
    }

    #[test]
    fn wal_encoding_round_trips() {
        let entity = sample();
        let mut buf = Vec::new();
        encode_wal_entity(&entity, &mut buf).unwrap();

        let back = decode_wal_entity(&buf).unwrap();
        assert_eq!(back, entity);
    }

    #[test]
    fn wal_encoding_preserves_missing_content() {
        let entity = Entity {
            id: "tombstone".into(),
            tags: vec![Tag::new(9, "status:deleted")],
            content: None,
        };

        let mut buf = Vec::new();
        encode_wal_entity(&entity, &mut buf).unwrap();
        assert_eq!(decode_wal_entity(&buf).unwrap().content, None);
    }

    #[test]
    fn oversized_ids_are_rejected() {
        let mut dict = TagDict::new();
        let mut buf = Vec::new();
        let long_id = "x".repeat(MAX_ID_LEN + 1);

        assert!(encode_entity(&long_id, &[], None, &mut dict, &mut buf).is_err());
    }

    #[test]
    fn truncated_records_fail_cleanly() {
        let entity = sample();
        let mut dict = TagDict::new();
        let mut buf = Vec::new();

        encode_entity(
            &entity.id,
            &entity.tags,
            entity.content.as_deref(),
            &mut dict,
            &mut buf,
        )
        .unwrap();

        buf.truncate(buf.len() - 4);
        assert!(decode_entity(&buf, &dict).is_err());
    }

    #[test]
    fn unknown_tag_ids_are_corruption() {
        let mut dict = TagDict::new();
        let mut buf = Vec::new();
        let tags = vec![Tag::new(7, "status:active")];

        encode_entity("e1", &tags, None, &mut dict, &mut buf).unwrap();

        let empty = TagDict::new();
        assert!(matches!(
            decode_entity(&buf, &empty),
            Err(FormatError::UnknownTagId(0))
        ));
    }
}
