use serde::{Deserialize, Serialize};

use crate::{EntityId, Tag, TimestampNs};

/// The atomic record of the system.
///
/// `created_at`/`updated_at` are derived from the smallest and largest tag
/// timestamps; they are never stored redundantly.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Entity {
    pub id: EntityId,
    pub tags: Vec<Tag>,
    pub content: Option<Vec<u8>>,
}

impl Entity {
    pub fn created_at(&self) -> Option<TimestampNs> {
        self.tags.iter().map(|t| t.ts).min()
    }

    pub fn updated_at(&self) -> Option<TimestampNs> {
        self.tags.iter().map(|t| t.ts).max()
    }

    /// Tag bodies with the timestamp prefix stripped, hidden tags excluded.
    pub fn tags_stripped(&self) -> Vec<&str> {
        self.tags
            .iter()
            .filter(|t| !t.is_hidden())
            .map(|t| t.body.as_str())
            .collect()
    }

    pub fn has_tag(&self, body: &str) -> bool {
        self.tags.iter().any(|t| t.body == body)
    }

    /// Latest value carried by a tag with the given `ns:key` prefix.
    pub fn tag_value(&self, ns_key: &str) -> Option<&str> {
        self.tags
            .iter()
            .filter(|t| t.ns_key() == ns_key)
            .max_by_key(|t| t.ts)
            .map(|t| t.value())
    }

    pub fn content_len(&self) -> usize {
        self.content.as_ref().map(|c| c.len()).unwrap_or_default()
    }
}

/// Input to `CreateEntity`: bare tag bodies, the writer stamps timestamps.
#[derive(Debug, Clone, Default)]
pub struct NewEntity {
    pub id: EntityId,
    pub tags: Vec<String>,
    pub content: Option<Vec<u8>>,

    /// Declared mime of the content, stored verbatim. The core never sniffs.
    pub content_type: Option<String>,
}

/// Input to `UpdateEntity`: tag additions and an optional content
/// replacement. Tags are append-only, so there is no removal form.
#[derive(Debug, Clone, Default)]
pub struct UpdateDelta {
    pub tags: Vec<String>,
    pub content: Option<Vec<u8>>,
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GetOptions {
    /// Return tags in wire form (`T|ns:key:value`) instead of stripped.
    pub include_timestamps: bool,
}

/// A snapshot of an entity at one mutation point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityVersion {
    pub at: TimestampNs,
    pub entity: Entity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Removed,
    Modified,
}

/// One element of a temporal diff between two points in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub kind: ChangeKind,
    pub ns_key: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

/// One page of a tag-prefix listing.
#[derive(Debug, Clone, Default)]
pub struct TagPage {
    /// `(tag body, entity id)` pairs in tag order.
    pub entries: Vec<(String, EntityId)>,
    pub next: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity() -> Entity {
        Entity {
            id: "e1".into(),
            tags: vec![
                Tag::new(30, "status:published"),
                Tag::new(10, "type:document"),
                Tag::new(20, "status:draft"),
                Tag::new(25, "content:version:25"),
            ],
            content: Some(b"hello".to_vec()),
        }
    }

    #[test]
    fn timestamps_derive_from_tags() {
        let e = entity();
        assert_eq!(e.created_at(), Some(10));
        assert_eq!(e.updated_at(), Some(30));
        assert_eq!(Entity::default().created_at(), None);
    }

    #[test]
    fn stripped_tags_hide_version_markers() {
        let e = entity();
        let stripped = e.tags_stripped();
        assert_eq!(
            stripped,
            vec!["status:published", "type:document", "status:draft"]
        );
    }

    #[test]
    fn tag_value_picks_latest_per_ns_key() {
        let e = entity();
        assert_eq!(e.tag_value("status"), Some("published"));
        assert_eq!(e.tag_value("type"), Some("document"));
        assert_eq!(e.tag_value("missing"), None);
    }
}
