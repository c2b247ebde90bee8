//! Memory-resident indexes over the entity population.
//!
//! Four cooperating structures hang off the primary map: the timeline
//! (ordered by tag timestamp, bucket-coarsened), the tag → entity skip-list,
//! the bloom gate for negative lookups and the per-entity history list. All
//! of them are rebuilt from the main file plus WAL replay on startup; the
//! rebuild is authoritative.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use entitydb_core::{
    Entity, EntityId, Tag, TimestampNs, WalSeq, WriteOp, CONTENT_VERSION_PREFIX, NS_PARENT,
    TAG_CHUNK_TYPE, TAG_DELETED,
};

mod bloom;
mod history;
mod tags;
mod timeline;

pub use bloom::BloomGate;
pub use history::{HistoryIndex, HistoryPoint};
pub use tags::TagIndex;
pub use timeline::Timeline;

/// One stored content generation. `at` is the version timestamp carried by
/// the hidden `content:version:` tag of the write that produced it.
#[derive(Debug, Clone)]
pub struct ContentVersion {
    pub at: TimestampNs,
    pub bytes: Arc<[u8]>,
}

/// Full in-memory state of one entity: every tag ever appended and the
/// retained content versions, ascending.
#[derive(Debug, Default, Clone)]
pub struct EntityRecord {
    pub tags: Vec<Tag>,
    pub versions: Vec<ContentVersion>,
}

impl EntityRecord {
    pub fn current_content(&self) -> Option<&Arc<[u8]>> {
        self.versions.last().map(|v| &v.bytes)
    }

    pub fn content_as_of(&self, at: TimestampNs) -> Option<&Arc<[u8]>> {
        self.versions
            .iter()
            .rev()
            .find(|v| v.at <= at)
            .map(|v| &v.bytes)
    }

    pub fn tags_as_of(&self, at: TimestampNs) -> Vec<Tag> {
        self.tags.iter().filter(|t| t.ts <= at).cloned().collect()
    }

    pub fn first_seen(&self) -> Option<TimestampNs> {
        self.tags.iter().map(|t| t.ts).min()
    }

    pub fn last_modified(&self) -> Option<TimestampNs> {
        self.tags.iter().map(|t| t.ts).max()
    }

    /// Logical deletion: the latest `status` value is `deleted`.
    pub fn is_deleted(&self) -> bool {
        self.tags
            .iter()
            .filter(|t| t.ns_key() == "status")
            .max_by_key(|t| t.ts)
            .is_some_and(|t| t.body == TAG_DELETED)
    }

    pub fn is_chunk(&self) -> bool {
        self.tags.iter().any(|t| t.body == TAG_CHUNK_TYPE)
    }

    /// The content currently lives in chunk entities, not on this record.
    pub fn has_chunked_content(&self) -> bool {
        self.tags.iter().any(|t| t.ns_key() == "content:chunks")
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.tags
            .iter()
            .filter(|t| t.namespace() == NS_PARENT)
            .max_by_key(|t| t.ts)
            .map(|t| &t.body[NS_PARENT.len() + 1..])
    }

    fn materialize(&self, id: &str) -> Entity {
        Entity {
            id: id.to_string(),
            tags: self.tags.clone(),
            content: self.current_content().map(|c| c.to_vec()),
        }
    }
}

/// Timestamp a tag set assigns to its content version: the newest hidden
/// version tag when present, the newest tag otherwise.
fn version_ts(tags: &[Tag]) -> TimestampNs {
    tags.iter()
        .filter(|t| t.body.starts_with(CONTENT_VERSION_PREFIX))
        .map(|t| t.ts)
        .max()
        .or_else(|| tags.iter().map(|t| t.ts).max())
        .unwrap_or_default()
}

pub struct EntityIndex {
    entities: RwLock<HashMap<EntityId, EntityRecord>>,
    timeline: Timeline,
    tags: TagIndex,
    bloom: BloomGate,
    history: HistoryIndex,
}

impl EntityIndex {
    pub fn new(bucket_ns: u64, bloom_fp_rate: f64) -> Result<Self, String> {
        Ok(Self {
            entities: RwLock::new(HashMap::new()),
            timeline: Timeline::new(bucket_ns),
            tags: TagIndex::new(),
            bloom: BloomGate::new(0, bloom_fp_rate)?,
            history: HistoryIndex::new(),
        })
    }

    /// The single authoritative population count. The header's
    /// `entity_count` is always derived from this, never tracked apart.
    pub fn len(&self) -> u64 {
        self.entities
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &str) -> bool {
        if !self.bloom.check(id) {
            return false;
        }

        self.entities
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(id)
    }

    /// Materializes the current state of an entity.
    pub fn get(&self, id: &str) -> Option<Entity> {
        if !self.bloom.check(id) {
            return None;
        }

        self.entities
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .map(|record| record.materialize(id))
    }

    /// Borrow access to a record without materializing.
    pub fn with_record<R>(&self, id: &str, f: impl FnOnce(&EntityRecord) -> R) -> Option<R> {
        self.entities
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .map(f)
    }

    /// Merges a committed write into the record and every auxiliary index.
    ///
    /// This path must not fail: the WAL already holds the record, so a
    /// failure here would desynchronize memory from disk. Callers abort the
    /// process instead of handling an error.
    pub fn apply(&self, op: WriteOp, delta: &Entity, seq: WalSeq) {
        let mut entities = self.entities.write().unwrap_or_else(|e| e.into_inner());
        let record = entities.entry(delta.id.clone()).or_default();

        // exact (ts, body) duplicates collapse, which makes WAL replay over
        // an already-checkpointed record idempotent
        for tag in &delta.tags {
            if !record.tags.contains(tag) {
                record.tags.push(tag.clone());
            }
        }

        let carried_content = op != WriteOp::Delete && delta.content.is_some();
        if let Some(content) = delta.content.as_ref().filter(|_| op != WriteOp::Delete) {
            let at = version_ts(&delta.tags);
            if !record.versions.iter().any(|v| v.at == at) {
                record.versions.push(ContentVersion {
                    at,
                    bytes: Arc::from(content.as_slice()),
                });
            }
        }

        drop(entities);

        for tag in &delta.tags {
            self.timeline.touch(&delta.id, tag.ts);
            self.tags.insert(&tag.body, &delta.id);
        }

        self.bloom.insert(&delta.id);

        let at = delta.updated_at().unwrap_or_default();
        self.history.push(
            &delta.id,
            HistoryPoint {
                at,
                seq,
                op,
                content: carried_content,
            },
        );
    }

    /// Seeds a whole entity read back from the main file. Mutation points
    /// are synthesized from the distinct tag timestamps, since the original
    /// per-write grouping only exists in the WAL.
    pub fn load(&self, entity: &Entity) {
        let mut record = EntityRecord {
            tags: entity.tags.clone(),
            versions: Vec::new(),
        };

        if let Some(content) = &entity.content {
            record.versions.push(ContentVersion {
                at: version_ts(&entity.tags),
                bytes: Arc::from(content.as_slice()),
            });
        }

        let mut instants: Vec<TimestampNs> = entity.tags.iter().map(|t| t.ts).collect();
        instants.sort_unstable();
        instants.dedup();

        for (i, at) in instants.iter().enumerate() {
            let op = if i == 0 {
                WriteOp::Create
            } else {
                WriteOp::Update
            };

            self.history.push(
                &entity.id,
                HistoryPoint {
                    at: *at,
                    seq: 0,
                    op,
                    content: false,
                },
            );
        }

        for tag in &entity.tags {
            self.timeline.touch(&entity.id, tag.ts);
            self.tags.insert(&tag.body, &entity.id);
        }

        self.bloom.insert(&entity.id);

        self.entities
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(entity.id.clone(), record);
    }

    /// Visits every record. Iteration order is the primary map's id-hash
    /// order, which is also the order checkpoint images are written in.
    pub fn for_each(&self, mut f: impl FnMut(&str, &EntityRecord)) {
        let entities = self.entities.read().unwrap_or_else(|e| e.into_inner());
        for (id, record) in entities.iter() {
            f(id, record);
        }
    }

    pub fn ids(&self) -> Vec<EntityId> {
        self.entities
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    /// Chunk entities whose parent is logically deleted; a checkpoint elides
    /// these from the fresh image.
    pub fn doomed_chunks(&self) -> Vec<EntityId> {
        let entities = self.entities.read().unwrap_or_else(|e| e.into_inner());

        entities
            .iter()
            .filter(|(_, record)| record.is_chunk())
            .filter(|(_, record)| {
                record
                    .parent_id()
                    .and_then(|parent| entities.get(parent))
                    .is_some_and(|parent| parent.is_deleted())
            })
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Physically drops a record from every structure except the bloom
    /// filter, which is rebuilt right after checkpoint.
    pub fn remove(&self, id: &str) {
        let removed = self
            .entities
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);

        if let Some(record) = removed {
            for tag in &record.tags {
                self.tags.remove_id(&tag.body, id);
            }
        }

        self.timeline.remove(id);
        self.history.remove(id);
    }

    pub fn rebuild_bloom(&self) -> Result<(), String> {
        // snapshot the ids first; holding the entities lock while swapping
        // the filter would order locks against the read path
        let ids = self.ids();
        self.bloom.rebuild(ids.iter().map(|k| k.as_str()), ids.len())
    }

    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    pub fn tags(&self) -> &TagIndex {
        &self.tags
    }

    pub fn bloom(&self) -> &BloomGate {
        &self.bloom
    }

    pub fn history(&self) -> &HistoryIndex {
        &self.history
    }
}
