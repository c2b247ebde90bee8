use std::io::Write;

use thiserror::Error;

use crate::{
    Change, Context, Entity, EntityId, EntityVersion, GetOptions, NewEntity, TagPage, TimestampNs,
    UpdateDelta, WalSeq, WriteAck,
};

/// Stable error kinds across the storage interface.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("entity not found: {0}")]
    NotFound(EntityId),

    #[error("entity already exists: {0}")]
    Exists(EntityId),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("entity exceeds the 2 GiB encoded limit")]
    EntityTooLarge,

    #[error("wal append failed")]
    Durability(#[source] std::io::Error),

    #[error("writer intake queue is full")]
    Overloaded,

    /// The caller's context was cancelled before the write reached the WAL.
    /// Cancellation observed after the WAL append commits instead and is
    /// reported through `WriteAck::committed_after_cancel`.
    #[error("cancelled before reaching the wal")]
    Cancelled,

    #[error("corrupt data: {0}")]
    Corrupt(String),

    /// Internal: HeaderSync rejected an update. Checkpoints recover via
    /// snapshot restore; this never reaches users through a public method.
    #[error("header rejected: {0}")]
    HeaderInvalid(String),

    #[error("wal corruption after sequence {0}; refusing to serve writes")]
    WalCorruption(WalSeq),

    #[error("missing chunk {index} of entity {parent}")]
    ChunkMissing { parent: EntityId, index: u32 },

    #[error("corrupt chunk {index} of entity {parent}")]
    ChunkCorrupt { parent: EntityId, index: u32 },

    #[error("io error")]
    Io(#[from] std::io::Error),
}

/// Point-in-time counters for the enclosing program's metrics pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub entity_count: u64,
    pub wal_bytes: u64,
    pub wal_records: u64,
    pub generation: u64,
}

/// The storage contract consumed by the API layer.
///
/// Timestamps are unsigned 64-bit nanoseconds since the Unix epoch. Tag
/// strings returned to callers have the `T|` prefix stripped unless
/// `include_timestamps` is set.
pub trait EntityStore: Send + Sync {
    fn create_entity(&self, ctx: &Context, entity: NewEntity) -> Result<Entity, StoreError>;

    fn update_entity(
        &self,
        ctx: &Context,
        id: &str,
        delta: UpdateDelta,
    ) -> Result<Entity, StoreError>;

    fn delete_entity(&self, ctx: &Context, id: &str) -> Result<WriteAck, StoreError>;

    fn get_entity(&self, ctx: &Context, id: &str, opts: GetOptions) -> Result<Entity, StoreError>;

    /// Streams an entity's content, reassembling chunked storage.
    fn read_content(
        &self,
        ctx: &Context,
        id: &str,
        out: &mut dyn Write,
    ) -> Result<u64, StoreError>;

    fn list_by_tag(
        &self,
        ctx: &Context,
        prefix: &str,
        limit: usize,
        cursor: Option<String>,
    ) -> Result<TagPage, StoreError>;

    /// The entity as it existed at `at`.
    fn as_of(&self, ctx: &Context, id: &str, at: TimestampNs) -> Result<Entity, StoreError>;

    /// Snapshots at each mutation point within `[from, to]`, ascending.
    fn history(
        &self,
        ctx: &Context,
        id: &str,
        from: TimestampNs,
        to: TimestampNs,
        limit: usize,
    ) -> Result<Vec<EntityVersion>, StoreError>;

    /// Entities carrying any tag with timestamp `>= at`.
    fn changes_since(
        &self,
        ctx: &Context,
        at: TimestampNs,
        limit: usize,
    ) -> Result<Vec<Entity>, StoreError>;

    /// Tag-set difference between two points in time.
    fn diff(
        &self,
        ctx: &Context,
        id: &str,
        t1: TimestampNs,
        t2: TimestampNs,
    ) -> Result<Vec<Change>, StoreError>;

    fn stats(&self) -> StoreStats;
}
