//! The `EntityDb` facade: open/recover, the `EntityStore` implementation,
//! commit hooks and checkpoint scheduling.
//!
//! Open is the recovery path: map the main file, load every entity into the
//! in-memory indexes, replay the WAL from the sequence the header says the
//! image already covers, then raise the sequence counter past everything
//! seen. The rebuild from (main file + WAL) is authoritative; nothing else
//! is trusted.

use std::{
    io::Write,
    path::PathBuf,
    sync::{Arc, RwLock},
};

use tracing::{info, warn};

use entitydb_core::{
    Change, Context, EngineConfig, Entity, EntityStore, EntityVersion, GetOptions, NewEntity,
    StoreError, StoreStats, TagPage, TimestampNs, UpdateDelta, WalSeq, WriteAck, WriteOp,
    CommitHook, ENTITY_ID_LEN,
};

use crate::{
    chunk,
    format::{read_header, write_header, Header, HEADER_SIZE},
    header::HeaderSync,
    index::EntityIndex,
    pool::BufferPool,
    reader::Reader,
    temporal,
    wal::Wal,
    writer::{WriteRequest, Writer, WriterManager},
};

pub const MAIN_FILE: &str = "entities.ebf";
pub const WAL_FILE: &str = "entitydb.wal";
pub const LOCK_FILE: &str = "entitydb.mmap.lock";

const MAX_PAGE_LIMIT: usize = 1000;
const CURSOR_SEPARATOR: char = '\u{1f}';

/// Holds `entitydb.mmap.lock` for the lifetime of the open database. A
/// crashed process leaves the file behind; clearing it is an operator
/// action.
struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(error = %e, "failed to remove lock file");
        }
    }
}

pub struct EntityDb {
    config: EngineConfig,
    index: Arc<EntityIndex>,
    header: Arc<HeaderSync>,
    manager: WriterManager,
    reader: RwLock<Arc<Reader>>,
    _lock: LockGuard,
}

impl EntityDb {
    pub fn open(config: EngineConfig) -> Result<Self, StoreError> {
        std::fs::create_dir_all(&config.data_path)?;

        let lock = acquire_lock(config.data_path.join(LOCK_FILE))?;

        let main_path = config.data_path.join(MAIN_FILE);

        if !main_path.exists() {
            let mut file = std::fs::File::create(&main_path)?;
            write_header(&mut file, &Header::empty()).map_err(StoreError::from)?;
            file.sync_all()?;
            info!(path = %main_path.display(), "initialized empty database file");
        }

        let disk_header = load_and_repair_header(&main_path)?;
        let replay_from: WalSeq = disk_header.wal_sequence;

        let index = Arc::new(
            EntityIndex::new(config.index_time_bucket_ns(), config.bloom_fp_rate)
                .map_err(StoreError::InvalidQuery)?,
        );

        let reader = Reader::open(&main_path, config.legacy_tags, 0)?;
        for entity in reader.entities() {
            index.load(&entity?);
        }

        let header = Arc::new(HeaderSync::new(disk_header));

        let wal = Wal::open(
            config.data_path.join(WAL_FILE),
            header.sequence_handle(),
            config.fsync_group_window(),
        )
        .map_err(StoreError::from)?;

        let summary = wal
            .replay(replay_from, |op, entity, seq| {
                index.apply(op, &entity, seq);
            })
            .map_err(StoreError::from)?;

        if let Some(last) = summary.last_seq {
            header.advance_sequence(last + 1);
        }

        index.rebuild_bloom().map_err(StoreError::InvalidQuery)?;

        info!(
            entities = index.len(),
            replayed = summary.records,
            truncated_tail = summary.truncated_tail,
            next_seq = header.current_sequence(),
            "database open"
        );

        let writer = Writer::new(
            config.clone(),
            main_path,
            wal,
            index.clone(),
            header.clone(),
            Arc::new(BufferPool::new()),
        );

        Ok(Self {
            config,
            index,
            header,
            manager: WriterManager::new(Arc::new(writer)),
            reader: RwLock::new(Arc::new(reader)),
            _lock: lock,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn header(&self) -> &HeaderSync {
        &self.header
    }

    pub fn index(&self) -> &EntityIndex {
        &self.index
    }

    /// Registers a synchronous, non-recursive commit hook; the metrics
    /// pipeline attaches here and owns its own rate limiting.
    pub fn on_commit(&self, hook: CommitHook) {
        self.manager.writer().on_commit(hook);
    }

    /// The reader for the current published generation, remapped when a
    /// checkpoint has landed since the last call.
    pub fn reader(&self) -> Result<Arc<Reader>, StoreError> {
        let generation = self.manager.generation();

        {
            let current = self.reader.read().unwrap_or_else(|e| e.into_inner());
            if current.generation() == generation {
                return Ok(current.clone());
            }
        }

        let mut slot = self.reader.write().unwrap_or_else(|e| e.into_inner());
        if slot.generation() != generation {
            let path = self.config.data_path.join(MAIN_FILE);
            *slot = Arc::new(Reader::open(&path, self.config.legacy_tags, generation)?);
        }

        Ok(slot.clone())
    }

    pub fn checkpoint(&self) -> Result<(), StoreError> {
        self.manager.checkpoint()?;
        self.reader()?;
        Ok(())
    }

    /// Runs a checkpoint when any cadence trigger fires. The enclosing
    /// program calls this from its housekeeping loop.
    pub fn maybe_checkpoint(&self) -> Result<bool, StoreError> {
        let ran = self.manager.maybe_checkpoint()?;
        if ran {
            self.reader()?;
        }
        Ok(ran)
    }

    /// Flushes everything. The directory lock is released when the handle
    /// drops.
    pub fn close(&self) -> Result<(), StoreError> {
        self.manager.writer().close()
    }

    fn present(&self, entity: Entity) -> Entity {
        Entity {
            tags: entity.tags.into_iter().filter(|t| !t.is_hidden()).collect(),
            ..entity
        }
    }

    fn live_entity(&self, id: &str) -> Result<Entity, StoreError> {
        let (entity, deleted) = self
            .index
            .with_record(id, |record| {
                (record_entity(id, record), record.is_deleted())
            })
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        if deleted {
            return Err(StoreError::NotFound(id.to_string()));
        }

        Ok(self.present(entity))
    }
}

fn record_entity(id: &str, record: &crate::index::EntityRecord) -> Entity {
    // a chunked parent's own content column is empty; stale inline versions
    // may still exist for as-of reads but never surface on a current get
    let content = if record.has_chunked_content() {
        None
    } else {
        record.current_content().map(|c| c.to_vec())
    };

    Entity {
        id: id.to_string(),
        tags: record.tags.clone(),
        content,
    }
}

fn acquire_lock(path: PathBuf) -> Result<LockGuard, StoreError> {
    match std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
    {
        Ok(mut file) => {
            let _ = writeln!(file, "{}", std::process::id());
            Ok(LockGuard { path })
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("database is locked by {}", path.display()),
            )))
        }
        Err(e) => Err(e.into()),
    }
}

/// Reads the header, repairing the historical `wal_offset = 0` corruption
/// in place before anything else trusts the file.
fn load_and_repair_header(path: &std::path::Path) -> Result<Header, StoreError> {
    let file_size = std::fs::metadata(path)?.len();
    let mut file = std::fs::File::open(path)?;
    let mut header = read_header(&mut file, file_size).map_err(StoreError::from)?;
    drop(file);

    if header.wal_offset == 0 {
        warn!("repairing zero wal_offset in header");
        header.wal_offset = HEADER_SIZE;
        header.seal();

        let mut file = std::fs::OpenOptions::new().write(true).open(path)?;
        write_header(&mut file, &header).map_err(StoreError::from)?;
        file.sync_all()?;
    }

    header.validate().map_err(StoreError::from)?;
    Ok(header)
}

fn parse_cursor(cursor: &str) -> Result<(String, String), StoreError> {
    cursor
        .split_once(CURSOR_SEPARATOR)
        .map(|(tag, id)| (tag.to_string(), id.to_string()))
        .ok_or_else(|| StoreError::InvalidQuery("malformed cursor".to_string()))
}

impl EntityStore for EntityDb {
    fn create_entity(&self, ctx: &Context, entity: NewEntity) -> Result<Entity, StoreError> {
        if entity.id.is_empty() || entity.id.len() > ENTITY_ID_LEN {
            return Err(StoreError::InvalidQuery(format!(
                "entity id length {} out of range",
                entity.id.len()
            )));
        }

        let id = entity.id.clone();

        self.manager.writer().write_entity(
            ctx,
            WriteOp::Create,
            WriteRequest {
                id: entity.id,
                tags: entity.tags,
                content: entity.content,
                content_type: entity.content_type,
            },
        )?;

        self.live_entity(&id)
    }

    fn update_entity(
        &self,
        ctx: &Context,
        id: &str,
        delta: UpdateDelta,
    ) -> Result<Entity, StoreError> {
        self.manager.writer().write_entity(
            ctx,
            WriteOp::Update,
            WriteRequest {
                id: id.to_string(),
                tags: delta.tags,
                content: delta.content,
                content_type: delta.content_type,
            },
        )?;

        self.live_entity(id)
    }

    fn delete_entity(&self, ctx: &Context, id: &str) -> Result<WriteAck, StoreError> {
        self.manager.writer().write_entity(
            ctx,
            WriteOp::Delete,
            WriteRequest {
                id: id.to_string(),
                ..WriteRequest::default()
            },
        )
    }

    fn get_entity(
        &self,
        _ctx: &Context,
        id: &str,
        _opts: GetOptions,
    ) -> Result<Entity, StoreError> {
        if !self.index.contains(id) {
            return Err(StoreError::NotFound(id.to_string()));
        }

        self.live_entity(id)
    }

    fn read_content(
        &self,
        _ctx: &Context,
        id: &str,
        out: &mut dyn Write,
    ) -> Result<u64, StoreError> {
        let deleted = self
            .index
            .with_record(id, |record| record.is_deleted())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        if deleted {
            return Err(StoreError::NotFound(id.to_string()));
        }

        chunk::read_content(&self.index, id, out)
    }

    fn list_by_tag(
        &self,
        _ctx: &Context,
        prefix: &str,
        limit: usize,
        cursor: Option<String>,
    ) -> Result<TagPage, StoreError> {
        if prefix.is_empty() {
            return Err(StoreError::InvalidQuery("empty tag prefix".to_string()));
        }

        if limit == 0 || limit > MAX_PAGE_LIMIT {
            return Err(StoreError::InvalidQuery(format!(
                "limit {limit} out of range"
            )));
        }

        let parsed = cursor.as_deref().map(parse_cursor).transpose()?;
        let after = parsed.as_ref().map(|(t, i)| (t.as_str(), i.as_str()));

        let (entries, more) = self.index.tags().scan_prefix(prefix, after, limit);

        let next = if more {
            entries
                .last()
                .map(|(tag, id)| format!("{tag}{CURSOR_SEPARATOR}{id}"))
        } else {
            None
        };

        Ok(TagPage { entries, next })
    }

    fn as_of(&self, _ctx: &Context, id: &str, at: TimestampNs) -> Result<Entity, StoreError> {
        temporal::as_of(&self.index, id, at).map(|e| self.present(e))
    }

    fn history(
        &self,
        _ctx: &Context,
        id: &str,
        from: TimestampNs,
        to: TimestampNs,
        limit: usize,
    ) -> Result<Vec<EntityVersion>, StoreError> {
        if from > to {
            return Err(StoreError::InvalidQuery(format!(
                "history range inverted: {from} > {to}"
            )));
        }

        let versions = temporal::history(&self.index, id, from, to, limit)?;

        Ok(versions
            .into_iter()
            .map(|v| EntityVersion {
                at: v.at,
                entity: self.present(v.entity),
            })
            .collect())
    }

    fn changes_since(
        &self,
        _ctx: &Context,
        at: TimestampNs,
        limit: usize,
    ) -> Result<Vec<Entity>, StoreError> {
        let entities = temporal::changes_since(&self.index, at, limit)?;
        Ok(entities.into_iter().map(|e| self.present(e)).collect())
    }

    fn diff(
        &self,
        _ctx: &Context,
        id: &str,
        t1: TimestampNs,
        t2: TimestampNs,
    ) -> Result<Vec<Change>, StoreError> {
        temporal::diff(&self.index, id, t1, t2)
    }

    fn stats(&self) -> StoreStats {
        let wal = self.manager.writer().wal();

        StoreStats {
            entity_count: self.index.len(),
            wal_bytes: wal.bytes(),
            wal_records: wal.records(),
            generation: self.manager.generation(),
        }
    }
}
