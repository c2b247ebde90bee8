//! The single Writer instance: serializes mutations, owns the WAL hand-off
//! and the in-memory index merge, and emits full file images at close and
//! checkpoint time.
//!
//! Durability contract: a call either returns an error with no effect, or
//! its record reached the WAL and the index merge that follows is
//! infallible. Cancellation observed after the WAL append still commits and
//! is reported through the ack.

use std::{
    path::PathBuf,
    sync::{Arc, Condvar, Mutex, RwLock},
    time::Duration,
};

use tracing::{debug, info, warn};

use entitydb_core::{
    now_ns, CommitEvent, CommitHook, Context, EngineConfig, Entity, EntityId, StoreError, Tag,
    TimestampNs, WalSeq, WriteAck, WriteOp, CONTENT_VERSION_PREFIX, MAX_ID_LEN, TAG_DELETED,
};

use crate::{
    chunk::{plan_content, ChunkPlan},
    format::{encode_entity, encode_index, write_header, IndexEntry, TagDict, HEADER_SIZE},
    header::HeaderSync,
    index::EntityIndex,
    pool::BufferPool,
    shard::ShardedLock,
    wal::{Wal, WalError},
};

mod manager;

pub use manager::WriterManager;

/// One mutation as accepted at the public boundary: bare tag bodies, the
/// writer stamps timestamps.
#[derive(Debug, Clone, Default)]
pub struct WriteRequest {
    pub id: EntityId,
    pub tags: Vec<String>,
    pub content: Option<Vec<u8>>,
    pub content_type: Option<String>,
}

struct IntakeState {
    inflight: usize,
    paused: bool,
}

/// Bounded intake gate. Capacity overflows and deadline-doomed waits turn
/// into `Overloaded` instead of queueing.
struct Intake {
    depth: usize,
    state: Mutex<IntakeState>,
    cv: Condvar,
}

struct IntakeGuard<'a>(&'a Intake);

impl Drop for IntakeGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.0.state.lock().unwrap_or_else(|e| e.into_inner());
        state.inflight -= 1;
        self.0.cv.notify_all();
    }
}

impl Intake {
    fn new(depth: usize) -> Self {
        Self {
            depth,
            state: Mutex::new(IntakeState {
                inflight: 0,
                paused: false,
            }),
            cv: Condvar::new(),
        }
    }

    fn enter(&self, ctx: &Context) -> Result<IntakeGuard<'_>, StoreError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        while state.paused {
            if ctx.done() {
                return Err(StoreError::Overloaded);
            }

            let wait = ctx
                .remaining()
                .unwrap_or(Duration::from_millis(50))
                .min(Duration::from_millis(50));

            let (next, _) = self
                .cv
                .wait_timeout(state, wait)
                .unwrap_or_else(|e| e.into_inner());
            state = next;
        }

        if state.inflight >= self.depth {
            return Err(StoreError::Overloaded);
        }

        state.inflight += 1;
        Ok(IntakeGuard(self))
    }

    fn pause(&self) {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .paused = true;
    }

    fn resume(&self) {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .paused = false;
        self.cv.notify_all();
    }

    /// Waits for in-flight writes to finish, up to `limit`. Returns whether
    /// the queue fully drained.
    fn wait_drained(&self, limit: Duration) -> bool {
        let deadline = std::time::Instant::now() + limit;
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        while state.inflight > 0 {
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }

            let (next, _) = self
                .cv
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            state = next;
        }

        true
    }
}

pub struct Writer {
    config: EngineConfig,
    file_path: PathBuf,
    wal: Wal,
    index: Arc<EntityIndex>,
    header: Arc<HeaderSync>,
    shards: ShardedLock,
    pool: Arc<BufferPool>,
    intake: Intake,
    hooks: RwLock<Vec<CommitHook>>,
}

impl Writer {
    pub fn new(
        config: EngineConfig,
        file_path: PathBuf,
        wal: Wal,
        index: Arc<EntityIndex>,
        header: Arc<HeaderSync>,
        pool: Arc<BufferPool>,
    ) -> Self {
        let intake = Intake::new(config.writer_queue_depth);

        Self {
            config,
            file_path,
            wal,
            index,
            header,
            shards: ShardedLock::new(),
            pool,
            intake,
            hooks: RwLock::new(Vec::new()),
        }
    }

    pub fn wal(&self) -> &Wal {
        &self.wal
    }

    pub fn index(&self) -> &EntityIndex {
        &self.index
    }

    pub fn header(&self) -> &HeaderSync {
        &self.header
    }

    /// Registers a synchronous commit hook. Hooks must not call back into
    /// mutating operations.
    pub fn on_commit(&self, hook: CommitHook) {
        self.hooks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(hook);
    }

    fn emit(&self, event: CommitEvent) {
        let hooks = self.hooks.read().unwrap_or_else(|e| e.into_inner());
        for hook in hooks.iter() {
            hook(&event);
        }
    }

    /// Shape-only validation. Existence is deliberately not checked here:
    /// that happens under the shard lock, where concurrent operations on
    /// the same id serialize.
    fn validate_request(&self, req: &WriteRequest) -> Result<(), StoreError> {
        if req.id.is_empty() || req.id.len() > MAX_ID_LEN {
            return Err(StoreError::InvalidQuery(format!(
                "id length {} out of range",
                req.id.len()
            )));
        }

        if req.tags.len() > self.config.max_tags_per_entity {
            return Err(StoreError::InvalidQuery(format!(
                "{} tags exceeds the per-entity limit",
                req.tags.len()
            )));
        }

        for body in &req.tags {
            Tag::validate_body(body)
                .map_err(|e| StoreError::InvalidQuery(e.to_string()))?;
        }

        Ok(())
    }

    fn check_existence(&self, op: WriteOp, id: &str) -> Result<(), StoreError> {
        match op {
            WriteOp::Create => {
                if self.index.contains(id) {
                    return Err(StoreError::Exists(id.to_string()));
                }
            }
            WriteOp::Update | WriteOp::Delete => {
                if !self.index.contains(id) {
                    return Err(StoreError::NotFound(id.to_string()));
                }
            }
        }

        Ok(())
    }

    /// Expands one logical request into the physical records of this
    /// operation: chunk entities plus the parent, ordered so an interrupted
    /// sequence never leaves a parent pointing at absent chunks.
    fn stage(
        &self,
        op: WriteOp,
        req: WriteRequest,
        stamp: TimestampNs,
    ) -> Result<Vec<(WriteOp, Entity)>, StoreError> {
        let stamped = |bodies: &[String]| -> Vec<Tag> {
            bodies.iter().map(|b| Tag::new(stamp, b.clone())).collect()
        };

        let mut parent_tags: Vec<String> = req.tags;

        if op == WriteOp::Delete {
            parent_tags.push(TAG_DELETED.to_string());

            return Ok(vec![(
                op,
                Entity {
                    id: req.id,
                    tags: stamped(&parent_tags),
                    content: None,
                },
            )]);
        }

        let plan: Option<ChunkPlan> = match req.content {
            Some(content) => Some(plan_content(
                &req.id,
                content,
                req.content_type.as_deref(),
                self.config.auto_chunk_threshold,
                self.config.chunk_size,
            )?),
            None => None,
        };

        let mut chunk_records = Vec::new();
        let mut parent_content = None;

        if let Some(plan) = plan {
            parent_tags.extend(plan.parent_tags.iter().cloned());
            parent_tags.push(format!("{CONTENT_VERSION_PREFIX}{stamp}"));
            parent_content = plan.inline;

            for chunk in plan.chunks {
                chunk_records.push((
                    WriteOp::Create,
                    Entity {
                        id: chunk.id,
                        tags: stamped(&chunk.tags),
                        content: Some(chunk.content),
                    },
                ));
            }
        }

        let parent = (
            op,
            Entity {
                id: req.id,
                tags: stamped(&parent_tags),
                content: parent_content,
            },
        );

        // chunks-first on create avoids a dangling parent; parent-first on
        // update keeps the existing parent authoritative mid-sequence
        let mut records = Vec::with_capacity(chunk_records.len() + 1);
        match op {
            WriteOp::Create => {
                records.extend(chunk_records);
                records.push(parent);
            }
            _ => {
                records.push(parent);
                records.extend(chunk_records);
            }
        }

        Ok(records)
    }

    /// Accepts one logical mutation: WAL append, index merge, commit hooks.
    pub fn write_entity(
        &self,
        ctx: &Context,
        op: WriteOp,
        req: WriteRequest,
    ) -> Result<WriteAck, StoreError> {
        let _guard = self.intake.enter(ctx)?;

        self.validate_request(&req)?;

        let logical_id = req.id.clone();
        let stamp = now_ns();
        let records = self.stage(op, req, stamp)?;

        // cancellation check at lock acquisition; nothing is durable yet
        if ctx.done() {
            return Err(StoreError::Cancelled);
        }

        let mut ids: Vec<&str> = records.iter().map(|(_, e)| e.id.as_str()).collect();
        let _locks = self.shards.lock_many(&mut ids);

        // existence is decided inside the critical section: two concurrent
        // creates of one id serialize here and the loser sees the winner
        self.check_existence(op, &logical_id)?;

        let mut last_seq: Option<WalSeq> = None;
        let mut after_cancel = false;

        for (record_op, entity) in &records {
            // cancellation boundary: before anything reached the WAL the
            // call can still stop cleanly; afterwards the sequence must
            // finish to keep parents and chunks consistent
            if ctx.done() {
                if last_seq.is_none() {
                    return Err(StoreError::Cancelled);
                }
                after_cancel = true;
            }

            let seq = self.wal.append(*record_op, entity).map_err(|e| match e {
                WalError::Io(io) => StoreError::Durability(io),
                other => other.into(),
            })?;

            self.index.apply(*record_op, entity, seq);

            self.emit(CommitEvent {
                op: *record_op,
                id: entity.id.clone(),
                seq,
                at: stamp,
                tag_count: entity.tags.len(),
                content_bytes: entity.content_len(),
            });

            last_seq = Some(seq);
        }

        let seq = last_seq.unwrap_or_default();
        debug!(seq, op = %op, "write committed");

        Ok(WriteAck {
            seq,
            committed_after_cancel: after_cancel || ctx.done(),
        })
    }

    /// Serializes the full current state into a fresh file image and swaps
    /// it in place of `entities.ebf`. Returns the first sequence NOT
    /// included in the image; replay after a crash resumes there.
    ///
    /// The header moves through `HeaderSync::update`, so an image that
    /// would produce an invalid header never lands; callers hold a snapshot
    /// and restore it if anything past the update fails.
    pub fn persist_image(&self) -> Result<WalSeq, StoreError> {
        let next = self.header.current_sequence();

        for id in self.index.doomed_chunks() {
            debug!(id = %id, "eliding chunk of deleted parent");
            self.index.remove(&id);
        }

        let mut dict = TagDict::new();
        let mut data = self.pool.get(crate::pool::LARGE_BUFFER);
        let mut entries: Vec<IndexEntry> = Vec::new();
        let mut encode_failure: Option<StoreError> = None;

        self.index.for_each(|id, record| {
            if encode_failure.is_some() {
                return;
            }

            let start = data.len() as u64;
            let content = record.current_content().map(|c| c.as_ref());

            if let Err(e) = encode_entity(id, &record.tags, content, &mut dict, &mut data) {
                encode_failure = Some(e.into());
                return;
            }

            entries.push(IndexEntry {
                id: id.to_string(),
                offset: start,
                len: (data.len() as u64 - start) as u32,
            });
        });

        if let Some(e) = encode_failure {
            self.pool.put(data);
            return Err(e);
        }

        let mut dict_buf = self.pool.get(crate::pool::MEDIUM_BUFFER);
        dict.encode(&mut dict_buf);

        let mut index_buf = self.pool.get(crate::pool::MEDIUM_BUFFER);
        encode_index(&entries, &mut index_buf);

        let data_size = data.len() as u64;
        let tag_dict_offset = HEADER_SIZE + data_size;
        let entity_index_offset = tag_dict_offset + dict_buf.len() as u64;
        let file_size = entity_index_offset + index_buf.len() as u64;
        let entity_count = self.index.len();

        let now_secs = now_ns() / 1_000_000_000;

        let header = self.header.update(|h| {
            h.file_size = file_size;
            h.data_offset = HEADER_SIZE;
            h.data_size = data_size;
            h.tag_dict_offset = tag_dict_offset;
            h.tag_dict_size = dict_buf.len() as u64;
            h.entity_index_offset = entity_index_offset;
            h.entity_index_size = index_buf.len() as u64;
            h.wal_offset = HEADER_SIZE;
            h.entity_count = entity_count;
            h.last_modified = now_secs;
            // replay resumes here: every sequence below `next` is in the
            // image being written
            h.wal_sequence = next;
        })?;

        let tmp_path = self.file_path.with_extension("ebf.tmp");

        let result = (|| -> Result<(), StoreError> {
            let mut tmp = std::fs::File::create(&tmp_path)?;
            write_header(&mut tmp, &header).map_err(StoreError::from)?;

            use std::io::Write as _;
            tmp.write_all(&data)?;
            tmp.write_all(&dict_buf)?;
            tmp.write_all(&index_buf)?;
            tmp.sync_all()?;
            drop(tmp);

            std::fs::rename(&tmp_path, &self.file_path)?;

            if let Some(dir) = self.file_path.parent() {
                std::fs::File::open(dir)?.sync_all()?;
            }

            Ok(())
        })();

        self.pool.put(data);
        self.pool.put(dict_buf);
        self.pool.put(index_buf);

        result?;

        info!(
            entities = entity_count,
            bytes = file_size,
            next_seq = next,
            "persisted main file image"
        );

        Ok(next)
    }

    /// Final flush: drain, persist an image, truncate the WAL. On failure
    /// the header snapshot is restored and the WAL left intact so a retry
    /// or the next startup replay stays safe.
    pub fn close(&self) -> Result<(), StoreError> {
        self.intake.pause();

        if !self
            .intake
            .wait_drained(self.config.checkpoint_stall_limit())
        {
            warn!("close proceeding with writes still in flight");
        }

        self.wal.sync().map_err(StoreError::from)?;

        let snapshot = self.header.snapshot();

        match self.persist_image() {
            Ok(next) => {
                if next > 0 {
                    self.wal.truncate_to(next - 1).map_err(StoreError::from)?;
                }
                Ok(())
            }
            Err(e) => {
                self.header.restore(snapshot);
                Err(e)
            }
        }
    }

    pub(crate) fn intake_pause(&self) {
        self.intake.pause();
    }

    pub(crate) fn intake_resume(&self) {
        self.intake.resume();
    }

    pub(crate) fn intake_wait_drained(&self, limit: Duration) -> bool {
        self.intake.wait_drained(limit)
    }

    pub(crate) fn config(&self) -> &EngineConfig {
        &self.config
    }
}
