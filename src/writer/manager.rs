use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Instant,
};

use tracing::{info, warn};

use entitydb_core::StoreError;

use super::Writer;

/// Owns the active Writer and drives checkpoints.
///
/// The checkpoint protocol is the three-layer corruption protection:
/// snapshot the header, rewrite the whole image (validation happens inside
/// the HeaderSync update), and restore the snapshot if anything after the
/// update fails. The WAL is only truncated once the fresh image is durable,
/// so an aborted checkpoint leaves the replay path intact.
pub struct WriterManager {
    writer: Arc<Writer>,
    generation: Arc<AtomicU64>,
    last_checkpoint: Mutex<Instant>,
}

impl WriterManager {
    pub fn new(writer: Arc<Writer>) -> Self {
        Self {
            writer,
            generation: Arc::new(AtomicU64::new(0)),
            last_checkpoint: Mutex::new(Instant::now()),
        }
    }

    pub fn writer(&self) -> &Writer {
        &self.writer
    }

    /// The mmap generation readers compare against. Bumped once per
    /// successful checkpoint.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn generation_handle(&self) -> Arc<AtomicU64> {
        self.generation.clone()
    }

    /// Cadence check: WAL volume, record count or elapsed time.
    pub fn should_checkpoint(&self) -> bool {
        let config = self.writer.config();
        let wal = self.writer.wal();

        if wal.bytes() > config.checkpoint_wal_bytes {
            return true;
        }

        if wal.records() > config.checkpoint_wal_records {
            return true;
        }

        let last = *self
            .last_checkpoint
            .lock()
            .unwrap_or_else(|e| e.into_inner());

        last.elapsed() > config.checkpoint_interval()
    }

    pub fn maybe_checkpoint(&self) -> Result<bool, StoreError> {
        if !self.should_checkpoint() {
            return Ok(false);
        }

        self.checkpoint()?;
        Ok(true)
    }

    /// Rewrites the main file from current in-memory state and truncates
    /// the WAL through the last sequence included in the image.
    pub fn checkpoint(&self) -> Result<(), StoreError> {
        let started = Instant::now();
        let snapshot = self.writer.header().snapshot();

        self.writer.intake_pause();

        let stall = self.writer.config().checkpoint_stall_limit();
        if !self.writer.intake_wait_drained(stall) {
            warn!("checkpoint proceeding before write queue fully drained");
        }

        let result = (|| -> Result<(), StoreError> {
            self.writer.wal().sync().map_err(StoreError::from)?;

            let next = self.writer.persist_image()?;

            if next > 0 {
                self.writer
                    .wal()
                    .truncate_to(next - 1)
                    .map_err(StoreError::from)?;
            }

            self.writer
                .index()
                .rebuild_bloom()
                .map_err(StoreError::Corrupt)?;

            Ok(())
        })();

        match result {
            Ok(()) => {
                self.generation.fetch_add(1, Ordering::SeqCst);
                *self
                    .last_checkpoint
                    .lock()
                    .unwrap_or_else(|e| e.into_inner()) = Instant::now();

                self.writer.intake_resume();

                info!(
                    generation = self.generation(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "checkpoint complete"
                );

                Ok(())
            }
            Err(e) => {
                // the three-layer protection: service continues on the old
                // header and the untruncated WAL
                self.writer.header().restore(snapshot);
                self.writer.intake_resume();

                warn!(error = %e, "checkpoint aborted, header restored");
                Err(e)
            }
        }
    }
}
