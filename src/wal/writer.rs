use std::io::Write;
use std::time::Instant;

use entitydb_core::{Entity, WalSeq, WriteOp};

use crate::format::{encode_wal_entity, WAL_MAGIC};

use super::{Wal, WalError, WAL_VERSION};

impl Wal {
    /// Serializes the entity, frames it and appends it to the log.
    ///
    /// The record is in the OS page cache when this returns; fsync is group
    /// committed within the configured window, so a record may ride on a
    /// later append's sync or on the explicit [`Wal::sync`] at close and
    /// checkpoint time.
    pub fn append(&self, op: WriteOp, entity: &Entity) -> Result<WalSeq, WalError> {
        let mut payload = Vec::with_capacity(256 + entity.content_len());
        encode_wal_entity(entity, &mut payload)?;

        self.append_payload(op, &payload)
    }

    pub(crate) fn append_payload(&self, op: WriteOp, payload: &[u8]) -> Result<WalSeq, WalError> {
        let crc = crc32fast::hash(payload);

        let mut inner = self.lock_file();
        let seq = self.next_seq();

        let mut frame = Vec::with_capacity(
            super::FRAME_PREFIX_LEN + payload.len() + super::FRAME_SUFFIX_LEN,
        );
        frame.extend_from_slice(&WAL_MAGIC);
        frame.extend_from_slice(&WAL_VERSION.to_le_bytes());
        frame.extend_from_slice(&seq.to_le_bytes());
        frame.extend_from_slice(&op.code().to_le_bytes());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(payload);
        frame.extend_from_slice(&crc.to_le_bytes());

        inner.file.write_all(&frame)?;
        inner.file.flush()?;

        if inner.last_fsync.elapsed() >= self.window() {
            inner.file.sync_data()?;
            inner.last_fsync = Instant::now();
            inner.dirty = false;
        } else {
            inner.dirty = true;
        }

        drop(inner);

        self.bump_counters(frame.len() as u64);

        Ok(seq)
    }

    /// Forces any pending group-committed records to disk.
    pub fn sync(&self) -> Result<(), WalError> {
        let mut inner = self.lock_file();

        if inner.dirty {
            inner.file.sync_data()?;
            inner.last_fsync = Instant::now();
            inner.dirty = false;
        }

        Ok(())
    }

    /// Drops every record with sequence `<= cutoff`. Invoked only by
    /// checkpoint, never mid-write; records appended after the checkpoint
    /// image was taken survive.
    pub fn truncate_to(&self, cutoff: WalSeq) -> Result<(), WalError> {
        let mut inner = self.lock_file();

        let raw = std::fs::read(self.path())?;
        let mut retained = Vec::new();
        let mut retained_records = 0u64;

        for frame in super::reader::frames(&raw) {
            let frame = frame?;
            if frame.seq > cutoff {
                retained.extend_from_slice(frame.raw);
                retained_records += 1;
            }
        }

        tracing::info!(
            cutoff,
            retained_records,
            retained_bytes = retained.len(),
            "truncating wal"
        );

        inner.file.set_len(0)?;
        inner.file.write_all(&retained)?;
        inner.file.sync_data()?;
        inner.last_fsync = Instant::now();
        inner.dirty = false;

        drop(inner);

        self.set_counters(retained.len() as u64, retained_records);

        Ok(())
    }
}
