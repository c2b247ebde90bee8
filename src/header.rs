//! HeaderSync: exclusive owner of the in-memory header image.
//!
//! Every header mutation goes through [`HeaderSync::update`], which validates
//! the result before it becomes visible; an invalid mutation is rejected and
//! the previous image survives. Checkpoints bracket their multi-step rewrite
//! with [`HeaderSync::snapshot`] / [`HeaderSync::restore`].
//!
//! There is no entity counter here or anywhere else: `entity_count` is set
//! from `len(index)` inside an update closure at the moment a header is
//! persisted, which makes a count/index mismatch impossible by construction.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, RwLock,
};

use thiserror::Error;

use entitydb_core::{StoreError, WalSeq};

use crate::format::{FormatError, Header};

#[derive(Debug, Error)]
pub enum HeaderError {
    #[error("header update rejected: {0}")]
    Invalid(#[source] FormatError),
}

impl From<HeaderError> for StoreError {
    fn from(value: HeaderError) -> Self {
        StoreError::HeaderInvalid(value.to_string())
    }
}

/// A consistent header image taken before a risky multi-step operation.
#[derive(Debug, Clone, Copy)]
pub struct Snapshot {
    header: Header,
    wal_sequence: WalSeq,
}

impl Snapshot {
    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn wal_sequence(&self) -> WalSeq {
        self.wal_sequence
    }
}

pub struct HeaderSync {
    inner: RwLock<Header>,

    /// Next WAL sequence to hand out. Kept outside the lock so the WAL
    /// append fast path never touches the header lock.
    wal_sequence: Arc<AtomicU64>,
}

impl HeaderSync {
    /// Takes ownership of a header loaded from disk (already repaired and
    /// structurally valid). Seeds the sequence counter from the persisted
    /// value; the caller raises it further after the WAL scan.
    pub fn new(header: Header) -> Self {
        Self {
            wal_sequence: Arc::new(AtomicU64::new(header.wal_sequence)),
            inner: RwLock::new(header),
        }
    }

    /// Value copy of the current image.
    pub fn get(&self) -> Header {
        *self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Applies `f` to a copy of the header, validates the result and commits
    /// it. On validation failure the previous image is preserved.
    ///
    /// The checksum is recomputed after `f` runs, so closures only assign
    /// semantic fields. No other lock may be acquired inside `f`.
    pub fn update(&self, f: impl FnOnce(&mut Header)) -> Result<Header, HeaderError> {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());

        let mut next = *guard;
        f(&mut next);
        next.seal();

        next.validate().map_err(HeaderError::Invalid)?;

        *guard = next;
        Ok(next)
    }

    pub fn snapshot(&self) -> Snapshot {
        let guard = self.inner.read().unwrap_or_else(|e| e.into_inner());

        Snapshot {
            header: *guard,
            wal_sequence: self.wal_sequence.load(Ordering::SeqCst),
        }
    }

    /// Atomically reinstates a snapshot taken earlier. Used when a
    /// checkpoint fails after partially staging new header fields.
    pub fn restore(&self, snapshot: Snapshot) {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        *guard = snapshot.header;

        // never move the sequence backwards; later appends may exist
        self.wal_sequence
            .fetch_max(snapshot.wal_sequence, Ordering::SeqCst);
    }

    /// Shared handle to the sequence counter for the WAL append path.
    pub fn sequence_handle(&self) -> Arc<AtomicU64> {
        self.wal_sequence.clone()
    }

    pub fn current_sequence(&self) -> WalSeq {
        self.wal_sequence.load(Ordering::SeqCst)
    }

    /// Raises the counter to `at_least` (used after WAL replay discovers
    /// sequences beyond the persisted value).
    pub fn advance_sequence(&self, at_least: WalSeq) {
        self.wal_sequence.fetch_max(at_least, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::HEADER_SIZE;

    fn sync_with_empty() -> HeaderSync {
        HeaderSync::new(Header::empty())
    }

    #[test]
    fn update_commits_valid_changes() {
        let sync = sync_with_empty();

        let updated = sync
            .update(|h| {
                h.file_size = 4096;
                h.data_size = 512;
                h.entity_count = 3;
                h.last_modified = 1_700_000_000;
            })
            .unwrap();

        assert_eq!(updated.entity_count, 3);
        assert_eq!(sync.get(), updated);
        assert!(sync.get().validate().is_ok());
    }

    #[test]
    fn invalid_update_is_rejected_and_discarded() {
        let sync = sync_with_empty();
        let before = sync.get();

        let result = sync.update(|h| {
            // classic corruption this subsystem exists to stop
            h.wal_offset = 0;
        });

        assert!(matches!(result, Err(HeaderError::Invalid(_))));
        assert_eq!(sync.get(), before);
    }

    #[test]
    fn update_rejects_sections_past_eof() {
        let sync = sync_with_empty();

        let result = sync.update(|h| {
            h.tag_dict_offset = HEADER_SIZE;
            h.tag_dict_size = 10_000;
        });

        assert!(result.is_err());
    }

    #[test]
    fn snapshot_restore_round_trip() {
        let sync = sync_with_empty();

        let snapshot = sync.snapshot();

        sync.update(|h| {
            h.file_size = 9999;
            h.entity_count = 42;
        })
        .unwrap();
        assert_eq!(sync.get().entity_count, 42);

        sync.restore(snapshot);
        assert_eq!(sync.get().entity_count, 0);
        assert_eq!(sync.get().file_size, HEADER_SIZE);
    }

    #[test]
    fn restore_never_rewinds_sequence() {
        let sync = sync_with_empty();
        let snapshot = sync.snapshot();

        let seq = sync.sequence_handle();
        seq.fetch_add(10, std::sync::atomic::Ordering::SeqCst);

        sync.restore(snapshot);
        assert_eq!(sync.current_sequence(), 10);
    }

    #[test]
    fn sequence_is_persisted_by_the_closure() {
        let sync = sync_with_empty();
        sync.advance_sequence(77);

        let seq = sync.current_sequence();
        let updated = sync.update(|h| h.wal_sequence = seq).unwrap();
        assert_eq!(updated.wal_sequence, 77);
    }
}
