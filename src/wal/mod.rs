//! Append-only write-ahead log.
//!
//! Every mutating call becomes durable here before it is acknowledged.
//! Records are self-delimiting frames:
//!
//! ```text
//! magic(8) | version(4) | seq(u64) | op(u32) | payload_len(u32) |
//! payload | crc32(payload)
//! ```
//!
//! Sequence numbers come from the `HeaderSync` atomic so they stay monotonic
//! across restarts. Replay stops at the first corrupted record: a corrupt
//! tail is truncated before service resumes, corruption in the middle of the
//! log refuses startup.

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use thiserror::Error;

use entitydb_core::{StoreError, WalSeq};

use crate::format::FormatError;

mod reader;
mod writer;

pub use reader::ReplaySummary;

pub const WAL_VERSION: u32 = 1;

/// Fixed bytes before the payload: magic + version + seq + op + payload_len.
pub const FRAME_PREFIX_LEN: usize = 8 + 4 + 8 + 4 + 4;

/// Trailing CRC32 over the payload.
pub const FRAME_SUFFIX_LEN: usize = 4;

#[derive(Debug, Error)]
pub enum WalError {
    #[error("corrupt wal record at byte {pos}")]
    CorruptRecord { pos: u64 },

    #[error("wal corruption mid-log after sequence {last_valid}")]
    MidLogCorruption { last_valid: WalSeq },

    #[error(transparent)]
    Format(#[from] FormatError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<WalError> for StoreError {
    fn from(value: WalError) -> Self {
        match value {
            WalError::MidLogCorruption { last_valid } => StoreError::WalCorruption(last_valid),
            WalError::Io(e) => StoreError::Io(e),
            other => StoreError::Corrupt(other.to_string()),
        }
    }
}

pub(crate) struct WalFile {
    pub file: std::fs::File,
    pub last_fsync: Instant,
    pub dirty: bool,
}

/// The log itself. One per database directory.
pub struct Wal {
    path: PathBuf,
    seq: Arc<AtomicU64>,
    window: Duration,
    inner: Mutex<WalFile>,
    bytes: AtomicU64,
    records: AtomicU64,
}

impl Wal {
    /// Opens (or creates) the log file. `seq` is the shared next-sequence
    /// counter owned by HeaderSync.
    pub fn open(
        path: impl Into<PathBuf>,
        seq: Arc<AtomicU64>,
        window: Duration,
    ) -> Result<Self, WalError> {
        let path = path.into();

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)?;

        let len = file.metadata()?.len();

        Ok(Self {
            path,
            seq,
            window,
            inner: Mutex::new(WalFile {
                file,
                last_fsync: Instant::now(),
                dirty: false,
            }),
            bytes: AtomicU64::new(len),
            records: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Bytes in the log since the last truncation.
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Records in the log since the last truncation.
    pub fn records(&self) -> u64 {
        self.records.load(Ordering::Relaxed)
    }

    pub(crate) fn set_counters(&self, bytes: u64, records: u64) {
        self.bytes.store(bytes, Ordering::Relaxed);
        self.records.store(records, Ordering::Relaxed);
    }

    pub(crate) fn lock_file(&self) -> std::sync::MutexGuard<'_, WalFile> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn next_seq(&self) -> WalSeq {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn window(&self) -> Duration {
        self.window
    }

    pub(crate) fn bump_counters(&self, frame_len: u64) {
        self.bytes.fetch_add(frame_len, Ordering::Relaxed);
        self.records.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use entitydb_core::{Entity, Tag, WriteOp};

    fn temp_wal(seq_start: u64) -> (tempfile::TempDir, Wal) {
        let dir = tempfile::tempdir().unwrap();
        let seq = Arc::new(AtomicU64::new(seq_start));
        let wal = Wal::open(
            dir.path().join("entitydb.wal"),
            seq,
            Duration::from_millis(0),
        )
        .unwrap();
        (dir, wal)
    }

    fn entity(id: &str) -> Entity {
        Entity {
            id: id.into(),
            tags: vec![Tag::new(100, "type:document")],
            content: Some(b"payload".to_vec()),
        }
    }

    #[test]
    fn append_then_replay() {
        let (_dir, wal) = temp_wal(0);

        let a = wal.append(WriteOp::Create, &entity("e1")).unwrap();
        let b = wal.append(WriteOp::Update, &entity("e1")).unwrap();
        assert_eq!((a, b), (0, 1));

        let mut seen = Vec::new();
        let summary = wal
            .replay(0, |op, e, seq| seen.push((op, e.id, seq)))
            .unwrap();

        assert_eq!(summary.last_seq, Some(1));
        assert_eq!(summary.records, 2);
        assert!(!summary.truncated_tail);
        assert_eq!(
            seen,
            vec![
                (WriteOp::Create, "e1".to_string(), 0),
                (WriteOp::Update, "e1".to_string(), 1),
            ]
        );
    }

    #[test]
    fn replay_skips_before_from_seq() {
        let (_dir, wal) = temp_wal(10);

        wal.append(WriteOp::Create, &entity("e1")).unwrap();
        wal.append(WriteOp::Create, &entity("e2")).unwrap();

        let mut seen = Vec::new();
        wal.replay(11, |_, e, _| seen.push(e.id)).unwrap();
        assert_eq!(seen, vec!["e2".to_string()]);
    }

    #[test]
    fn corrupt_tail_is_truncated() {
        let (_dir, wal) = temp_wal(0);

        wal.append(WriteOp::Create, &entity("e1")).unwrap();
        wal.append(WriteOp::Create, &entity("e2")).unwrap();
        wal.sync().unwrap();

        // chop the last record in half
        let raw = std::fs::read(wal.path()).unwrap();
        std::fs::OpenOptions::new()
            .write(true)
            .open(wal.path())
            .unwrap()
            .set_len(raw.len() as u64 - 10)
            .unwrap();

        let mut seen = Vec::new();
        let summary = wal.replay(0, |_, e, _| seen.push(e.id)).unwrap();

        assert!(summary.truncated_tail);
        assert_eq!(seen, vec!["e1".to_string()]);

        // the file is clean again
        let summary = wal.replay(0, |_, _, _| {}).unwrap();
        assert!(!summary.truncated_tail);
        assert_eq!(summary.records, 1);
    }

    #[test]
    fn mid_log_corruption_is_fatal() {
        let (_dir, wal) = temp_wal(0);

        wal.append(WriteOp::Create, &entity("e1")).unwrap();
        let first_end = wal.bytes();
        wal.append(WriteOp::Create, &entity("e2")).unwrap();
        wal.sync().unwrap();

        // flip a payload byte inside the first record, leaving the second valid
        let mut raw = std::fs::read(wal.path()).unwrap();
        raw[FRAME_PREFIX_LEN + 2] ^= 0xff;
        std::fs::write(wal.path(), &raw).unwrap();
        assert!(first_end < raw.len() as u64);

        let result = wal.replay(0, |_, _, _| {});
        assert!(matches!(result, Err(WalError::MidLogCorruption { .. })));
    }

    #[test]
    fn truncate_to_preserves_later_records() {
        let (_dir, wal) = temp_wal(0);

        wal.append(WriteOp::Create, &entity("e1")).unwrap();
        wal.append(WriteOp::Create, &entity("e2")).unwrap();
        wal.append(WriteOp::Create, &entity("e3")).unwrap();

        wal.truncate_to(1).unwrap();

        let mut seen = Vec::new();
        let summary = wal.replay(0, |_, e, seq| seen.push((e.id, seq))).unwrap();
        assert_eq!(seen, vec![("e3".to_string(), 2)]);
        assert_eq!(summary.records, 1);
    }

    #[test]
    fn sequences_resume_monotonically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("entitydb.wal");

        {
            let seq = Arc::new(AtomicU64::new(0));
            let wal = Wal::open(&path, seq, Duration::from_millis(0)).unwrap();
            wal.append(WriteOp::Create, &entity("e1")).unwrap();
            wal.append(WriteOp::Create, &entity("e2")).unwrap();
            wal.sync().unwrap();
        }

        // reopen pretending the persisted counter lagged behind
        let seq = Arc::new(AtomicU64::new(1));
        let wal = Wal::open(&path, seq.clone(), Duration::from_millis(0)).unwrap();
        let summary = wal.replay(0, |_, _, _| {}).unwrap();

        let next = summary.last_seq.map(|s| s + 1).unwrap_or_default();
        seq.fetch_max(next, Ordering::SeqCst);

        let assigned = wal.append(WriteOp::Create, &entity("e3")).unwrap();
        assert_eq!(assigned, 2);
    }
}
