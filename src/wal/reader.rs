use tracing::{debug, warn};

use entitydb_core::{Entity, WalSeq, WriteOp};

use crate::format::{decode_wal_entity, WAL_MAGIC};

use super::{Wal, WalError, FRAME_PREFIX_LEN, FRAME_SUFFIX_LEN, WAL_VERSION};

/// Result of a full log scan.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplaySummary {
    /// Highest sequence seen in the log.
    pub last_seq: Option<WalSeq>,

    /// Valid records present in the log (including those below `from_seq`).
    pub records: u64,

    /// Bytes of valid log retained on disk.
    pub bytes: u64,

    /// A corrupt tail was cut off before normal service resumed.
    pub truncated_tail: bool,
}

pub(crate) struct Frame<'a> {
    pub seq: WalSeq,
    pub op: u32,
    pub payload: &'a [u8],
    pub raw: &'a [u8],
    pub end: usize,
}

/// Parses one frame at `pos`. `Ok(None)` is a clean end of log; any
/// structural or checksum problem is a corrupt frame.
pub(crate) fn parse_frame(buf: &[u8], pos: usize) -> Result<Option<Frame<'_>>, WalError> {
    if pos == buf.len() {
        return Ok(None);
    }

    let corrupt = || WalError::CorruptRecord { pos: pos as u64 };

    let rest = &buf[pos..];
    if rest.len() < FRAME_PREFIX_LEN + FRAME_SUFFIX_LEN {
        return Err(corrupt());
    }

    if rest[0..8] != WAL_MAGIC {
        return Err(corrupt());
    }

    let version = u32::from_le_bytes(rest[8..12].try_into().unwrap());
    if version != WAL_VERSION {
        return Err(corrupt());
    }

    let seq = u64::from_le_bytes(rest[12..20].try_into().unwrap());
    let op = u32::from_le_bytes(rest[20..24].try_into().unwrap());
    let payload_len = u32::from_le_bytes(rest[24..28].try_into().unwrap()) as usize;

    let total = FRAME_PREFIX_LEN + payload_len + FRAME_SUFFIX_LEN;
    if rest.len() < total {
        return Err(corrupt());
    }

    let payload = &rest[FRAME_PREFIX_LEN..FRAME_PREFIX_LEN + payload_len];
    let stored_crc =
        u32::from_le_bytes(rest[total - FRAME_SUFFIX_LEN..total].try_into().unwrap());

    if crc32fast::hash(payload) != stored_crc {
        return Err(corrupt());
    }

    Ok(Some(Frame {
        seq,
        op,
        payload,
        raw: &rest[..total],
        end: pos + total,
    }))
}

/// Iterates valid frames; the first corrupt frame surfaces as an error and
/// ends the iteration.
pub(crate) fn frames(buf: &[u8]) -> impl Iterator<Item = Result<Frame<'_>, WalError>> {
    let mut pos = 0;
    let mut fused = false;

    std::iter::from_fn(move || {
        if fused {
            return None;
        }

        match parse_frame(buf, pos) {
            Ok(None) => None,
            Ok(Some(frame)) => {
                pos = frame.end;
                Some(Ok(frame))
            }
            Err(e) => {
                fused = true;
                Some(Err(e))
            }
        }
    })
}

/// Is there any valid frame at or after `from`? Distinguishes a torn tail
/// (recoverable) from corruption in the middle of the log (fatal).
fn valid_frame_after(buf: &[u8], from: usize) -> bool {
    let mut search = from;

    while search + FRAME_PREFIX_LEN + FRAME_SUFFIX_LEN <= buf.len() {
        match buf[search..].windows(8).position(|w| w == WAL_MAGIC) {
            Some(found) => {
                let candidate = search + found;
                if matches!(parse_frame(buf, candidate), Ok(Some(_))) {
                    return true;
                }
                search = candidate + 1;
            }
            None => return false,
        }
    }

    false
}

impl Wal {
    /// Scans the log in order, verifying each record's CRC, and calls
    /// `apply` for every record with sequence `>= from_seq`.
    ///
    /// A corrupt record with nothing valid behind it is a torn tail: the log
    /// is truncated at the failure point and the scan reports success. A
    /// corrupt record followed by further valid records is mid-log damage
    /// and aborts with [`WalError::MidLogCorruption`].
    pub fn replay(
        &self,
        from_seq: WalSeq,
        mut apply: impl FnMut(WriteOp, Entity, WalSeq),
    ) -> Result<ReplaySummary, WalError> {
        let raw = std::fs::read(self.path())?;

        let mut pos = 0usize;
        let mut summary = ReplaySummary::default();

        loop {
            let step: Result<Option<(WriteOp, Entity, WalSeq, usize)>, WalError> =
                match parse_frame(&raw, pos) {
                    Ok(None) => Ok(None),
                    Ok(Some(frame)) => {
                        let op = WriteOp::from_code(frame.op)
                            .ok_or(WalError::CorruptRecord { pos: pos as u64 });

                        match op {
                            Ok(op) => match decode_wal_entity(frame.payload) {
                                Ok(entity) => Ok(Some((op, entity, frame.seq, frame.end))),
                                Err(_) => Err(WalError::CorruptRecord { pos: pos as u64 }),
                            },
                            Err(e) => Err(e),
                        }
                    }
                    Err(e) => Err(e),
                };

            match step {
                Ok(None) => break,
                Ok(Some((op, entity, seq, end))) => {
                    if seq >= from_seq {
                        apply(op, entity, seq);
                    }

                    summary.records += 1;
                    summary.last_seq = Some(summary.last_seq.map_or(seq, |s: u64| s.max(seq)));
                    pos = end;
                }
                Err(_) => {
                    if valid_frame_after(&raw, pos + 1) {
                        return Err(WalError::MidLogCorruption {
                            last_valid: summary.last_seq.unwrap_or_default(),
                        });
                    }

                    warn!(
                        pos,
                        total = raw.len(),
                        "torn wal tail detected, truncating"
                    );

                    let mut inner = self.lock_file();
                    inner.file.set_len(pos as u64)?;
                    inner.file.sync_data()?;
                    drop(inner);

                    summary.truncated_tail = true;
                    break;
                }
            }
        }

        summary.bytes = pos as u64;
        self.set_counters(summary.bytes, summary.records);

        debug!(
            records = summary.records,
            bytes = summary.bytes,
            last_seq = ?summary.last_seq,
            "wal scan complete"
        );

        Ok(summary)
    }
}
