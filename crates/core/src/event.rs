use std::sync::Arc;

use crate::{EntityId, TimestampNs, WalSeq, WriteOp};

/// Synchronous notification of a committed write.
///
/// Hooks run inline on the writer path after the WAL append and index merge.
/// They must not call back into mutating operations; rate limiting is the
/// subscriber's problem.
#[derive(Debug, Clone)]
pub struct CommitEvent {
    pub op: WriteOp,
    pub id: EntityId,
    pub seq: WalSeq,
    pub at: TimestampNs,
    pub tag_count: usize,
    pub content_bytes: usize,
}

pub type CommitHook = Arc<dyn Fn(&CommitEvent) + Send + Sync>;
