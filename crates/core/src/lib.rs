//! Shared model and contracts for the EntityDB storage engine.
//!
//! Glossary:
//!  - `entity`: the atomic record of the system; an id, a multiset of
//!    timestamped tags and an optional content blob.
//!  - `tag`: a `ns:key:value` string stamped with a nanosecond timestamp at
//!    append time. Tags are never rewritten; the full version history of an
//!    entity lives in its tag timestamps.
//!  - `chunk entity`: a child entity holding one segment of a content blob
//!    that exceeded the auto-chunk threshold.

use std::time::{SystemTime, UNIX_EPOCH};

pub mod config;
pub mod context;
pub mod entity;
pub mod event;
pub mod store;
pub mod tag;

pub use config::*;
pub use context::*;
pub use entity::*;
pub use event::*;
pub use store::*;
pub use tag::*;

/// Nanoseconds since the Unix epoch.
pub type TimestampNs = u64;

/// Monotonic WAL sequence number.
pub type WalSeq = u64;

/// Index of a tag string in the on-disk tag dictionary.
pub type TagId = u32;

pub type EntityId = String;

/// Nominal length of a user-supplied entity id (UUID-shaped).
pub const ENTITY_ID_LEN: usize = 36;

/// Hard cap on id length; chunk entities extend their parent id with a
/// `-chunk-<index>` suffix which must still fit.
pub const MAX_ID_LEN: usize = 64;

pub fn now_ns() -> TimestampNs {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteOp {
    Create,
    Update,
    Delete,
}

impl WriteOp {
    pub fn code(&self) -> u32 {
        match self {
            WriteOp::Create => 1,
            WriteOp::Update => 2,
            WriteOp::Delete => 3,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(WriteOp::Create),
            2 => Some(WriteOp::Update),
            3 => Some(WriteOp::Delete),
            _ => None,
        }
    }
}

impl std::fmt::Display for WriteOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriteOp::Create => write!(f, "create"),
            WriteOp::Update => write!(f, "update"),
            WriteOp::Delete => write!(f, "delete"),
        }
    }
}

/// Outcome of a durable write.
///
/// `committed_after_cancel` flags a write whose caller cancelled after the
/// record already reached the WAL; the write is durable and callers treat the
/// ack as success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteAck {
    pub seq: WalSeq,
    pub committed_after_cancel: bool,
}

impl WriteAck {
    pub fn committed(seq: WalSeq) -> Self {
        Self {
            seq,
            committed_after_cancel: false,
        }
    }
}
