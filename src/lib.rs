//! EntityDB: a single-node temporal database with an append-only binary
//! storage engine.
//!
//! The engine keeps every entity in memory behind a set of cooperating
//! indexes, makes each mutation durable through a write-ahead log before it
//! is acknowledged, and periodically checkpoints the whole state into the
//! memory-mapped main file. Every tag carries a nanosecond timestamp, which
//! is what the temporal queries (as-of, history, changes-since, diff) are
//! built on.
//!
//! The data model, store trait, error kinds and configuration live in
//! [`entitydb_core`]; this crate is the storage engine proper.

pub mod chunk;
pub mod format;
pub mod header;
pub mod index;
pub mod intern;
pub mod pool;
pub mod reader;
pub mod shard;
pub mod store;
pub mod temporal;
pub mod wal;
pub mod writer;

pub use entitydb_core as core;

pub use store::{EntityDb, LOCK_FILE, MAIN_FILE, WAL_FILE};
