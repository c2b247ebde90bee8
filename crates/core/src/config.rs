use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

/// How the loader treats tag timestamps that are not in `u64-ns|` form.
///
/// Older files stamped tags with RFC 3339 strings. Strict mode refuses such
/// files; normalize mode rewrites them to nanoseconds while loading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LegacyTagMode {
    #[default]
    Strict,
    Normalize,
}

/// Configuration recognized by the storage engine.
///
/// The enclosing program decides how to populate this; no CLI or environment
/// parsing happens here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory holding `entities.ebf`, `entitydb.wal` and the lock file.
    pub data_path: PathBuf,

    /// Size of each chunk entity's content segment.
    pub chunk_size: u64,

    /// Content above this size is split into chunk entities.
    pub auto_chunk_threshold: u64,

    pub max_tags_per_entity: usize,

    pub checkpoint_interval_secs: u64,
    pub checkpoint_wal_bytes: u64,
    pub checkpoint_wal_records: u64,

    /// Width of the timeline coarsening buckets.
    pub index_time_bucket_secs: u64,

    pub bloom_fp_rate: f64,

    pub writer_queue_depth: usize,

    /// How long a checkpoint waits for in-flight writes to drain before
    /// proceeding anyway.
    pub checkpoint_stall_limit_ms: u64,

    /// Group-commit window for WAL fsync.
    pub fsync_group_window_ms: u64,

    pub legacy_tags: LegacyTagMode,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from("./var"),
            chunk_size: 4 * 1024 * 1024,
            auto_chunk_threshold: 4 * 1024 * 1024,
            max_tags_per_entity: 4096,
            checkpoint_interval_secs: 300,
            checkpoint_wal_bytes: 100 * 1024 * 1024,
            checkpoint_wal_records: 1_000_000,
            index_time_bucket_secs: 3600,
            bloom_fp_rate: 0.01,
            writer_queue_depth: 10_000,
            checkpoint_stall_limit_ms: 2_000,
            fsync_group_window_ms: 5,
            legacy_tags: LegacyTagMode::default(),
        }
    }
}

impl EngineConfig {
    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_secs(self.checkpoint_interval_secs)
    }

    pub fn checkpoint_stall_limit(&self) -> Duration {
        Duration::from_millis(self.checkpoint_stall_limit_ms)
    }

    pub fn fsync_group_window(&self) -> Duration {
        Duration::from_millis(self.fsync_group_window_ms)
    }

    pub fn index_time_bucket_ns(&self) -> u64 {
        self.index_time_bucket_secs.saturating_mul(1_000_000_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.data_path, PathBuf::from("./var"));
        assert_eq!(config.chunk_size, 4 * 1024 * 1024);
        assert_eq!(config.auto_chunk_threshold, 4 * 1024 * 1024);
        assert_eq!(config.max_tags_per_entity, 4096);
        assert_eq!(config.checkpoint_interval(), Duration::from_secs(300));
        assert_eq!(config.checkpoint_wal_bytes, 100 * 1024 * 1024);
        assert_eq!(config.checkpoint_wal_records, 1_000_000);
        assert_eq!(config.index_time_bucket_ns(), 3_600_000_000_000);
        assert_eq!(config.bloom_fp_rate, 0.01);
        assert_eq!(config.writer_queue_depth, 10_000);
        assert_eq!(config.legacy_tags, LegacyTagMode::Strict);
    }

    #[test]
    fn partial_config_deserializes_with_defaults() {
        let parsed: EngineConfig =
            serde_json::from_str(r#"{"chunk_size": 1024, "legacy_tags": "normalize"}"#).unwrap();

        assert_eq!(parsed.chunk_size, 1024);
        assert_eq!(parsed.legacy_tags, LegacyTagMode::Normalize);
        assert_eq!(parsed.max_tags_per_entity, 4096);
    }
}
