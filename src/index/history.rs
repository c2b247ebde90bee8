use std::{collections::HashMap, sync::RwLock};

use entitydb_core::{EntityId, TimestampNs, WalSeq, WriteOp};

/// One mutation point in an entity's life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryPoint {
    pub at: TimestampNs,
    pub seq: WalSeq,
    pub op: WriteOp,

    /// Whether this mutation carried a content version.
    pub content: bool,
}

/// Per-entity list of mutation points, ascending by timestamp.
#[derive(Default)]
pub struct HistoryIndex {
    inner: RwLock<HashMap<EntityId, Vec<HistoryPoint>>>,
}

impl HistoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, id: &str, point: HistoryPoint) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let points = inner.entry(id.to_string()).or_default();

        // appends are chronological in steady state; replay may interleave
        let pos = points.partition_point(|p| p.at <= point.at);
        points.insert(pos, point);
    }

    pub fn points(&self, id: &str) -> Vec<HistoryPoint> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn range(&self, id: &str, from: TimestampNs, to: TimestampNs) -> Vec<HistoryPoint> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .map(|points| {
                points
                    .iter()
                    .filter(|p| p.at >= from && p.at <= to)
                    .copied()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn remove(&self, id: &str) {
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
    }

    pub fn clear(&self) {
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(at: TimestampNs, seq: WalSeq, op: WriteOp) -> HistoryPoint {
        HistoryPoint {
            at,
            seq,
            op,
            content: false,
        }
    }

    #[test]
    fn points_stay_sorted() {
        let history = HistoryIndex::new();
        history.push("e1", point(30, 2, WriteOp::Update));
        history.push("e1", point(10, 0, WriteOp::Create));
        history.push("e1", point(20, 1, WriteOp::Update));

        let ats: Vec<_> = history.points("e1").iter().map(|p| p.at).collect();
        assert_eq!(ats, vec![10, 20, 30]);
    }

    #[test]
    fn range_is_inclusive() {
        let history = HistoryIndex::new();
        for (i, at) in [10u64, 20, 30, 40].iter().enumerate() {
            history.push("e1", point(*at, i as u64, WriteOp::Update));
        }

        let window: Vec<_> = history.range("e1", 20, 30).iter().map(|p| p.at).collect();
        assert_eq!(window, vec![20, 30]);
        assert!(history.range("missing", 0, 100).is_empty());
    }
}
