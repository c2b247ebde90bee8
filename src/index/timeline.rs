use std::{
    collections::{BTreeMap, BTreeSet},
    sync::RwLock,
};

use entitydb_core::{EntityId, TimestampNs};

/// Ordered-by-timestamp index over tag activity.
///
/// Two cooperating structures: an exact B-tree from timestamp to the ids
/// touched at that instant, and a coarse bucket map (default 1 h wide). A
/// `changed_since` scan takes whole buckets beyond the query point and only
/// fine-scans the boundary bucket, so long ranges never walk the exact tree.
pub struct Timeline {
    bucket_ns: u64,
    inner: RwLock<TimelineInner>,
}

#[derive(Default)]
struct TimelineInner {
    by_ts: BTreeMap<TimestampNs, BTreeSet<EntityId>>,
    buckets: BTreeMap<u64, BTreeSet<EntityId>>,
}

impl Timeline {
    pub fn new(bucket_ns: u64) -> Self {
        Self {
            bucket_ns: bucket_ns.max(1),
            inner: RwLock::new(TimelineInner::default()),
        }
    }

    fn bucket_of(&self, ts: TimestampNs) -> u64 {
        ts / self.bucket_ns
    }

    pub fn touch(&self, id: &str, ts: TimestampNs) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());

        inner
            .by_ts
            .entry(ts)
            .or_default()
            .insert(id.to_string());

        let bucket = ts / self.bucket_ns;
        inner
            .buckets
            .entry(bucket)
            .or_default()
            .insert(id.to_string());
    }

    /// Ids of entities with any tag timestamp `>= since`.
    pub fn changed_since(&self, since: TimestampNs) -> Vec<EntityId> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());

        let boundary_bucket = self.bucket_of(since);
        let mut out: BTreeSet<EntityId> = BTreeSet::new();

        // whole buckets beyond the boundary are matches by construction
        for (_, ids) in inner.buckets.range(boundary_bucket + 1..) {
            out.extend(ids.iter().cloned());
        }

        // the boundary bucket needs the exact tree
        let boundary_end = (boundary_bucket + 1).saturating_mul(self.bucket_ns);
        for (_, ids) in inner.by_ts.range(since..boundary_end) {
            out.extend(ids.iter().cloned());
        }

        out.into_iter().collect()
    }

    pub fn remove(&self, id: &str) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());

        inner.by_ts.retain(|_, ids| {
            ids.remove(id);
            !ids.is_empty()
        });

        inner.buckets.retain(|_, ids| {
            ids.remove(id);
            !ids.is_empty()
        });
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.by_ts.clear();
        inner.buckets.clear();
    }

    pub fn distinct_instants(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .by_ts
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: u64 = 3_600_000_000_000;

    #[test]
    fn changed_since_crosses_buckets() {
        let timeline = Timeline::new(HOUR);

        timeline.touch("old", HOUR / 2);
        timeline.touch("boundary", HOUR + 10);
        timeline.touch("later", 5 * HOUR);

        let mut since_start = timeline.changed_since(0);
        since_start.sort();
        assert_eq!(since_start, vec!["boundary", "later", "old"]);

        let mut recent = timeline.changed_since(HOUR);
        recent.sort();
        assert_eq!(recent, vec!["boundary", "later"]);

        assert_eq!(timeline.changed_since(5 * HOUR + 1), Vec::<String>::new());
    }

    #[test]
    fn boundary_bucket_is_exact() {
        let timeline = Timeline::new(HOUR);

        timeline.touch("before", HOUR + 5);
        timeline.touch("after", HOUR + 500);

        // both live in the same bucket; only the later one matches
        assert_eq!(timeline.changed_since(HOUR + 100), vec!["after"]);
    }

    #[test]
    fn remove_erases_every_trace() {
        let timeline = Timeline::new(HOUR);

        timeline.touch("gone", 10);
        timeline.touch("gone", HOUR * 2);
        timeline.touch("stays", 20);

        timeline.remove("gone");

        assert_eq!(timeline.changed_since(0), vec!["stays"]);
    }
}
