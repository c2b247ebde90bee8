use std::ops::Bound;

use crossbeam_skiplist::{SkipMap, SkipSet};

use entitydb_core::EntityId;

use crate::intern::{intern, Sym};

/// Tag → entity skip-list.
///
/// Maps interned tag bodies to the ordered set of entity ids that have ever
/// carried that tag. Entries are append-only; supersession is implicit (the
/// caller filters by the entity's current state). Lock-free reads make this
/// safe to scan while the writer inserts.
#[derive(Default)]
pub struct TagIndex {
    map: SkipMap<Sym, SkipSet<EntityId>>,
}

impl TagIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, body: &str, id: &str) {
        let sym = intern(body);
        let entry = self.map.get_or_insert_with(sym, SkipSet::new);
        entry.value().insert(id.to_string());
    }

    pub fn ids_with(&self, body: &str) -> Vec<EntityId> {
        self.map
            .get(body)
            .map(|entry| entry.value().iter().map(|e| e.value().clone()).collect())
            .unwrap_or_default()
    }

    /// Ordered `(tag, id)` pairs for tags starting with `prefix`, resuming
    /// after the cursor pair when given. Returns up to `limit` pairs plus a
    /// flag for whether more remain.
    pub fn scan_prefix(
        &self,
        prefix: &str,
        after: Option<(&str, &str)>,
        limit: usize,
    ) -> (Vec<(String, EntityId)>, bool) {
        let start: Bound<&str> = match after {
            Some((tag, _)) => Bound::Included(tag),
            None => Bound::Included(prefix),
        };

        let mut out = Vec::with_capacity(limit.min(1024));
        let mut more = false;

        'outer: for entry in self.map.range::<str, _>((start, Bound::Unbounded)) {
            let tag = entry.key();

            if !tag.as_str().starts_with(prefix) {
                break;
            }

            let resume_id = match after {
                Some((cursor_tag, cursor_id)) if cursor_tag == tag.as_str() => Some(cursor_id),
                _ => None,
            };

            let ids = entry.value();
            let iter: Box<dyn Iterator<Item = _>> = match resume_id {
                Some(cursor_id) => Box::new(
                    ids.range::<str, _>((Bound::Excluded(cursor_id), Bound::Unbounded)),
                ),
                None => Box::new(ids.iter()),
            };

            for id in iter {
                if out.len() == limit {
                    more = true;
                    break 'outer;
                }

                out.push((tag.as_str().to_string(), id.value().clone()));
            }
        }

        (out, more)
    }

    pub fn remove_id(&self, body: &str, id: &str) {
        if let Some(entry) = self.map.get(body) {
            entry.value().remove(id);
        }
    }

    pub fn distinct_tags(&self) -> usize {
        self.map.len()
    }
}
