//! Temporal queries over the in-memory indexes.
//!
//! Everything here is read-only: as-of and diff walk a single record's tag
//! timeline, history expands the per-entity mutation list into snapshots,
//! and changes-since goes through the bucketed timeline index.

use std::collections::BTreeSet;

use itertools::Itertools;

use entitydb_core::{
    Change, ChangeKind, Entity, EntityVersion, StoreError, TimestampNs,
};

use crate::index::EntityIndex;

/// The entity as it existed at `at`: tags stamped at or before `at` and the
/// newest content version no younger than `at`.
pub fn as_of(index: &EntityIndex, id: &str, at: TimestampNs) -> Result<Entity, StoreError> {
    index
        .with_record(id, |record| {
            let tags = record.tags_as_of(at);
            if tags.is_empty() {
                return None;
            }

            Some(Entity {
                id: id.to_string(),
                tags,
                content: record.content_as_of(at).map(|c| c.to_vec()),
            })
        })
        .flatten()
        .ok_or_else(|| StoreError::NotFound(id.to_string()))
}

/// Snapshots at each mutation point in `[from, to]`, ascending, capped at
/// `limit` (0 means no cap).
pub fn history(
    index: &EntityIndex,
    id: &str,
    from: TimestampNs,
    to: TimestampNs,
    limit: usize,
) -> Result<Vec<EntityVersion>, StoreError> {
    if !index.contains(id) {
        return Err(StoreError::NotFound(id.to_string()));
    }

    let cap = if limit == 0 { usize::MAX } else { limit };

    index
        .history()
        .range(id, from, to)
        .iter()
        .map(|p| p.at)
        .dedup()
        .take(cap)
        .map(|at| {
            as_of(index, id, at).map(|entity| EntityVersion { at, entity })
        })
        .collect()
}

/// Entities with any tag stamped at or after `at`, oldest change first.
/// Logically deleted entities are skipped.
pub fn changes_since(
    index: &EntityIndex,
    at: TimestampNs,
    limit: usize,
) -> Result<Vec<Entity>, StoreError> {
    let cap = if limit == 0 { usize::MAX } else { limit };

    let entities = index
        .timeline()
        .changed_since(at)
        .into_iter()
        .filter_map(|id| {
            index
                .with_record(&id, |record| {
                    if record.is_deleted() {
                        return None;
                    }

                    Some((record.last_modified().unwrap_or_default(), id.clone()))
                })
                .flatten()
        })
        .sorted()
        .take(cap)
        .filter_map(|(_, id)| index.get(&id))
        .collect();

    Ok(entities)
}

fn visible_bodies(entity: &Entity) -> BTreeSet<&str> {
    entity
        .tags
        .iter()
        .filter(|t| !t.is_hidden())
        .map(|t| t.body.as_str())
        .collect()
}

fn split(body: &str) -> (&str, &str) {
    entitydb_core::split_ns_key(body)
}

/// Classified tag-set difference between two points in an entity's life.
///
/// A body present only at `t2` is `added` unless it pairs with a same-prefix
/// body that vanished, in which case the pair is one `modified` change.
/// Tags are append-only so `removed` and `modified` only show up on
/// reverse-time diffs; the classification is symmetric regardless.
pub fn diff(
    index: &EntityIndex,
    id: &str,
    t1: TimestampNs,
    t2: TimestampNs,
) -> Result<Vec<Change>, StoreError> {
    let before = as_of(index, id, t1)?;
    let after = as_of(index, id, t2)?;

    let b1 = visible_bodies(&before);
    let b2 = visible_bodies(&after);

    let only_before: Vec<&str> = b1.difference(&b2).copied().collect();
    let only_after: Vec<&str> = b2.difference(&b1).copied().collect();

    let mut consumed: BTreeSet<&str> = BTreeSet::new();
    let mut changes = Vec::new();

    for body in &only_after {
        let (ns_key, new_value) = split(body);

        let replaced = only_before
            .iter()
            .find(|old| !consumed.contains(*old) && split(old).0 == ns_key);

        match replaced {
            Some(old) => {
                consumed.insert(*old);
                changes.push(Change {
                    kind: ChangeKind::Modified,
                    ns_key: ns_key.to_string(),
                    old_value: Some(split(old).1.to_string()),
                    new_value: Some(new_value.to_string()),
                });
            }
            None => changes.push(Change {
                kind: ChangeKind::Added,
                ns_key: ns_key.to_string(),
                old_value: None,
                new_value: Some(new_value.to_string()),
            }),
        }
    }

    for body in &only_before {
        if consumed.contains(body) {
            continue;
        }

        let (ns_key, old_value) = split(body);
        changes.push(Change {
            kind: ChangeKind::Removed,
            ns_key: ns_key.to_string(),
            old_value: Some(old_value.to_string()),
            new_value: None,
        });
    }

    Ok(changes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use entitydb_core::{Tag, WriteOp};

    const HOUR: u64 = 3_600_000_000_000;

    fn index() -> EntityIndex {
        EntityIndex::new(HOUR, 0.01).unwrap()
    }

    fn apply(idx: &EntityIndex, op: WriteOp, id: &str, tags: &[(u64, &str)], content: Option<&[u8]>) {
        let entity = Entity {
            id: id.into(),
            tags: tags.iter().map(|(ts, body)| Tag::new(*ts, *body)).collect(),
            content: content.map(|c| c.to_vec()),
        };
        idx.apply(op, &entity, 0);
    }

    fn seed_document(idx: &EntityIndex) {
        apply(
            idx,
            WriteOp::Create,
            "e2",
            &[(10, "type:doc"), (10, "status:draft")],
            None,
        );
        apply(idx, WriteOp::Update, "e2", &[(20, "status:published")], None);
    }

    #[test]
    fn as_of_projects_by_timestamp() {
        let idx = index();
        seed_document(&idx);

        let early = as_of(&idx, "e2", 10).unwrap();
        assert_eq!(early.tags_stripped(), vec!["type:doc", "status:draft"]);

        let late = as_of(&idx, "e2", 25).unwrap();
        assert!(late.has_tag("status:draft"));
        assert!(late.has_tag("status:published"));

        assert!(matches!(
            as_of(&idx, "e2", 5),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn as_of_selects_content_version() {
        let idx = index();
        apply(
            &idx,
            WriteOp::Create,
            "e1",
            &[(10, "type:doc"), (10, "content:version:10")],
            Some(b"v1"),
        );
        apply(
            &idx,
            WriteOp::Update,
            "e1",
            &[(20, "content:version:20")],
            Some(b"v2"),
        );

        assert_eq!(
            as_of(&idx, "e1", 15).unwrap().content.as_deref(),
            Some(b"v1".as_slice())
        );
        assert_eq!(
            as_of(&idx, "e1", 20).unwrap().content.as_deref(),
            Some(b"v2".as_slice())
        );
    }

    #[test]
    fn history_walks_mutation_points() {
        let idx = index();
        seed_document(&idx);

        let versions = history(&idx, "e2", 0, 100, 0).unwrap();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[0].at, 10);
        assert_eq!(versions[1].at, 20);
        assert_eq!(versions[0].entity.tags.len(), 2);
        assert_eq!(versions[1].entity.tags.len(), 3);

        let limited = history(&idx, "e2", 0, 100, 1).unwrap();
        assert_eq!(limited.len(), 1);

        assert!(history(&idx, "nope", 0, 100, 0).is_err());
    }

    #[test]
    fn changes_since_skips_deleted() {
        let idx = index();
        seed_document(&idx);
        apply(&idx, WriteOp::Create, "e3", &[(30, "type:doc")], None);
        apply(&idx, WriteOp::Delete, "e3", &[(40, "status:deleted")], None);

        let changed = changes_since(&idx, 0, 0).unwrap();
        let ids: Vec<_> = changed.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["e2"]);
    }

    #[test]
    fn diff_classifies_additions() {
        let idx = index();
        seed_document(&idx);

        let changes = diff(&idx, "e2", 10, 20).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ChangeKind::Added);
        assert_eq!(changes[0].ns_key, "status");
        assert_eq!(changes[0].new_value.as_deref(), Some("published"));
    }

    #[test]
    fn diff_is_symmetric_in_reverse() {
        let idx = index();
        seed_document(&idx);

        let changes = diff(&idx, "e2", 20, 10).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ChangeKind::Removed);
        assert_eq!(changes[0].old_value.as_deref(), Some("published"));
    }

    #[test]
    fn diff_round_trips_onto_as_of() {
        let idx = index();
        seed_document(&idx);

        let before = as_of(&idx, "e2", 10).unwrap();
        let after = as_of(&idx, "e2", 20).unwrap();
        let changes = diff(&idx, "e2", 10, 20).unwrap();

        let mut bodies: BTreeSet<String> = before
            .tags_stripped()
            .into_iter()
            .map(str::to_string)
            .collect();

        for change in &changes {
            let new_body = |v: &str| format!("{}:{}", change.ns_key, v);
            match change.kind {
                ChangeKind::Added => {
                    bodies.insert(new_body(change.new_value.as_ref().unwrap()));
                }
                ChangeKind::Removed => {
                    bodies.remove(&new_body(change.old_value.as_ref().unwrap()));
                }
                ChangeKind::Modified => {
                    bodies.remove(&new_body(change.old_value.as_ref().unwrap()));
                    bodies.insert(new_body(change.new_value.as_ref().unwrap()));
                }
            }
        }

        let target: BTreeSet<String> = after
            .tags_stripped()
            .into_iter()
            .map(str::to_string)
            .collect();

        assert_eq!(bodies, target);
    }
}
