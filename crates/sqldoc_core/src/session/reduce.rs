//! Reduction engine: merges staged reduce deltas with persisted reduce rows
//! into at most one command per (index type, group-key value).
//!
//! # Invariants
//! - Exactly one persisted row per group value: an existing row is updated
//!   in place (keeping its id) or deleted, never duplicated.
//! - A document id both added to and removed from a group within one flush
//!   produces no bridge write.

use super::state::{MapState, StagedIndex};
use crate::command::{Command, IndexLinks};
use crate::error::{StoreError, StoreResult};
use crate::model::descriptor::IndexDescriptor;
use crate::model::index::{group_key_of, IndexRow};
use serde_json::Value;
use std::collections::HashSet;

/// Source of persisted reduce rows.
pub(crate) trait PersistedReductions {
    fn find_reduced(
        &mut self,
        descriptor: &IndexDescriptor,
        group_key: &str,
        group_value: &Value,
    ) -> StoreResult<Option<IndexRow>>;
}

fn not_unique() -> StoreError {
    StoreError::invalid_operation(
        "the reduction on a grouped set should have resulted in a unique result",
    )
}

/// Computes the reduce index commands of one collection.
pub(crate) fn reduce_collection(
    collection: &str,
    maps: &[StagedIndex],
    persisted: &mut dyn PersistedReductions,
) -> StoreResult<Vec<Command>> {
    let mut commands = Vec::new();

    for staged in maps {
        let Some(reduction) = staged.descriptor.reduction() else {
            continue;
        };
        let group_key = reduction.group_key;

        let mut groups: Vec<(String, &Value)> = Vec::new();
        for delta in &staged.deltas {
            let value = delta.row.group_value(group_key)?;
            let key = group_key_of(value);
            if !groups.iter().any(|(existing, _)| *existing == key) {
                groups.push((key, value));
            }
        }

        for (key, group_value) in groups {
            let mut new_rows = Vec::new();
            let mut updated_rows = Vec::new();
            let mut deleted_rows = Vec::new();
            let mut added = Vec::new();
            let mut removed = Vec::new();

            for delta in &staged.deltas {
                if group_key_of(delta.row.group_value(group_key)?) != key {
                    continue;
                }
                match delta.state {
                    MapState::New => {
                        new_rows.push(delta.row.clone());
                        added.push(delta.document_id);
                    }
                    MapState::Update => updated_rows.push(delta.row.clone()),
                    MapState::Delete => {
                        deleted_rows.push(delta.row.clone());
                        removed.push(delta.document_id);
                    }
                }
            }

            let candidate = if new_rows.is_empty() {
                None
            } else {
                Some(reduction.reduce(new_rows)?.ok_or_else(not_unique)?)
            };

            let stored = persisted.find_reduced(&staged.descriptor, group_key, group_value)?;

            let mut index = match (&stored, candidate) {
                (Some(stored), Some(candidate)) => Some(
                    reduction
                        .reduce(vec![stored.clone(), candidate])?
                        .ok_or_else(not_unique)?,
                ),
                (Some(stored), None) => Some(stored.clone()),
                (None, candidate) => candidate,
            };

            if let Some(current) = index.take() {
                index = if deleted_rows.is_empty() {
                    Some(current)
                } else {
                    reduction.delete(current, deleted_rows)?
                };
            }
            if let Some(current) = index.take() {
                index = Some(if updated_rows.is_empty() {
                    current
                } else {
                    reduction.update(current, updated_rows)?
                });
            }

            let (added, removed) = net_links(added, removed);

            match (stored, index) {
                (Some(stored), None) => commands.push(Command::DeleteReduceIndex {
                    collection: collection.to_string(),
                    index_type: staged.descriptor.index_type(),
                    index_id: stored.id(),
                }),
                (Some(stored), Some(index)) => commands.push(Command::UpdateIndex {
                    collection: collection.to_string(),
                    row: index.with_id(stored.id()),
                    added,
                    removed,
                }),
                (None, Some(index)) => commands.push(Command::CreateIndex {
                    collection: collection.to_string(),
                    row: index,
                    links: IndexLinks::Bridge(added),
                }),
                (None, None) => {}
            }
        }
    }

    Ok(commands)
}

/// Drops ids present in both lists and duplicates within each list.
fn net_links(added: Vec<i64>, removed: Vec<i64>) -> (Vec<i64>, Vec<i64>) {
    let added_set = added.iter().copied().collect::<HashSet<_>>();
    let removed_set = removed.iter().copied().collect::<HashSet<_>>();

    let mut seen = HashSet::new();
    let added = added
        .into_iter()
        .filter(|id| !removed_set.contains(id) && seen.insert(*id))
        .collect();
    let mut seen = HashSet::new();
    let removed = removed
        .into_iter()
        .filter(|id| !added_set.contains(id) && seen.insert(*id))
        .collect();
    (added, removed)
}

#[cfg(test)]
mod tests {
    use super::{net_links, reduce_collection, PersistedReductions};
    use crate::command::{Command, IndexLinks};
    use crate::error::{StoreError, StoreResult};
    use crate::model::descriptor::IndexDescriptor;
    use crate::model::entity::Entity;
    use crate::model::index::{group_key_of, Index, IndexRow, ReduceIndex};
    use crate::session::state::{MapDelta, MapState, StagedIndex};
    use serde::{Deserialize, Serialize};
    use serde_json::{json, Value};
    use std::collections::HashMap;

    #[derive(Serialize, Deserialize)]
    struct Post {
        post_id: i64,
    }

    impl Entity for Post {
        const TYPE_NAME: &'static str = "Post";
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Stats {
        #[serde(rename = "Id", default)]
        id: i64,
        #[serde(rename = "PostId")]
        post_id: i64,
        #[serde(rename = "Count")]
        count: i64,
    }

    impl Index for Stats {
        const INDEX_TYPE: &'static str = "Stats";
    }

    impl ReduceIndex for Stats {
        const GROUP_KEY: &'static str = "PostId";

        fn reduce(group: Vec<Self>) -> Option<Self> {
            let post_id = group.first()?.post_id;
            Some(Self {
                id: 0,
                post_id,
                count: group.iter().map(|entry| entry.count).sum(),
            })
        }

        fn delete(self, removed: Vec<Self>) -> Option<Self> {
            let count = self.count - removed.len() as i64;
            (count > 0).then_some(Self { count, ..self })
        }
    }

    #[derive(Serialize, Deserialize)]
    struct Broken {
        #[serde(rename = "PostId")]
        post_id: i64,
    }

    impl Index for Broken {
        const INDEX_TYPE: &'static str = "Broken";
    }

    impl ReduceIndex for Broken {
        const GROUP_KEY: &'static str = "PostId";

        fn reduce(_group: Vec<Self>) -> Option<Self> {
            None
        }

        fn delete(self, _removed: Vec<Self>) -> Option<Self> {
            None
        }
    }

    #[derive(Default)]
    struct FakeRows {
        rows: HashMap<String, IndexRow>,
        lookups: usize,
    }

    impl PersistedReductions for FakeRows {
        fn find_reduced(
            &mut self,
            _descriptor: &IndexDescriptor,
            _group_key: &str,
            group_value: &Value,
        ) -> StoreResult<Option<IndexRow>> {
            self.lookups += 1;
            Ok(self.rows.get(&group_key_of(group_value)).cloned())
        }
    }

    fn stats_descriptor() -> IndexDescriptor {
        IndexDescriptor::reduce(|post: &Post| {
            vec![Stats {
                id: 0,
                post_id: post.post_id,
                count: 1,
            }]
        })
    }

    fn delta(post_id: i64, document_id: i64, state: MapState) -> MapDelta {
        MapDelta {
            row: IndexRow::encode(&Stats {
                id: 0,
                post_id,
                count: 1,
            })
            .unwrap(),
            document_id,
            state,
        }
    }

    fn staged(deltas: Vec<MapDelta>) -> Vec<StagedIndex> {
        vec![StagedIndex {
            descriptor: stats_descriptor(),
            deltas,
        }]
    }

    fn persisted(post_id: i64, count: i64, id: i64) -> FakeRows {
        let row = IndexRow::encode(&Stats {
            id,
            post_id,
            count,
        })
        .unwrap();
        let mut fake = FakeRows::default();
        fake.rows.insert(group_key_of(&json!(post_id)), row);
        fake
    }

    #[test]
    fn new_group_becomes_one_created_row() {
        let maps = staged(vec![
            delta(42, 1, MapState::New),
            delta(42, 2, MapState::New),
            delta(7, 3, MapState::New),
        ]);
        let mut fake = FakeRows::default();
        let commands = reduce_collection("", &maps, &mut fake).unwrap();

        assert_eq!(commands.len(), 2);
        assert_eq!(fake.lookups, 2);
        match &commands[0] {
            Command::CreateIndex { row, links, .. } => {
                assert_eq!(row.value("PostId"), Some(&json!(42)));
                assert_eq!(row.value("Count"), Some(&json!(2)));
                assert_eq!(links, &IndexLinks::Bridge(vec![1, 2]));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn new_entries_merge_into_persisted_row() {
        let maps = staged(vec![delta(42, 3, MapState::New)]);
        let mut fake = persisted(42, 2, 9);
        let commands = reduce_collection("", &maps, &mut fake).unwrap();

        match &commands[..] {
            [Command::UpdateIndex {
                row,
                added,
                removed,
                ..
            }] => {
                assert_eq!(row.id(), 9);
                assert_eq!(row.value("Count"), Some(&json!(3)));
                assert_eq!(added, &vec![3]);
                assert!(removed.is_empty());
            }
            other => panic!("unexpected commands {other:?}"),
        }
    }

    #[test]
    fn deleting_contributions_updates_then_removes_the_row() {
        let maps = staged(vec![delta(42, 1, MapState::Delete)]);

        let mut two = persisted(42, 2, 9);
        let commands = reduce_collection("", &maps, &mut two).unwrap();
        match &commands[..] {
            [Command::UpdateIndex { row, removed, .. }] => {
                assert_eq!(row.value("Count"), Some(&json!(1)));
                assert_eq!(removed, &vec![1]);
            }
            other => panic!("unexpected commands {other:?}"),
        }

        let mut one = persisted(42, 1, 9);
        let commands = reduce_collection("", &maps, &mut one).unwrap();
        assert!(matches!(
            &commands[..],
            [Command::DeleteReduceIndex { index_id: 9, .. }]
        ));
    }

    #[test]
    fn added_and_removed_same_document_writes_no_links() {
        let maps = staged(vec![
            delta(42, 5, MapState::Delete),
            delta(42, 5, MapState::New),
        ]);
        let mut fake = persisted(42, 1, 9);
        let commands = reduce_collection("", &maps, &mut fake).unwrap();

        match &commands[..] {
            [Command::UpdateIndex { added, removed, .. }] => {
                assert!(added.is_empty());
                assert!(removed.is_empty());
            }
            other => panic!("unexpected commands {other:?}"),
        }
    }

    #[test]
    fn document_keeping_fewer_entries_in_a_group_stays_linked() {
        let maps = staged(vec![
            delta(42, 5, MapState::Delete),
            delta(42, 5, MapState::Delete),
            delta(42, 5, MapState::New),
        ]);
        let mut fake = persisted(42, 2, 9);
        let commands = reduce_collection("", &maps, &mut fake).unwrap();

        match &commands[..] {
            [Command::UpdateIndex {
                row,
                added,
                removed,
                ..
            }] => {
                assert_eq!(row.value("Count"), Some(&json!(1)));
                assert!(added.is_empty());
                assert!(removed.is_empty());
            }
            other => panic!("unexpected commands {other:?}"),
        }
    }

    #[test]
    fn update_entries_keep_the_persisted_row_and_links() {
        let maps = staged(vec![delta(42, 5, MapState::Update)]);
        let mut fake = persisted(42, 3, 9);
        let commands = reduce_collection("", &maps, &mut fake).unwrap();

        match &commands[..] {
            [Command::UpdateIndex {
                row,
                added,
                removed,
                ..
            }] => {
                assert_eq!(row.id(), 9);
                assert_eq!(row.value("Count"), Some(&json!(3)));
                assert!(added.is_empty());
                assert!(removed.is_empty());
            }
            other => panic!("unexpected commands {other:?}"),
        }
    }

    #[test]
    fn nothing_persisted_and_nothing_left_emits_nothing() {
        let maps = staged(vec![delta(42, 1, MapState::Delete)]);
        let mut fake = FakeRows::default();
        assert!(reduce_collection("", &maps, &mut fake).unwrap().is_empty());
    }

    #[test]
    fn reduce_without_result_is_invalid_operation() {
        let maps = vec![StagedIndex {
            descriptor: IndexDescriptor::reduce(|post: &Post| {
                vec![Broken {
                    post_id: post.post_id,
                }]
            }),
            deltas: vec![MapDelta {
                row: IndexRow::encode(&Broken { post_id: 1 }).unwrap(),
                document_id: 1,
                state: MapState::New,
            }],
        }];
        let err = reduce_collection("", &maps, &mut FakeRows::default()).unwrap_err();
        assert!(matches!(err, StoreError::InvalidOperation(_)));
    }

    #[test]
    fn net_links_drop_common_and_duplicate_ids() {
        let (added, removed) = net_links(vec![1, 2, 2, 3], vec![3, 4]);
        assert_eq!(added, vec![1, 2]);
        assert_eq!(removed, vec![4]);
    }
}
