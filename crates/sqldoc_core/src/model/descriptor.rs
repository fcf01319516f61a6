//! Index descriptors: the map/reduce functions of one index over one entity
//! type in one collection.
//!
//! # Invariants
//! - Descriptors are plain records of function values; the typed index
//!   functions are erased to operate on [`IndexRow`] values.
//! - A reduce descriptor always carries a group key column name.

use crate::db::naming::validate_identifier;
use crate::error::{StoreError, StoreResult};
use crate::model::entity::Entity;
use crate::model::index::{Index, IndexRow, ReduceIndex};
use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

type MapFn = Arc<dyn Fn(&dyn Any) -> StoreResult<Vec<IndexRow>> + Send + Sync>;

/// Erased reduce functions of a [`ReduceIndex`] type.
#[derive(Clone, Copy)]
pub(crate) struct Reduction {
    pub(crate) group_key: &'static str,
    reduce: fn(Vec<IndexRow>) -> StoreResult<Option<IndexRow>>,
    delete: fn(IndexRow, Vec<IndexRow>) -> StoreResult<Option<IndexRow>>,
    update: fn(IndexRow, Vec<IndexRow>) -> StoreResult<IndexRow>,
}

impl Reduction {
    fn of<I: ReduceIndex>() -> Self {
        Self {
            group_key: I::GROUP_KEY,
            reduce: reduce_rows::<I>,
            delete: delete_rows::<I>,
            update: update_rows::<I>,
        }
    }

    pub(crate) fn reduce(&self, group: Vec<IndexRow>) -> StoreResult<Option<IndexRow>> {
        (self.reduce)(group)
    }

    pub(crate) fn delete(
        &self,
        index: IndexRow,
        removed: Vec<IndexRow>,
    ) -> StoreResult<Option<IndexRow>> {
        (self.delete)(index, removed)
    }

    pub(crate) fn update(&self, index: IndexRow, updated: Vec<IndexRow>) -> StoreResult<IndexRow> {
        (self.update)(index, updated)
    }
}

fn decode_all<I: Index>(rows: Vec<IndexRow>) -> StoreResult<Vec<I>> {
    rows.iter().map(IndexRow::decode::<I>).collect()
}

fn reduce_rows<I: ReduceIndex>(group: Vec<IndexRow>) -> StoreResult<Option<IndexRow>> {
    I::reduce(decode_all(group)?)
        .map(|index| IndexRow::encode(&index))
        .transpose()
}

fn delete_rows<I: ReduceIndex>(
    index: IndexRow,
    removed: Vec<IndexRow>,
) -> StoreResult<Option<IndexRow>> {
    let id = index.id();
    index
        .decode::<I>()?
        .delete(decode_all(removed)?)
        .map(|index| IndexRow::encode(&index).map(|row| row.with_id(id)))
        .transpose()
}

fn update_rows<I: ReduceIndex>(index: IndexRow, updated: Vec<IndexRow>) -> StoreResult<IndexRow> {
    let id = index.id();
    let index = index.decode::<I>()?.update(decode_all(updated)?);
    Ok(IndexRow::encode(&index)?.with_id(id))
}

/// Map (and optionally reduce) functions of one index type for one entity
/// type.
///
/// ```ignore
/// let stats = IndexDescriptor::reduce(|post: &Post| {
///     vec![PostStats { id: 0, post_id: post.post_id, count: 1 }]
/// });
/// ```
#[derive(Clone)]
pub struct IndexDescriptor {
    entity_type: TypeId,
    entity_name: &'static str,
    index_type: &'static str,
    collection: String,
    map: MapFn,
    reduction: Option<Reduction>,
}

impl IndexDescriptor {
    /// One index row per mapped value, linked to its document.
    pub fn map<T, I, F>(map: F) -> Self
    where
        T: Entity,
        I: Index,
        F: Fn(&T) -> Vec<I> + Send + Sync + 'static,
    {
        Self::build::<T, I, F>(map, None)
    }

    /// One index row per group-key value, aggregated with `I`'s reduce
    /// functions.
    pub fn reduce<T, I, F>(map: F) -> Self
    where
        T: Entity,
        I: ReduceIndex,
        F: Fn(&T) -> Vec<I> + Send + Sync + 'static,
    {
        Self::build::<T, I, F>(map, Some(Reduction::of::<I>()))
    }

    fn build<T, I, F>(map: F, reduction: Option<Reduction>) -> Self
    where
        T: Entity,
        I: Index,
        F: Fn(&T) -> Vec<I> + Send + Sync + 'static,
    {
        let map: MapFn = Arc::new(move |object: &dyn Any| {
            let cell = object.downcast_ref::<RefCell<T>>().ok_or_else(|| {
                StoreError::invalid_operation(format!(
                    "index `{}` cannot map a non-`{}` object",
                    I::INDEX_TYPE,
                    T::TYPE_NAME
                ))
            })?;
            let values = map(&*cell.borrow());
            values.iter().map(IndexRow::encode).collect()
        });

        Self {
            entity_type: TypeId::of::<T>(),
            entity_name: T::TYPE_NAME,
            index_type: I::INDEX_TYPE,
            collection: String::new(),
            map,
            reduction,
        }
    }

    /// Binds the descriptor to a named collection instead of the default one.
    pub fn in_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = collection.into();
        self
    }

    pub fn index_type(&self) -> &'static str {
        self.index_type
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn entity_name(&self) -> &'static str {
        self.entity_name
    }

    pub fn is_reduce(&self) -> bool {
        self.reduction.is_some()
    }

    pub(crate) fn entity_type(&self) -> TypeId {
        self.entity_type
    }

    pub(crate) fn reduction(&self) -> Option<&Reduction> {
        self.reduction.as_ref()
    }

    pub(crate) fn applies_to(&self, entity_type: TypeId, collection: &str) -> bool {
        self.entity_type == entity_type && self.collection == collection
    }

    /// Whether two descriptors produce the same physical rows.
    pub(crate) fn same_target(&self, other: &IndexDescriptor) -> bool {
        self.entity_type == other.entity_type
            && self.index_type == other.index_type
            && self.collection == other.collection
    }

    pub(crate) fn map_object(&self, object: &dyn Any) -> StoreResult<Vec<IndexRow>> {
        (self.map)(object)
    }

    pub(crate) fn validate(&self) -> StoreResult<()> {
        validate_identifier(self.index_type)?;
        if !self.collection.is_empty() {
            validate_identifier(&self.collection)?;
        }
        if let Some(reduction) = &self.reduction {
            validate_identifier(reduction.group_key)?;
        }
        Ok(())
    }
}

impl Debug for IndexDescriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexDescriptor")
            .field("entity", &self.entity_name)
            .field("index_type", &self.index_type)
            .field("collection", &self.collection)
            .field(
                "group_key",
                &self.reduction.as_ref().map(|reduction| reduction.group_key),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::IndexDescriptor;
    use crate::model::entity::{handle, Entity};
    use crate::model::index::{Index, IndexRow, ReduceIndex};
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use std::any::Any;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Debug, Serialize, Deserialize)]
    struct Comment {
        post_id: i64,
        words: Vec<String>,
    }

    impl Entity for Comment {
        const TYPE_NAME: &'static str = "Comment";
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct CommentCount {
        #[serde(rename = "PostId")]
        post_id: i64,
        #[serde(rename = "Count")]
        count: i64,
    }

    impl Index for CommentCount {
        const INDEX_TYPE: &'static str = "CommentCount";
    }

    impl ReduceIndex for CommentCount {
        const GROUP_KEY: &'static str = "PostId";

        fn reduce(group: Vec<Self>) -> Option<Self> {
            let post_id = group.first()?.post_id;
            Some(Self {
                post_id,
                count: group.iter().map(|entry| entry.count).sum(),
            })
        }

        fn delete(self, removed: Vec<Self>) -> Option<Self> {
            let count = self.count - removed.iter().map(|entry| entry.count).sum::<i64>();
            (count > 0).then_some(Self { count, ..self })
        }
    }

    fn count_descriptor() -> IndexDescriptor {
        IndexDescriptor::reduce(|comment: &Comment| {
            vec![CommentCount {
                post_id: comment.post_id,
                count: comment.words.len() as i64,
            }]
        })
    }

    fn row(post_id: i64, count: i64) -> IndexRow {
        IndexRow::encode(&CommentCount { post_id, count }).unwrap()
    }

    #[test]
    fn map_runs_typed_function_on_erased_object() {
        let descriptor = count_descriptor();
        let object = handle(Comment {
            post_id: 42,
            words: vec!["a".to_string(), "b".to_string()],
        });
        let erased: Rc<dyn Any> = object;

        let rows = descriptor.map_object(&*erased).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value("PostId"), Some(&json!(42)));
        assert_eq!(rows[0].value("Count"), Some(&json!(2)));
    }

    #[test]
    fn map_rejects_objects_of_another_type() {
        let descriptor = count_descriptor();
        let other: Rc<dyn Any> = Rc::new(RefCell::new(5_i64));
        assert!(descriptor.map_object(&*other).is_err());
    }

    #[test]
    fn erased_reduction_keeps_row_id_on_delete_and_update() {
        let descriptor = count_descriptor();
        let reduction = descriptor.reduction().unwrap();

        let reduced = reduction
            .reduce(vec![row(42, 1), row(42, 2)])
            .unwrap()
            .unwrap();
        assert_eq!(reduced.value("Count"), Some(&json!(3)));

        let persisted = reduced.with_id(9);
        let remaining = reduction
            .delete(persisted.clone(), vec![row(42, 1)])
            .unwrap()
            .unwrap();
        assert_eq!(remaining.id(), 9);
        assert_eq!(remaining.value("Count"), Some(&json!(2)));

        let gone = reduction.delete(persisted.clone(), vec![row(42, 3)]).unwrap();
        assert!(gone.is_none());

        let updated = reduction.update(persisted, vec![row(42, 3)]).unwrap();
        assert_eq!(updated.id(), 9);
    }

    #[test]
    fn collections_and_group_keys_are_validated() {
        assert!(count_descriptor().validate().is_ok());
        assert!(count_descriptor().in_collection("bad name").validate().is_err());
    }
}
