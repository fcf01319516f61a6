//! Entity contract, shared handles and per-type erased operations.
//!
//! # Responsibility
//! - Let any `serde` type be persisted as a document.
//! - Resolve id/version accessors once per type instead of per call.
//! - Provide reference-identity keys for tracked objects.
//!
//! # Invariants
//! - Object identity is the address of the shared handle, never value equality.
//! - An `EntityRef` only ever wraps a `RefCell<T>` for its own `EntityType`.

use crate::error::{StoreError, StoreResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::fmt::{Debug, Formatter};
use std::rc::Rc;
use std::sync::Arc;

/// Shared handle to a session-tracked object.
///
/// Sessions track handles by address: two handles are the same object only if
/// they point at the same allocation.
pub type Handle<T> = Rc<RefCell<T>>;

/// Wraps a value into a [`Handle`].
pub fn handle<T>(value: T) -> Handle<T> {
    Rc::new(RefCell::new(value))
}

/// Get/set function pair for an integer field (document id or version).
pub struct Accessor<T> {
    get: fn(&T) -> i64,
    set: fn(&mut T, i64),
}

impl<T> Accessor<T> {
    pub const fn new(get: fn(&T) -> i64, set: fn(&mut T, i64)) -> Self {
        Self { get, set }
    }

    pub fn get(&self, target: &T) -> i64 {
        (self.get)(target)
    }

    pub fn set(&self, target: &mut T, value: i64) {
        (self.set)(target, value)
    }
}

impl<T> Clone for Accessor<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Accessor<T> {}

/// A type that can be stored as a document.
///
/// # Contract
/// - `TYPE_NAME` is written to the document `Type` column and must be unique
///   per store.
/// - When an id accessor is present, new ids are written back through it and
///   a positive id marks the object as already persisted.
/// - When a version accessor is present, the persisted version is written
///   back before serialization; a non-zero local version is the expected
///   prior version of a concurrency-checked update.
pub trait Entity: Serialize + DeserializeOwned + 'static {
    const TYPE_NAME: &'static str;

    fn id_accessor() -> Option<Accessor<Self>> {
        None
    }

    fn version_accessor() -> Option<Accessor<Self>> {
        None
    }
}

struct ErasedAccessor {
    get: Box<dyn Fn(&dyn Any) -> Option<i64> + Send + Sync>,
    set: Box<dyn Fn(&dyn Any, i64) + Send + Sync>,
}

impl ErasedAccessor {
    fn of<T: Entity>(accessor: Accessor<T>) -> Self {
        Self {
            get: Box::new(move |object| {
                object
                    .downcast_ref::<RefCell<T>>()
                    .map(|cell| accessor.get(&cell.borrow()))
            }),
            set: Box::new(move |object, value| {
                if let Some(cell) = object.downcast_ref::<RefCell<T>>() {
                    accessor.set(&mut cell.borrow_mut(), value);
                }
            }),
        }
    }
}

/// Type-erased operations of one entity type, resolved once per store.
pub struct EntityType {
    type_id: TypeId,
    name: &'static str,
    to_value: fn(&dyn Any) -> StoreResult<Value>,
    from_value: fn(Value) -> StoreResult<Rc<dyn Any>>,
    id: Option<ErasedAccessor>,
    version: Option<ErasedAccessor>,
}

impl EntityType {
    pub(crate) fn of<T: Entity>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            name: T::TYPE_NAME,
            to_value: entity_to_value::<T>,
            from_value: entity_from_value::<T>,
            id: T::id_accessor().map(ErasedAccessor::of),
            version: T::version_accessor().map(ErasedAccessor::of),
        }
    }

    /// `TypeId` of the entity type itself.
    pub fn rust_type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn has_id_accessor(&self) -> bool {
        self.id.is_some()
    }

    pub fn has_version_accessor(&self) -> bool {
        self.version.is_some()
    }

    pub(crate) fn from_value(&self, value: Value) -> StoreResult<Rc<dyn Any>> {
        (self.from_value)(value)
    }
}

impl Debug for EntityType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityType")
            .field("name", &self.name)
            .field("id_accessor", &self.id.is_some())
            .field("version_accessor", &self.version.is_some())
            .finish()
    }
}

fn entity_to_value<T: Entity>(object: &dyn Any) -> StoreResult<Value> {
    let cell = object.downcast_ref::<RefCell<T>>().ok_or_else(|| {
        StoreError::invalid_operation(format!("object is not a `{}` entity", T::TYPE_NAME))
    })?;
    let value = serde_json::to_value(&*cell.borrow())?;
    Ok(value)
}

fn entity_from_value<T: Entity>(value: Value) -> StoreResult<Rc<dyn Any>> {
    let entity: T = serde_json::from_value(value)?;
    let object: Rc<dyn Any> = Rc::new(RefCell::new(entity));
    Ok(object)
}

/// Reference-identity key of a tracked object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ObjectKey(usize);

impl ObjectKey {
    pub(crate) fn of<T>(handle: &Handle<T>) -> Self {
        Self(Rc::as_ptr(handle) as *const () as usize)
    }
}

/// Type-erased tracked object plus its resolved entity type.
#[derive(Clone)]
pub(crate) struct EntityRef {
    object: Rc<dyn Any>,
    entity_type: Arc<EntityType>,
}

impl EntityRef {
    pub(crate) fn new<T: Entity>(handle: &Handle<T>, entity_type: Arc<EntityType>) -> Self {
        let object: Rc<dyn Any> = handle.clone();
        Self {
            object,
            entity_type,
        }
    }

    pub(crate) fn from_object(object: Rc<dyn Any>, entity_type: Arc<EntityType>) -> Self {
        Self {
            object,
            entity_type,
        }
    }

    pub(crate) fn key(&self) -> ObjectKey {
        ObjectKey(Rc::as_ptr(&self.object) as *const () as usize)
    }

    pub(crate) fn entity_type(&self) -> &Arc<EntityType> {
        &self.entity_type
    }

    pub(crate) fn object(&self) -> &dyn Any {
        &*self.object
    }

    pub(crate) fn downcast<T: Entity>(&self) -> Option<Handle<T>> {
        Rc::clone(&self.object).downcast::<RefCell<T>>().ok()
    }

    pub(crate) fn to_value(&self) -> StoreResult<Value> {
        (self.entity_type.to_value)(self.object())
    }

    pub(crate) fn id(&self) -> Option<i64> {
        let accessor = self.entity_type.id.as_ref()?;
        (accessor.get)(self.object())
    }

    pub(crate) fn set_id(&self, id: i64) {
        if let Some(accessor) = self.entity_type.id.as_ref() {
            (accessor.set)(self.object(), id);
        }
    }

    pub(crate) fn version(&self) -> Option<i64> {
        let accessor = self.entity_type.version.as_ref()?;
        (accessor.get)(self.object())
    }

    pub(crate) fn set_version(&self, version: i64) {
        if let Some(accessor) = self.entity_type.version.as_ref() {
            (accessor.set)(self.object(), version);
        }
    }
}

impl Debug for EntityRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityRef")
            .field("type", &self.entity_type.name)
            .field("key", &self.key())
            .finish()
    }
}
