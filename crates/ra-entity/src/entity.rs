//! Entity ownership, single-writer locking and commit classification
//!
//! Every tracked object lives in an [`EntityEntry`]. Holding a [`LockedEntityPtr`] is the
//! only way to read or change the entity, and at most one exists per entry at any instant.
//!
//! Mutations happen on a working copy that is only created once the caller declares intent:
//!
//! - [`LockedEntityPtr::enable_update`] makes the commit durable
//! - [`LockedEntityPtr::enable_in_memory_update`] makes it in-memory unless a durable update was
//!   also enabled in the same scope (the strongest request wins, in either order)
//! - [`LockedEntityPtr::insert`] and [`LockedEntityPtr::mark_for_delete`] are always durable
//!   for entities that have a stored row
//!
//! [`LockedEntityPtr::commit`] writes the row if needed and publishes the working copy. A
//! failed write leaves the committed value untouched, so nothing of the failed scope is ever
//! observable. Dropping the pointer without committing discards the working copy.

use crate::store::{LfumStore, RowType, StoreOperationType};
use async_lock::{Mutex, MutexGuardArc};
use ra_core::{RaError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

/// Object managed by the entity framework
pub trait Entity: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    /// Key type
    type Id: Clone + Eq + Hash + fmt::Display + fmt::Debug + Send + Sync + 'static;

    /// Row type under which the entity is persisted
    const ROW_TYPE: RowType;

    /// Key of this entity
    fn entity_id(&self) -> Self::Id;
}

/// Committed value of an entry
#[derive(Debug)]
pub(crate) struct EntitySlot<T> {
    pub(crate) value: Option<T>,
    pub(crate) persisted: bool,
}

/// Shared owner of one entity
pub struct EntityEntry<T: Entity> {
    id: T::Id,
    slot: Arc<Mutex<EntitySlot<T>>>,
    store: Arc<dyn LfumStore>,
}

impl<T: Entity> fmt::Debug for EntityEntry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityEntry").field("id", &self.id).finish()
    }
}

impl<T: Entity> EntityEntry<T> {
    /// Empty placeholder entry
    pub fn new(id: T::Id, store: Arc<dyn LfumStore>) -> Self {
        Self {
            id,
            slot: Arc::new(Mutex::new(EntitySlot {
                value: None,
                persisted: false,
            })),
            store,
        }
    }

    /// Entry holding a value that already has a stored row
    pub(crate) fn loaded(value: T, store: Arc<dyn LfumStore>) -> Self {
        Self {
            id: value.entity_id(),
            slot: Arc::new(Mutex::new(EntitySlot {
                value: Some(value),
                persisted: true,
            })),
            store,
        }
    }

    /// Key of the entry
    pub fn id(&self) -> &T::Id {
        &self.id
    }

    /// Wait until no other locker holds the entry, then lock it
    pub async fn lock(self: &Arc<Self>) -> LockedEntityPtr<T> {
        let guard = self.slot.lock_arc().await;
        LockedEntityPtr::new(Arc::clone(self), guard)
    }

    /// Lock the entry if it is free
    pub fn try_lock(self: &Arc<Self>) -> Option<LockedEntityPtr<T>> {
        self.slot
            .try_lock_arc()
            .map(|guard| LockedEntityPtr::new(Arc::clone(self), guard))
    }

    /// Clone of the committed value
    pub async fn snapshot(self: &Arc<Self>) -> Option<T> {
        self.slot.lock().await.value.clone()
    }
}

/// Classification of a commit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitDescription {
    /// Store operation implied by the scope
    pub operation: StoreOperationType,
    /// Whether the store write is skipped
    pub is_in_memory_operation: bool,
}

/// Result of a commit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Nothing changed
    NoOp,
    /// The value changed in memory only
    InMemory,
    /// The row was written
    Durable(StoreOperationType),
}

/// Tracks which gating calls happened during one lock scope
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateContext {
    update_enabled: bool,
    in_memory_update_enabled: bool,
    delete_marked: bool,
}

impl UpdateContext {
    /// Request a durable commit
    pub fn enable_update(&mut self) {
        self.update_enabled = true;
    }

    /// Request an in-memory commit
    pub fn enable_in_memory_update(&mut self) {
        self.in_memory_update_enabled = true;
    }

    /// Request deletion
    pub fn mark_for_delete(&mut self) {
        self.delete_marked = true;
    }

    /// Whether deletion was requested
    pub fn is_delete_marked(&self) -> bool {
        self.delete_marked
    }

    /// Whether any mutation was requested
    pub fn is_dirty(&self) -> bool {
        self.update_enabled || self.in_memory_update_enabled || self.delete_marked
    }

    /// Commit implied by this scope; `None` for a no-op
    ///
    /// `persisted` tells whether the entity already has a stored row.
    pub fn commit_description(&self, persisted: bool) -> Option<CommitDescription> {
        if self.delete_marked {
            return Some(CommitDescription {
                operation: StoreOperationType::Delete,
                is_in_memory_operation: !persisted,
            });
        }

        let operation = if persisted {
            StoreOperationType::Update
        } else {
            StoreOperationType::Insert
        };

        if self.update_enabled {
            Some(CommitDescription {
                operation,
                is_in_memory_operation: false,
            })
        } else if self.in_memory_update_enabled {
            Some(CommitDescription {
                operation,
                is_in_memory_operation: true,
            })
        } else {
            None
        }
    }
}

/// Exclusive handle to one entity for the duration of a lock scope
pub struct LockedEntityPtr<T: Entity> {
    entry: Arc<EntityEntry<T>>,
    guard: MutexGuardArc<EntitySlot<T>>,
    working: Option<T>,
    context: UpdateContext,
}

impl<T: Entity> fmt::Debug for LockedEntityPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockedEntityPtr")
            .field("id", self.entry.id())
            .field("context", &self.context)
            .finish()
    }
}

impl<T: Entity> LockedEntityPtr<T> {
    fn new(entry: Arc<EntityEntry<T>>, guard: MutexGuardArc<EntitySlot<T>>) -> Self {
        Self {
            entry,
            guard,
            working: None,
            context: UpdateContext::default(),
        }
    }

    /// Key of the locked entry
    pub fn id(&self) -> &T::Id {
        self.entry.id()
    }

    /// The entry this pointer locks
    pub fn entry(&self) -> &Arc<EntityEntry<T>> {
        &self.entry
    }

    /// Current value as seen by this scope
    pub fn get(&self) -> Option<&T> {
        if self.context.is_delete_marked() {
            return None;
        }
        self.working.as_ref().or(self.guard.value.as_ref())
    }

    /// Whether the entity exists in this scope
    pub fn is_present(&self) -> bool {
        self.get().is_some()
    }

    /// Gating calls made so far
    pub fn context(&self) -> &UpdateContext {
        &self.context
    }

    /// Mutable access with a durable commit
    ///
    /// # Panics
    ///
    /// If the entity is absent or marked for delete.
    pub fn enable_update(&mut self) -> &mut T {
        self.context.enable_update();
        self.working_mut()
    }

    /// Mutable access with an in-memory commit
    ///
    /// # Panics
    ///
    /// If the entity is absent or marked for delete.
    pub fn enable_in_memory_update(&mut self) -> &mut T {
        self.context.enable_in_memory_update();
        self.working_mut()
    }

    /// Populate an absent entry
    ///
    /// # Panics
    ///
    /// If the entity is already present.
    pub fn insert(&mut self, value: T) {
        assert!(
            !self.is_present(),
            "insert into entity {} which is already present",
            self.entry.id()
        );
        self.context = UpdateContext::default();
        self.context.enable_update();
        self.working = Some(value);
    }

    /// Remove the entity on commit
    pub fn mark_for_delete(&mut self) {
        self.context.mark_for_delete();
        self.working = None;
    }

    fn working_mut(&mut self) -> &mut T {
        assert!(
            !self.context.is_delete_marked(),
            "update of entity {} after mark_for_delete",
            self.entry.id()
        );
        let committed = &self.guard.value;
        let id = self.entry.id();
        self.working.get_or_insert_with(|| match committed {
            Some(value) => value.clone(),
            None => panic!("update of absent entity {id}"),
        })
    }

    /// Persist according to the scope's gating calls
    ///
    /// The lock stays held, so follow-up bookkeeping that must agree with the committed value
    /// can run before the pointer is dropped. The scope is reset either way; committing again
    /// without new gating calls is a no-op.
    pub async fn commit(&mut self) -> Result<CommitOutcome> {
        let context = std::mem::take(&mut self.context);
        let persisted = self.guard.persisted;
        let Some(description) = context.commit_description(persisted) else {
            return Ok(CommitOutcome::NoOp);
        };

        if description.is_in_memory_operation {
            if context.is_delete_marked() {
                self.guard.value = None;
            } else if let Some(working) = self.working.take() {
                self.guard.value = Some(working);
            }
            return Ok(CommitOutcome::InMemory);
        }

        let key = self.entry.id().to_string();
        let data = match (&description.operation, self.working.take()) {
            (StoreOperationType::Delete, _) => None,
            (_, Some(working)) => match bincode::serialize(&working) {
                Ok(data) => {
                    self.working = Some(working);
                    Some(data)
                }
                Err(err) => return Err(err.into()),
            },
            (_, None) => {
                return Err(RaError::internal(format!(
                    "durable commit of entity {key} without a value"
                )))
            }
        };

        if let Err(err) = self
            .entry
            .store
            .write(description.operation, T::ROW_TYPE, &key, data)
            .await
        {
            tracing::error!(entity = %key, operation = ?description.operation, error = %err, "commit failed; rolling back");
            self.working = None;
            return Err(match err {
                RaError::Storage { .. } => err,
                other => RaError::storage(other.to_string()),
            });
        }

        match description.operation {
            StoreOperationType::Delete => {
                self.guard.value = None;
                self.guard.persisted = false;
            }
            StoreOperationType::Insert | StoreOperationType::Update => {
                self.guard.value = self.working.take();
                self.guard.persisted = true;
            }
        }
        Ok(CommitOutcome::Durable(description.operation))
    }
}
