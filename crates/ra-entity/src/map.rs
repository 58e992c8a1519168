//! Keyed collection of entity entries backed by the store

use crate::entity::{Entity, EntityEntry, LockedEntityPtr};
use crate::store::LfumStore;
use parking_lot::RwLock;
use ra_core::Result;
use std::collections::HashMap;
use std::sync::Arc;

/// All entries of one entity type
///
/// The map owns the entries; sets and timers hold weak references only.
pub struct EntityMap<T: Entity> {
    entries: RwLock<HashMap<T::Id, Arc<EntityEntry<T>>>>,
    store: Arc<dyn LfumStore>,
}

impl<T: Entity> EntityMap<T> {
    /// Create an empty map over `store`
    pub fn new(store: Arc<dyn LfumStore>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            store,
        }
    }

    /// Store backing the map
    pub fn store(&self) -> &Arc<dyn LfumStore> {
        &self.store
    }

    /// Entry for `id`, creating an empty placeholder when `create_if_missing` is set
    pub fn get_or_create_entry(
        &self,
        id: &T::Id,
        create_if_missing: bool,
    ) -> Option<Arc<EntityEntry<T>>> {
        if let Some(entry) = self.entries.read().get(id) {
            return Some(Arc::clone(entry));
        }
        if !create_if_missing {
            return None;
        }

        let mut entries = self.entries.write();
        let entry = entries
            .entry(id.clone())
            .or_insert_with(|| Arc::new(EntityEntry::new(id.clone(), Arc::clone(&self.store))));
        Some(Arc::clone(entry))
    }

    /// Entry for `id` if it exists
    pub fn get_entry(&self, id: &T::Id) -> Option<Arc<EntityEntry<T>>> {
        self.get_or_create_entry(id, false)
    }

    /// Snapshot of all entries
    pub fn entries(&self) -> Vec<Arc<EntityEntry<T>>> {
        self.entries.read().values().cloned().collect()
    }

    /// Number of entries, including empty placeholders
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the map has no entries
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Rehydrate every row of the entity's row type
    pub async fn load(&self) -> Result<usize> {
        let rows = self.store.enumerate(T::ROW_TYPE).await?;
        let mut loaded = Vec::with_capacity(rows.len());
        for (key, data) in rows {
            let value: T = bincode::deserialize(&data)?;
            tracing::debug!(entity = %key, "loaded entity from store");
            loaded.push(value);
        }

        let count = loaded.len();
        let mut entries = self.entries.write();
        for value in loaded {
            let id = value.entity_id();
            entries.insert(
                id,
                Arc::new(EntityEntry::loaded(value, Arc::clone(&self.store))),
            );
        }
        Ok(count)
    }

    /// Whether `entry` is the entry the map currently holds for its id
    pub fn is_live(&self, entry: &Arc<EntityEntry<T>>) -> bool {
        self.entries
            .read()
            .get(entry.id())
            .is_some_and(|live| Arc::ptr_eq(live, entry))
    }

    /// Lock the live entry for `id`
    ///
    /// A waiter whose entry was evicted while it queued for the lock looks the id up again,
    /// so the returned pointer always belongs to the map. `None` when the entry is missing
    /// and `create_if_missing` is not set.
    pub async fn lock_entry(
        &self,
        id: &T::Id,
        create_if_missing: bool,
    ) -> Option<LockedEntityPtr<T>> {
        loop {
            let entry = self.get_or_create_entry(id, create_if_missing)?;
            let locked = entry.lock().await;
            if self.is_live(&entry) {
                return Some(locked);
            }
            tracing::trace!(entity = %id, "entry evicted while waiting for its lock");
        }
    }

    /// Evict the entry `locked` points at if it holds no entity
    ///
    /// Runs under the entity lock, so nobody can populate the entry concurrently. Callers
    /// queued on the evicted entry find it gone once they acquire it and retry through
    /// [`lock_entry`](Self::lock_entry). Returns whether the entry was removed.
    pub fn remove_if_empty(&self, locked: &LockedEntityPtr<T>) -> bool {
        if locked.is_present() {
            return false;
        }
        let mut entries = self.entries.write();
        let is_live = entries
            .get(locked.id())
            .is_some_and(|live| Arc::ptr_eq(live, locked.entry()));
        if !is_live {
            return false;
        }
        entries.remove(locked.id());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::tests::TestEntity;
    use crate::store::InMemoryLfumStore;

    #[tokio::test]
    async fn test_get_or_create() {
        let map: EntityMap<TestEntity> = EntityMap::new(Arc::new(InMemoryLfumStore::new()));
        assert!(map.get_entry(&1).is_none());
        let a = map.get_or_create_entry(&1, true).unwrap();
        let b = map.get_or_create_entry(&1, true).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(map.len(), 1);
    }

    #[tokio::test]
    async fn test_load_rehydrates_committed_rows() {
        let store = Arc::new(InMemoryLfumStore::new());
        let map: EntityMap<TestEntity> = EntityMap::new(store.clone());
        for id in 1..=3 {
            let entry = map.get_or_create_entry(&id, true).unwrap();
            let mut locked = entry.lock().await;
            locked.insert(TestEntity::new(id, i64::from(id) * 10));
            locked.commit().await.unwrap();
        }

        let reloaded: EntityMap<TestEntity> = EntityMap::new(store);
        assert_eq!(reloaded.load().await.unwrap(), 3);
        let entry = reloaded.get_entry(&2).unwrap();
        assert_eq!(entry.snapshot().await.unwrap().value, 20);

        let mut locked = entry.lock().await;
        locked.enable_update().value = 21;
        assert_eq!(
            locked.commit().await.unwrap(),
            crate::entity::CommitOutcome::Durable(crate::store::StoreOperationType::Update)
        );
    }

    #[tokio::test]
    async fn test_remove_if_empty() {
        let map: EntityMap<TestEntity> = EntityMap::new(Arc::new(InMemoryLfumStore::new()));
        let mut locked = map.lock_entry(&1, true).await.unwrap();
        locked.insert(TestEntity::new(1, 0));
        locked.commit().await.unwrap();
        assert!(!map.remove_if_empty(&locked));

        locked.mark_for_delete();
        locked.commit().await.unwrap();
        assert!(map.remove_if_empty(&locked));
        assert!(map.is_empty());
        assert!(!map.remove_if_empty(&locked));
    }

    #[tokio::test]
    async fn test_waiter_on_evicted_entry_relocks_the_live_one() {
        let map = Arc::new(EntityMap::<TestEntity>::new(Arc::new(
            InMemoryLfumStore::new(),
        )));
        let placeholder = map.lock_entry(&1, true).await.unwrap();
        let stale = Arc::clone(placeholder.entry());

        let waiter_map = Arc::clone(&map);
        let waiter = tokio::spawn(async move {
            let mut locked = waiter_map.lock_entry(&1, true).await.unwrap();
            let live = waiter_map.is_live(locked.entry());
            locked.insert(TestEntity::new(1, 5));
            locked.commit().await.unwrap();
            live
        });
        tokio::task::yield_now().await;

        assert!(map.remove_if_empty(&placeholder));
        drop(placeholder);
        assert!(waiter.await.unwrap());

        assert!(!map.is_live(&stale));
        let entry = map.get_entry(&1).unwrap();
        assert!(!Arc::ptr_eq(&entry, &stale));
        assert_eq!(entry.snapshot().await.unwrap().value, 5);
    }
}
