//! Membership sets of entities awaiting a background pass

use crate::entity::{Entity, EntityEntry};
use crate::timer::RetryTimer;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};

/// Named set of weak entity references
///
/// Membership is exact: adding a member twice or removing a non-member is a protocol bug and
/// panics. The optional timer is armed on the empty to non-empty edge only.
pub struct EntitySet<T: Entity> {
    name: &'static str,
    members: Mutex<IndexMap<T::Id, Weak<EntityEntry<T>>>>,
    counter: Option<Arc<AtomicI64>>,
    timer: Option<Arc<RetryTimer>>,
}

impl<T: Entity> fmt::Debug for EntitySet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntitySet")
            .field("name", &self.name)
            .field("len", &self.len())
            .finish()
    }
}

impl<T: Entity> EntitySet<T> {
    /// Plain set
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            members: Mutex::new(IndexMap::new()),
            counter: None,
            timer: None,
        }
    }

    /// Attach a gauge tracking the set size
    pub fn with_counter(mut self, counter: Arc<AtomicI64>) -> Self {
        self.counter = Some(counter);
        self
    }

    /// Attach a timer armed when the set becomes non-empty
    pub fn with_timer(mut self, timer: Arc<RetryTimer>) -> Self {
        self.timer = Some(timer);
        self
    }

    /// Set name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Attached timer
    pub fn timer(&self) -> Option<&Arc<RetryTimer>> {
        self.timer.as_ref()
    }

    /// Add a member
    ///
    /// # Panics
    ///
    /// If the entity is already a member.
    pub fn add(&self, entry: &Arc<EntityEntry<T>>) {
        let was_empty = {
            let mut members = self.members.lock();
            let was_empty = members.is_empty();
            let previous = members.insert(entry.id().clone(), Arc::downgrade(entry));
            assert!(
                previous.is_none(),
                "entity {} added twice to set {}",
                entry.id(),
                self.name
            );
            was_empty
        };
        self.on_added(was_empty);
    }

    /// Remove a member
    ///
    /// # Panics
    ///
    /// If the entity is not a member.
    pub fn remove(&self, id: &T::Id) {
        let removed = self.members.lock().shift_remove(id);
        assert!(
            removed.is_some(),
            "entity {} removed from set {} but not a member",
            id,
            self.name
        );
        self.on_removed();
    }

    /// Add or remove so that membership equals `should_be_member`
    ///
    /// The membership test and the change happen under one acquisition of the set lock, so
    /// concurrent callers never observe a half-applied change. Returns whether membership
    /// changed.
    pub fn reconcile(&self, entry: &Arc<EntityEntry<T>>, should_be_member: bool) -> bool {
        let mut members = self.members.lock();
        let is_member = members.contains_key(entry.id());
        match (is_member, should_be_member) {
            (false, true) => {
                let was_empty = members.is_empty();
                members.insert(entry.id().clone(), Arc::downgrade(entry));
                drop(members);
                self.on_added(was_empty);
                true
            }
            (true, false) => {
                members.shift_remove(entry.id());
                drop(members);
                self.on_removed();
                true
            }
            _ => false,
        }
    }

    fn on_added(&self, was_empty: bool) {
        if let Some(counter) = &self.counter {
            counter.fetch_add(1, Ordering::Relaxed);
        }
        if was_empty {
            if let Some(timer) = &self.timer {
                timer.set();
            }
        }
    }

    fn on_removed(&self) {
        if let Some(counter) = &self.counter {
            counter.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Whether `id` is a member
    pub fn contains(&self, id: &T::Id) -> bool {
        self.members.lock().contains_key(id)
    }

    /// Number of members
    pub fn len(&self) -> usize {
        self.members.lock().len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.members.lock().is_empty()
    }

    /// Live members in insertion order
    pub fn snapshot(&self) -> Vec<Arc<EntityEntry<T>>> {
        self.members
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }
}
