//! Row-typed key-value store behind entity commits
//!
//! The store engine itself lives outside the agent. [`InMemoryLfumStore`] is the reference
//! implementation used by tests and by nodes that run without durable state.

use async_trait::async_trait;
use parking_lot::Mutex;
use ra_core::{RaError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Discriminates entity kinds sharing one store
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RowType {
    /// One row per partition
    FailoverUnit,
    /// Rows written by framework tests
    Test,
}

/// Kind of durable write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StoreOperationType {
    /// New row
    Insert,
    /// Replace an existing row
    Update,
    /// Remove a row
    Delete,
}

/// Local failover unit map store
///
/// Writes for one key are issued by at most one committer at a time; writes for different
/// keys may run concurrently.
#[async_trait]
pub trait LfumStore: Send + Sync {
    /// Apply one write. `data` is `None` for deletes.
    async fn write(
        &self,
        operation: StoreOperationType,
        row_type: RowType,
        key: &str,
        data: Option<Vec<u8>>,
    ) -> Result<()>;

    /// All rows of one type
    async fn enumerate(&self, row_type: RowType) -> Result<Vec<(String, Vec<u8>)>>;
}

/// Store that keeps rows in memory
#[derive(Debug, Default)]
pub struct InMemoryLfumStore {
    rows: Mutex<BTreeMap<(RowType, String), Vec<u8>>>,
    failures_pending: AtomicUsize,
    writes: AtomicUsize,
}

impl InMemoryLfumStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` writes with a storage error
    pub fn fail_next_writes(&self, count: usize) {
        self.failures_pending.store(count, Ordering::SeqCst);
    }

    /// Number of successful writes so far
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Raw row, if present
    pub fn row(&self, row_type: RowType, key: &str) -> Option<Vec<u8>> {
        self.rows.lock().get(&(row_type, key.to_string())).cloned()
    }

    /// Number of stored rows
    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    /// Whether the store holds no rows
    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }

    fn take_injected_failure(&self) -> bool {
        self.failures_pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl LfumStore for InMemoryLfumStore {
    async fn write(
        &self,
        operation: StoreOperationType,
        row_type: RowType,
        key: &str,
        data: Option<Vec<u8>>,
    ) -> Result<()> {
        if self.take_injected_failure() {
            return Err(RaError::storage(format!("injected failure writing {key}")));
        }

        let mut rows = self.rows.lock();
        let row_key = (row_type, key.to_string());
        match (operation, data) {
            (StoreOperationType::Insert, Some(data)) => {
                if rows.contains_key(&row_key) {
                    return Err(RaError::storage(format!("row {key} already exists")));
                }
                rows.insert(row_key, data);
            }
            (StoreOperationType::Update, Some(data)) => {
                if !rows.contains_key(&row_key) {
                    return Err(RaError::storage(format!("row {key} does not exist")));
                }
                rows.insert(row_key, data);
            }
            (StoreOperationType::Delete, _) => {
                rows.remove(&row_key);
            }
            (op, None) => {
                return Err(RaError::storage(format!("{op:?} of {key} without data")));
            }
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn enumerate(&self, row_type: RowType) -> Result<Vec<(String, Vec<u8>)>> {
        Ok(self
            .rows
            .lock()
            .iter()
            .filter(|((rt, _), _)| *rt == row_type)
            .map(|((_, key), data)| (key.clone(), data.clone()))
            .collect())
    }
}
