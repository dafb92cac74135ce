//! Row tables with per-row async locks
//!
//! Each row lives behind its own `tokio::sync::Mutex`, held in a `DashMap`.
//! Holding the row guard is the unit of work: everything read and written
//! under it is serialized against other writers of the same row. Lock
//! acquisition is bounded by a timeout and surfaces as a retriable
//! [`WardenError::LockTimeout`].

use crate::{Result, WardenError};
use dashmap::DashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// Exclusive access to one row
pub type RowGuard<V> = OwnedMutexGuard<V>;

/// Keyed rows, each behind its own mutex
#[derive(Debug)]
pub struct RowTable<K, V>
where
    K: Eq + Hash,
{
    rows: DashMap<K, Arc<Mutex<V>>>,
    lock_timeout: Duration,
    resource: &'static str,
}

impl<K, V> RowTable<K, V>
where
    K: Eq + Hash + Clone + std::fmt::Display,
    V: Clone,
{
    /// Create an empty table. `resource` names the row kind in errors and logs.
    pub fn new(resource: &'static str, lock_timeout: Duration) -> Self {
        Self {
            rows: DashMap::new(),
            lock_timeout,
            resource,
        }
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    /// Insert a new row. Returns `false` if the key already exists.
    pub fn insert(&self, key: K, value: V) -> bool {
        match self.rows.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::new(Mutex::new(value)));
                true
            }
        }
    }

    /// Drop a row from the table. Callers that want the removal serialized
    /// against writers hold the row guard while calling this.
    pub fn remove(&self, key: &K) -> bool {
        self.rows.remove(key).is_some()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.rows.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn handle(&self, key: &K) -> Option<Arc<Mutex<V>>> {
        // Clone the Arc out so no shard guard is held across an await point
        self.rows.get(key).map(|row| Arc::clone(row.value()))
    }

    async fn acquire(&self, key: &K, handle: Arc<Mutex<V>>) -> Result<RowGuard<V>> {
        match tokio::time::timeout(self.lock_timeout, handle.lock_owned()).await {
            Ok(guard) => Ok(guard),
            Err(_) => {
                debug!(resource = self.resource, key = %key, "Row lock wait timed out");
                Err(WardenError::LockTimeout {
                    resource: format!("{}:{}", self.resource, key),
                })
            }
        }
    }

    /// Lock an existing row. `Ok(None)` if the row does not exist.
    pub async fn lock(&self, key: &K) -> Result<Option<RowGuard<V>>> {
        match self.handle(key) {
            Some(handle) => self.acquire(key, handle).await.map(Some),
            None => Ok(None),
        }
    }

    /// Lock a row, creating it with `init` if absent.
    ///
    /// Returns the guard and whether the row was created by this call.
    pub async fn lock_or_insert_with<F>(&self, key: &K, init: F) -> Result<(RowGuard<V>, bool)>
    where
        F: FnOnce() -> V,
    {
        let (handle, created) = match self.rows.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(row) => (Arc::clone(row.get()), false),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let handle = Arc::new(Mutex::new(init()));
                slot.insert(Arc::clone(&handle));
                (handle, true)
            }
        };
        let guard = self.acquire(key, handle).await?;
        Ok((guard, created))
    }

    /// Consistent copy of one row, taken under its lock
    pub async fn snapshot(&self, key: &K) -> Result<Option<V>> {
        Ok(self.lock(key).await?.map(|guard| guard.clone()))
    }

    /// Consistent copies of every row matching `filter`
    pub async fn snapshot_where<F>(&self, mut filter: F) -> Result<Vec<V>>
    where
        F: FnMut(&V) -> bool,
    {
        let handles: Vec<(K, Arc<Mutex<V>>)> = self
            .rows
            .iter()
            .map(|row| (row.key().clone(), Arc::clone(row.value())))
            .collect();

        let mut out = Vec::new();
        for (key, handle) in handles {
            let guard = self.acquire(&key, handle).await?;
            if filter(&*guard) {
                out.push(guard.clone());
            }
        }
        Ok(out)
    }

    /// Every key currently in the table
    pub fn keys(&self) -> Vec<K> {
        self.rows.iter().map(|row| row.key().clone()).collect()
    }
}
