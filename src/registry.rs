//! Object registry
//!
//! Maps monotonically increasing ids to live objects (tunnels, pipes) so that
//! management surfaces can enumerate and stop them. Ids are never reused.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("item not found: {0}")]
    NotFound(u64),
}

struct Inner<T> {
    items: BTreeMap<u64, T>,
    latest_id: u64,
}

pub struct Registry<T> {
    inner: Mutex<Inner<T>>,
}

impl<T: Clone> Registry<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: BTreeMap::new(),
                latest_id: 0,
            }),
        }
    }

    /// Store `item` and return its id (starting at 1)
    pub fn add(&self, item: T) -> u64 {
        let mut inner = self.inner.lock();
        inner.latest_id += 1;
        let id = inner.latest_id;
        inner.items.insert(id, item);
        id
    }

    pub fn get_by_id(&self, id: u64) -> Result<T, RegistryError> {
        self.inner
            .lock()
            .items
            .get(&id)
            .cloned()
            .ok_or(RegistryError::NotFound(id))
    }

    pub fn delete(&self, id: u64) -> Result<(), RegistryError> {
        self.inner
            .lock()
            .items
            .remove(&id)
            .map(|_| ())
            .ok_or(RegistryError::NotFound(id))
    }

    /// Snapshot of all live items, ordered by id
    pub fn get_all(&self) -> Vec<(u64, T)> {
        self.inner
            .lock()
            .items
            .iter()
            .map(|(id, item)| (*id, item.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}
