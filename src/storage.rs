//! Persistent key-value storage boundary.
//!
//! The hosting extension runtime owns actual persistence; this crate only
//! sees an async string-keyed store. Values are JSON documents.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;

use anyhow::Result;
use futures::future::BoxFuture;

/// Async key-value storage collaborator.
///
/// All methods are async because the real backend lives on the other side of
/// an extension message channel; [`BoxFuture`] keeps the trait object-safe.
pub trait KvStorage: Send + Sync + fmt::Debug {
    /// Reads the value stored under `key`, `None` if absent.
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>>>;

    /// Stores `value` under `key`, overwriting any previous value.
    fn set<'a>(&'a self, key: &'a str, value: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Removes the value stored under `key`. Removing an absent key is not
    /// an error.
    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>>;
}

/// In-memory [`KvStorage`] backend.
///
/// Used by the test suite and by hosts that persist through other means.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    map: Mutex<BTreeMap<String, String>>,
}

impl MemoryStorage {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.map.lock().unwrap().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KvStorage for MemoryStorage {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>>> {
        Box::pin(async move { Ok(self.map.lock().unwrap().get(key).cloned()) })
    }

    fn set<'a>(&'a self, key: &'a str, value: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.map
                .lock()
                .unwrap()
                .insert(key.to_string(), value.to_string());
            Ok(())
        })
    }

    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.map.lock().unwrap().remove(key);
            Ok(())
        })
    }
}
