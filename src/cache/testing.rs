//! Storage doubles for tests.

use color_eyre::{eyre::eyre, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::storage::{CacheStorage, SqliteStorage};
use super::traits::{CachedResponse, RequestKey, StoredResponse};

/// In-memory SQLite storage that counts lookups.
pub struct CountingStorage {
  inner: SqliteStorage,
  lookups: Arc<AtomicUsize>,
}

impl CountingStorage {
  /// Returns the storage plus a shared counter of `match_entry` calls.
  pub fn new() -> (Self, Arc<AtomicUsize>) {
    let lookups = Arc::new(AtomicUsize::new(0));
    let storage = Self {
      inner: SqliteStorage::open_in_memory().unwrap(),
      lookups: Arc::clone(&lookups),
    };
    (storage, lookups)
  }
}

impl CacheStorage for CountingStorage {
  fn open_store(&self, name: &str) -> Result<()> {
    self.inner.open_store(name)
  }

  fn store_names(&self) -> Result<Vec<String>> {
    self.inner.store_names()
  }

  fn match_entry(&self, store: &str, key: &RequestKey) -> Result<Option<CachedResponse>> {
    self.lookups.fetch_add(1, Ordering::SeqCst);
    self.inner.match_entry(store, key)
  }

  fn put_entry(&self, store: &str, key: &RequestKey, response: &StoredResponse) -> Result<()> {
    self.inner.put_entry(store, key, response)
  }

  fn delete_entry(&self, store: &str, key: &RequestKey) -> Result<bool> {
    self.inner.delete_entry(store, key)
  }

  fn delete_store(&self, name: &str) -> Result<bool> {
    self.inner.delete_store(name)
  }
}

/// Storage whose every operation fails, as if the quota were exhausted.
pub struct FailingStorage;

impl CacheStorage for FailingStorage {
  fn open_store(&self, _name: &str) -> Result<()> {
    Err(eyre!("storage unavailable"))
  }

  fn store_names(&self) -> Result<Vec<String>> {
    Err(eyre!("storage unavailable"))
  }

  fn match_entry(&self, _store: &str, _key: &RequestKey) -> Result<Option<CachedResponse>> {
    Err(eyre!("storage unavailable"))
  }

  fn put_entry(&self, _store: &str, _key: &RequestKey, _response: &StoredResponse) -> Result<()> {
    Err(eyre!("quota exceeded"))
  }

  fn delete_entry(&self, _store: &str, _key: &RequestKey) -> Result<bool> {
    Err(eyre!("storage unavailable"))
  }

  fn delete_store(&self, _name: &str) -> Result<bool> {
    Err(eyre!("storage unavailable"))
  }
}
