//! Tier manager: policy layer over the content storage backend.

use color_eyre::Result;
use std::sync::Arc;
use tracing::{debug, info};

use super::storage::CacheStorage;
use super::traits::{RequestKey, StoredResponse, Tier, TierHit, STORE_PREFIX};

/// An opened tier. Obtained from [`TierManager::open_tier`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierHandle {
  tier: Tier,
  name: String,
}

impl TierHandle {
  pub fn tier(&self) -> Tier {
    self.tier
  }

  pub fn name(&self) -> &str {
    &self.name
  }
}

/// Owns the ephemeral and persistent tiers.
///
/// Lookup is ephemeral-first, persistent-second; the tiers are never merged.
/// Writes are last-write-wins per key and every failure is propagated.
pub struct TierManager<S: CacheStorage> {
  storage: Arc<S>,
}

impl<S: CacheStorage> TierManager<S> {
  pub fn new(storage: S) -> Self {
    Self {
      storage: Arc::new(storage),
    }
  }

  /// Open (creating if absent) the store backing `tier`.
  pub async fn open_tier(&self, tier: Tier) -> Result<TierHandle> {
    let name = tier.store_name();
    self.storage.open_store(&name)?;
    Ok(TierHandle { tier, name })
  }

  /// Open every tier in lookup order.
  pub async fn open_lookup_order(&self) -> Result<Vec<TierHandle>> {
    let mut handles = Vec::with_capacity(Tier::LOOKUP_ORDER.len());
    for tier in Tier::LOOKUP_ORDER {
      handles.push(self.open_tier(tier).await?);
    }
    Ok(handles)
  }

  /// Probe `order` in sequence and return the first match.
  pub async fn lookup(&self, order: &[TierHandle], key: &RequestKey) -> Result<Option<TierHit>> {
    for handle in order {
      if let Some(cached) = self.storage.match_entry(&handle.name, key)? {
        return Ok(Some(TierHit {
          tier: handle.tier,
          response: cached.response,
          stored_at: cached.stored_at,
        }));
      }
    }
    Ok(None)
  }

  /// Store `response` under `key`, replacing any prior entry.
  pub async fn put(
    &self,
    handle: &TierHandle,
    key: &RequestKey,
    response: &StoredResponse,
  ) -> Result<()> {
    self.storage.put_entry(&handle.name, key, response)
  }

  /// Remove `key`. Returns whether an entry existed.
  pub async fn remove(&self, handle: &TierHandle, key: &RequestKey) -> Result<bool> {
    self.storage.delete_entry(&handle.name, key)
  }

  /// Delete the whole store backing `tier`.
  pub async fn purge(&self, tier: Tier) -> Result<bool> {
    let name = tier.store_name();
    let existed = self.storage.delete_store(&name)?;
    debug!(store = %name, existed, "Purged tier");
    Ok(existed)
  }

  /// Delete stores left behind by earlier store versions.
  pub async fn reclaim_orphans(&self) -> Result<Vec<String>> {
    let current: Vec<String> = Tier::LOOKUP_ORDER
      .iter()
      .map(|tier| tier.store_name())
      .collect();

    let mut reclaimed = Vec::new();
    for name in self.storage.store_names()? {
      if name.starts_with(STORE_PREFIX) && !current.contains(&name) {
        self.storage.delete_store(&name)?;
        info!(store = %name, "Reclaimed orphaned store");
        reclaimed.push(name);
      }
    }
    Ok(reclaimed)
  }
}

impl<S: CacheStorage> Clone for TierManager<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use std::collections::BTreeMap;
  use url::Url;

  fn key(path: &str) -> RequestKey {
    RequestKey::resolve(&Url::parse("http://localhost").unwrap(), path).unwrap()
  }

  fn body(bytes: &[u8]) -> StoredResponse {
    StoredResponse::new(bytes.to_vec(), BTreeMap::new())
  }

  fn manager() -> TierManager<SqliteStorage> {
    TierManager::new(SqliteStorage::open_in_memory().unwrap())
  }

  #[tokio::test]
  async fn test_open_tier_is_idempotent() {
    let tiers = manager();
    let first = tiers.open_tier(Tier::Ephemeral).await.unwrap();
    let second = tiers.open_tier(Tier::Ephemeral).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first.name(), "_$shadowfiles-store-v1");
  }

  #[tokio::test]
  async fn test_ephemeral_wins_over_persistent() {
    let tiers = manager();
    let order = tiers.open_lookup_order().await.unwrap();
    tiers.put(&order[1], &key("/a"), &body(b"persistent")).await.unwrap();
    tiers.put(&order[0], &key("/a"), &body(b"ephemeral")).await.unwrap();

    let hit = tiers.lookup(&order, &key("/a")).await.unwrap().unwrap();
    assert_eq!(hit.tier, Tier::Ephemeral);
    assert_eq!(hit.response.body, b"ephemeral");
  }

  #[tokio::test]
  async fn test_persistent_fallback_on_ephemeral_miss() {
    let tiers = manager();
    let order = tiers.open_lookup_order().await.unwrap();
    tiers.put(&order[1], &key("/a"), &body(b"persistent")).await.unwrap();

    let hit = tiers.lookup(&order, &key("/a")).await.unwrap().unwrap();
    assert_eq!(hit.tier, Tier::Persistent);
    assert!(tiers.lookup(&order, &key("/missing")).await.unwrap().is_none());
  }

  #[tokio::test]
  async fn test_remove_reports_existence() {
    let tiers = manager();
    let ephemeral = tiers.open_tier(Tier::Ephemeral).await.unwrap();
    tiers.put(&ephemeral, &key("/a"), &body(b"x")).await.unwrap();

    assert!(tiers.remove(&ephemeral, &key("/a")).await.unwrap());
    assert!(!tiers.remove(&ephemeral, &key("/a")).await.unwrap());
  }

  #[tokio::test]
  async fn test_purge_leaves_other_tier() {
    let tiers = manager();
    let order = tiers.open_lookup_order().await.unwrap();
    tiers.put(&order[0], &key("/e"), &body(b"e")).await.unwrap();
    tiers.put(&order[1], &key("/p"), &body(b"p")).await.unwrap();

    assert!(tiers.purge(Tier::Ephemeral).await.unwrap());

    let order = tiers.open_lookup_order().await.unwrap();
    assert!(tiers.lookup(&order, &key("/e")).await.unwrap().is_none());
    assert!(tiers.lookup(&order, &key("/p")).await.unwrap().is_some());
  }

  #[tokio::test]
  async fn test_reclaim_orphans_keeps_current_and_foreign_stores() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.open_store("_$shadowfiles-store-v0").unwrap();
    storage.open_store("someone-elses-store").unwrap();
    let tiers = TierManager::new(storage);
    tiers.open_lookup_order().await.unwrap();

    let reclaimed = tiers.reclaim_orphans().await.unwrap();
    assert_eq!(reclaimed, vec!["_$shadowfiles-store-v0"]);

    let names = tiers.storage.store_names().unwrap();
    assert!(names.contains(&"someone-elses-store".to_string()));
    assert!(names.contains(&Tier::Ephemeral.store_name()));
    assert!(names.contains(&Tier::Persistent.store_name()));
  }
}
