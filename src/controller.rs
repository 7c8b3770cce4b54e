//! Handles page commands against the tiers.

use color_eyre::Result;
use tracing::{debug, warn};
use url::Url;

use crate::cache::{CacheStorage, RequestKey, StoredResponse, Tier, TierManager};
use crate::protocol::{Command, Status};

/// Applies `update`, `delete` and `exists` commands.
///
/// Stateless across commands. Every command resolves to exactly one
/// [`Status`]; storage errors become [`Status::Fail`] here and never escape.
pub struct ShadowStoreController<S: CacheStorage> {
  tiers: TierManager<S>,
  /// Tier written by `update` commands that do not name one
  update_tier: Tier,
}

impl<S: CacheStorage> ShadowStoreController<S> {
  pub fn new(tiers: TierManager<S>, update_tier: Tier) -> Self {
    Self { tiers, update_tier }
  }

  pub fn update_tier(&self) -> Tier {
    self.update_tier
  }

  /// Run `command` on behalf of a page at `origin`.
  pub async fn handle(&self, origin: &Url, command: &Command) -> Status {
    match self.try_handle(origin, command).await {
      Ok(status) => {
        debug!(kind = command.kind(), path = command.path(), ?status, "Handled command");
        status
      }
      Err(e) => {
        warn!(
          kind = command.kind(),
          path = command.path(),
          error = %e,
          "Command failed"
        );
        Status::Fail
      }
    }
  }

  async fn try_handle(&self, origin: &Url, command: &Command) -> Result<Status> {
    let key = RequestKey::resolve(origin, command.path())?;

    match command {
      Command::Update {
        headers,
        body,
        tier,
        ..
      } => {
        let handle = self
          .tiers
          .open_tier(tier.unwrap_or(self.update_tier))
          .await?;
        let response = StoredResponse::new(body.clone(), headers.clone());
        self.tiers.put(&handle, &key, &response).await?;
        Ok(Status::Success)
      }
      Command::Delete { tier, .. } => {
        let targets: Vec<Tier> = match tier {
          Some(tier) => vec![*tier],
          None => Tier::LOOKUP_ORDER.to_vec(),
        };
        for tier in targets {
          let handle = self.tiers.open_tier(tier).await?;
          self.tiers.remove(&handle, &key).await?;
        }
        Ok(Status::Success)
      }
      Command::Exists { .. } => {
        let order = self.tiers.open_lookup_order().await?;
        match self.tiers.lookup(&order, &key).await? {
          Some(_) => Ok(Status::Success),
          None => Ok(Status::Fail),
        }
      }
    }
  }
}

impl<S: CacheStorage> Clone for ShadowStoreController<S> {
  fn clone(&self) -> Self {
    Self {
      tiers: self.tiers.clone(),
      update_tier: self.update_tier,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::testing::FailingStorage;
  use crate::cache::SqliteStorage;
  use std::collections::BTreeMap;

  fn origin() -> Url {
    Url::parse("http://localhost:8080").unwrap()
  }

  fn update(path: &str, body: &[u8], tier: Option<Tier>) -> Command {
    Command::Update {
      path: path.to_string(),
      headers: BTreeMap::new(),
      body: body.to_vec(),
      tier,
    }
  }

  fn exists(path: &str) -> Command {
    Command::Exists {
      path: path.to_string(),
    }
  }

  fn delete(path: &str, tier: Option<Tier>) -> Command {
    Command::Delete {
      path: path.to_string(),
      tier,
    }
  }

  fn controller() -> (ShadowStoreController<SqliteStorage>, TierManager<SqliteStorage>) {
    let tiers = TierManager::new(SqliteStorage::open_in_memory().unwrap());
    (
      ShadowStoreController::new(tiers.clone(), Tier::Ephemeral),
      tiers,
    )
  }

  async fn lookup(tiers: &TierManager<SqliteStorage>, path: &str) -> Option<Vec<u8>> {
    let order = tiers.open_lookup_order().await.unwrap();
    let key = RequestKey::resolve(&origin(), path).unwrap();
    tiers
      .lookup(&order, &key)
      .await
      .unwrap()
      .map(|hit| hit.response.body)
  }

  #[tokio::test]
  async fn test_update_overwrites() {
    let (controller, tiers) = controller();
    assert_eq!(
      controller.handle(&origin(), &update("/k", b"v1", None)).await,
      Status::Success
    );
    assert_eq!(
      controller.handle(&origin(), &update("/k", b"v2", None)).await,
      Status::Success
    );

    assert_eq!(controller.handle(&origin(), &exists("/k")).await, Status::Success);
    assert_eq!(lookup(&tiers, "/k").await, Some(b"v2".to_vec()));
  }

  #[tokio::test]
  async fn test_update_respects_tier() {
    let (controller, tiers) = controller();
    controller
      .handle(&origin(), &update("/p", b"p", Some(Tier::Persistent)))
      .await;
    controller.handle(&origin(), &update("/e", b"e", None)).await;

    tiers.purge(Tier::Ephemeral).await.unwrap();
    assert_eq!(lookup(&tiers, "/p").await, Some(b"p".to_vec()));
    assert_eq!(lookup(&tiers, "/e").await, None);
  }

  #[tokio::test]
  async fn test_delete_is_idempotent() {
    let (controller, _tiers) = controller();
    controller.handle(&origin(), &update("/k", b"v", None)).await;

    assert_eq!(
      controller.handle(&origin(), &delete("/k", None)).await,
      Status::Success
    );
    assert_eq!(
      controller.handle(&origin(), &delete("/k", None)).await,
      Status::Success
    );
    assert_eq!(controller.handle(&origin(), &exists("/k")).await, Status::Fail);
  }

  #[tokio::test]
  async fn test_delete_targets_only_named_tier() {
    let (controller, tiers) = controller();
    controller
      .handle(&origin(), &update("/k", b"p", Some(Tier::Persistent)))
      .await;

    controller
      .handle(&origin(), &delete("/k", Some(Tier::Ephemeral)))
      .await;
    assert_eq!(lookup(&tiers, "/k").await, Some(b"p".to_vec()));

    controller.handle(&origin(), &delete("/k", None)).await;
    assert_eq!(lookup(&tiers, "/k").await, None);
  }

  #[tokio::test]
  async fn test_storage_errors_become_fail() {
    let controller = ShadowStoreController::new(TierManager::new(FailingStorage), Tier::Ephemeral);
    assert_eq!(
      controller.handle(&origin(), &update("/k", b"v", None)).await,
      Status::Fail
    );
    assert_eq!(
      controller.handle(&origin(), &delete("/k", None)).await,
      Status::Fail
    );
    assert_eq!(controller.handle(&origin(), &exists("/k")).await, Status::Fail);
  }
}
