//! SQLite-backed registration facility for the in-process host.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Mutex;
use tracing::{info, warn};
use url::Url;

use crate::client::{Registrar, Registration, WorkerState};
use crate::host::HostHandle;

const REGISTRY_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS registrations (
    scope TEXT PRIMARY KEY,
    script_url TEXT NOT NULL,
    state TEXT NOT NULL,
    registered_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

/// Keeps registrations in SQLite and activates the worker behind `host`.
///
/// Registrations survive restarts, so a later process can find the active
/// worker without re-registering (and without purging the ephemeral tier).
pub struct SqliteRegistry {
  conn: Mutex<Connection>,
  host: HostHandle,
}

impl SqliteRegistry {
  pub fn open(path: &Path, host: HostHandle) -> Result<Self> {
    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open registry at {}: {}", path.display(), e))?;
    Self::from_connection(conn, host)
  }

  pub fn open_in_memory(host: HostHandle) -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory registry: {}", e))?;
    Self::from_connection(conn, host)
  }

  fn from_connection(conn: Connection, host: HostHandle) -> Result<Self> {
    conn
      .execute_batch(REGISTRY_SCHEMA)
      .map_err(|e| eyre!("Failed to run registry migrations: {}", e))?;
    Ok(Self {
      conn: Mutex::new(conn),
      host,
    })
  }

  fn remove(&self, scope: &Url) -> Result<bool> {
    let conn = self.lock()?;
    let removed = conn
      .execute(
        "DELETE FROM registrations WHERE scope = ?",
        params![scope.as_str()],
      )
      .map_err(|e| eyre!("Failed to remove registration {}: {}", scope, e))?;
    Ok(removed > 0)
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  fn all(&self) -> Result<Vec<Registration>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT scope, script_url, state FROM registrations ORDER BY scope")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map([], |row| {
        Ok((
          row.get::<_, String>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, String>(2)?,
        ))
      })
      .map_err(|e| eyre!("Failed to list registrations: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read registration: {}", e))?;

    rows
      .into_iter()
      .map(|(scope, script_url, state)| {
        Ok(Registration {
          scope: Url::parse(&scope).map_err(|e| eyre!("Bad scope '{}': {}", scope, e))?,
          script_url: Url::parse(&script_url)
            .map_err(|e| eyre!("Bad script url '{}': {}", script_url, e))?,
          state: parse_state(&state)?,
        })
      })
      .collect()
  }

  fn set_state(&self, scope: &Url, state: WorkerState) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute(
        "UPDATE registrations SET state = ? WHERE scope = ?",
        params![state.as_str(), scope.as_str()],
      )
      .map_err(|e| eyre!("Failed to update registration {}: {}", scope, e))?;
    Ok(())
  }
}

fn parse_state(s: &str) -> Result<WorkerState> {
  match s {
    "installing" => Ok(WorkerState::Installing),
    "active" => Ok(WorkerState::Active),
    other => Err(eyre!("Unknown worker state '{}'", other)),
  }
}

#[async_trait]
impl Registrar for SqliteRegistry {
  fn is_supported(&self) -> bool {
    true
  }

  async fn get_registration(&self, url: &Url) -> Result<Option<Registration>> {
    Ok(
      self
        .all()?
        .into_iter()
        .filter(|r| url.as_str().starts_with(r.scope.as_str()))
        .max_by_key(|r| r.scope.as_str().len()),
    )
  }

  async fn get_registrations(&self) -> Result<Vec<Registration>> {
    self.all()
  }

  async fn register(&self, script_url: &Url, scope: &Url) -> Result<Registration> {
    {
      let conn = self.lock()?;
      conn
        .execute(
          "INSERT OR REPLACE INTO registrations (scope, script_url, state) VALUES (?, ?, ?)",
          params![
            scope.as_str(),
            script_url.as_str(),
            WorkerState::Installing.as_str()
          ],
        )
        .map_err(|e| eyre!("Failed to record registration for {}: {}", scope, e))?;
    }

    // A new generation: the worker cleans up before it serves anything.
    if let Err(e) = self.host.activate().await {
      if let Err(cleanup) = self.remove(scope) {
        warn!(%scope, error = %cleanup, "Failed to discard unactivated registration");
      }
      return Err(e);
    }
    self.set_state(scope, WorkerState::Active)?;
    info!(%scope, script = %script_url, "Registered shadow worker");

    Ok(Registration {
      scope: scope.clone(),
      script_url: script_url.clone(),
      state: WorkerState::Active,
    })
  }

  async fn wait_active(&self, registration: &Registration) -> Result<()> {
    let current = self
      .all()?
      .into_iter()
      .find(|r| r.scope == registration.scope)
      .ok_or_else(|| eyre!("Registration for {} disappeared", registration.scope))?;

    match current.state {
      WorkerState::Active => Ok(()),
      WorkerState::Installing => Err(eyre!(
        "Worker at {} did not reach the active state",
        registration.scope
      )),
    }
  }

  async fn unregister(&self, scope: &Url) -> Result<bool> {
    self.remove(scope)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::testing::FailingStorage;
  use crate::cache::{SqliteStorage, Tier};
  use crate::client::{RegisterOptions, ShadowFiles};
  use crate::error::ClientError;
  use crate::host::WorkerHost;
  use crate::page::PageClient;
  use crate::worker::ShadowWorker;
  use std::collections::BTreeMap;
  use std::time::Duration;

  fn origin() -> Url {
    Url::parse("http://localhost:8080").unwrap()
  }

  fn host() -> HostHandle {
    let worker = ShadowWorker::new(SqliteStorage::open_in_memory().unwrap(), Tier::Ephemeral);
    WorkerHost::new(worker).spawn()
  }

  #[tokio::test]
  async fn test_get_registration_uses_longest_scope_prefix() {
    let registry = SqliteRegistry::open_in_memory(host()).unwrap();
    let script = origin().join("/sw.js").unwrap();
    registry
      .register(&script, &origin().join("/").unwrap())
      .await
      .unwrap();
    registry
      .register(&script, &origin().join("/app/").unwrap())
      .await
      .unwrap();

    let found = registry
      .get_registration(&origin().join("/app/page.html").unwrap())
      .await
      .unwrap()
      .unwrap();
    assert_eq!(found.scope.as_str(), "http://localhost:8080/app/");

    let found = registry
      .get_registration(&origin().join("/other").unwrap())
      .await
      .unwrap()
      .unwrap();
    assert_eq!(found.scope.as_str(), "http://localhost:8080/");

    let elsewhere = Url::parse("http://example.com/").unwrap();
    assert!(registry.get_registration(&elsewhere).await.unwrap().is_none());
  }

  #[tokio::test]
  async fn test_facade_over_registry() {
    let host = host();
    let facade = ShadowFiles::new(SqliteRegistry::open_in_memory(host.clone()).unwrap(), origin());
    let options = RegisterOptions {
      script_url: "sw.js".to_string(),
      scope: None,
    };

    let registration = facade.register(options.clone()).await.unwrap();
    assert_eq!(registration.state, WorkerState::Active);
    facade.ready().await.unwrap();

    assert!(matches!(
      facade.register(options).await,
      Err(ClientError::AlreadyRegistered(_))
    ));
  }

  #[tokio::test]
  async fn test_reregistering_purges_ephemeral_tier() {
    let host = host();
    let registry = SqliteRegistry::open_in_memory(host.clone()).unwrap();
    let scope = origin().join("/").unwrap();
    let script = origin().join("/sw.js").unwrap();
    registry.register(&script, &scope).await.unwrap();

    let page = PageClient::new(host.clone(), origin(), Duration::from_secs(5));
    page
      .update("/e", b"e".to_vec(), BTreeMap::new(), Some(Tier::Ephemeral))
      .await
      .unwrap();
    page
      .update("/p", b"p".to_vec(), BTreeMap::new(), Some(Tier::Persistent))
      .await
      .unwrap();

    assert!(registry.unregister(&scope).await.unwrap());
    assert!(!registry.unregister(&scope).await.unwrap());
    registry.register(&script, &scope).await.unwrap();

    assert!(!page.exists("/e").await.unwrap());
    assert!(page.exists("/p").await.unwrap());
  }

  #[tokio::test]
  async fn test_failed_activation_leaves_no_registration() {
    let host = WorkerHost::new(ShadowWorker::new(FailingStorage, Tier::Ephemeral)).spawn();
    let facade = ShadowFiles::new(SqliteRegistry::open_in_memory(host).unwrap(), origin());
    let options = RegisterOptions {
      script_url: "sw.js".to_string(),
      scope: None,
    };

    assert!(matches!(
      facade.register(options.clone()).await,
      Err(ClientError::Registration(_))
    ));
    assert!(facade.registrar().all().unwrap().is_empty());

    // The scope is free again, so a retry reaches activation instead of
    // being rejected as a duplicate.
    assert!(matches!(
      facade.register(options).await,
      Err(ClientError::Registration(_))
    ));
    assert!(facade.registrar().all().unwrap().is_empty());
  }
}
