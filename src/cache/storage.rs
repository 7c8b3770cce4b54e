//! Content storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::traits::{CachedResponse, RequestKey, StoredResponse};

/// Named, key-addressed response stores.
///
/// Every write reports failure through `Err`. Implementations must never
/// drop a write on the floor.
pub trait CacheStorage: Send + Sync {
  /// Create the named store if it does not exist yet.
  fn open_store(&self, name: &str) -> Result<()>;

  /// Names of every store currently present.
  fn store_names(&self) -> Result<Vec<String>>;

  /// Look up a response by request identity.
  fn match_entry(&self, store: &str, key: &RequestKey) -> Result<Option<CachedResponse>>;

  /// Insert or replace the response stored under `key`.
  fn put_entry(&self, store: &str, key: &RequestKey, response: &StoredResponse) -> Result<()>;

  /// Remove one entry. Returns whether it existed.
  fn delete_entry(&self, store: &str, key: &RequestKey) -> Result<bool>;

  /// Remove a whole store and its entries. Returns whether it existed.
  fn delete_store(&self, name: &str) -> Result<bool>;
}

/// SQLite-based storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the store database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      if !parent.as_os_str().is_empty() {
        std::fs::create_dir_all(parent)
          .map_err(|e| eyre!("Failed to create store directory: {}", e))?;
      }
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open store database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// Open a private in-memory database. Contents vanish on drop.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory store: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("shadowfiles").join("store.db"))
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute_batch(STORE_SCHEMA)
      .map_err(|e| eyre!("Failed to run store migrations: {}", e))?;
    Ok(())
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

const STORE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS stores (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One row per (store, request identity)
CREATE TABLE IF NOT EXISTS entries (
    store TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    stored_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (store, key_hash)
);
"#;

impl CacheStorage for SqliteStorage {
  fn open_store(&self, name: &str) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute(
        "INSERT OR IGNORE INTO stores (name) VALUES (?)",
        params![name],
      )
      .map_err(|e| eyre!("Failed to open store {}: {}", name, e))?;
    Ok(())
  }

  fn store_names(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT name FROM stores ORDER BY name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list stores: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read store name: {}", e))?;

    Ok(names)
  }

  fn match_entry(&self, store: &str, key: &RequestKey) -> Result<Option<CachedResponse>> {
    let conn = self.lock()?;

    let row: Option<(u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, headers, body, stored_at FROM entries
         WHERE store = ? AND key_hash = ?",
        params![store, key.hash()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up {} in {}: {}", key, store, e))?;

    match row {
      Some((status, headers, body, stored_at)) => {
        let headers: BTreeMap<String, String> = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to decode headers for {}: {}", key, e))?;
        Ok(Some(CachedResponse {
          response: StoredResponse {
            status,
            headers,
            body,
          },
          stored_at: parse_datetime(&stored_at)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn put_entry(&self, store: &str, key: &RequestKey, response: &StoredResponse) -> Result<()> {
    let conn = self.lock()?;
    let headers = serde_json::to_string(&response.headers)
      .map_err(|e| eyre!("Failed to encode headers for {}: {}", key, e))?;

    let tx = conn
      .unchecked_transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "INSERT OR IGNORE INTO stores (name) VALUES (?)",
      params![store],
    )
    .map_err(|e| eyre!("Failed to open store {}: {}", store, e))?;

    tx.execute(
      "INSERT OR REPLACE INTO entries (store, key_hash, method, url, status, headers, body, stored_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        store,
        key.hash(),
        key.method(),
        key.url().as_str(),
        response.status,
        headers,
        response.body
      ],
    )
    .map_err(|e| eyre!("Failed to store {} in {}: {}", key, store, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn delete_entry(&self, store: &str, key: &RequestKey) -> Result<bool> {
    let conn = self.lock()?;
    let removed = conn
      .execute(
        "DELETE FROM entries WHERE store = ? AND key_hash = ?",
        params![store, key.hash()],
      )
      .map_err(|e| eyre!("Failed to delete {} from {}: {}", key, store, e))?;
    Ok(removed > 0)
  }

  fn delete_store(&self, name: &str) -> Result<bool> {
    let conn = self.lock()?;
    let tx = conn
      .unchecked_transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM entries WHERE store = ?", params![name])
      .map_err(|e| eyre!("Failed to clear store {}: {}", name, e))?;
    let removed = tx
      .execute("DELETE FROM stores WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete store {}: {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;
  use url::Url;

  fn key(path: &str) -> RequestKey {
    RequestKey::get(&Url::parse("http://localhost").unwrap().join(path).unwrap())
  }

  fn response(body: &[u8]) -> StoredResponse {
    let mut headers = BTreeMap::new();
    headers.insert("content-type".to_string(), "text/plain".to_string());
    StoredResponse::new(body.to_vec(), headers)
  }

  #[test]
  fn test_put_then_match() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.put_entry("s", &key("/a"), &response(b"hello")).unwrap();

    let cached = storage.match_entry("s", &key("/a")).unwrap().unwrap();
    assert_eq!(cached.response.body, b"hello");
    assert_eq!(cached.response.header("content-type"), Some("text/plain"));
    assert!(storage.match_entry("s", &key("/b")).unwrap().is_none());
    assert!(storage.match_entry("other", &key("/a")).unwrap().is_none());
  }

  #[test]
  fn test_put_overwrites() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.put_entry("s", &key("/a"), &response(b"v1")).unwrap();
    storage.put_entry("s", &key("/a"), &response(b"v2")).unwrap();

    let cached = storage.match_entry("s", &key("/a")).unwrap().unwrap();
    assert_eq!(cached.response.body, b"v2");

    let conn = storage.lock().unwrap();
    let count: i64 = conn
      .query_row("SELECT COUNT(*) FROM entries", [], |row| row.get(0))
      .unwrap();
    assert_eq!(count, 1);
  }

  #[test]
  fn test_delete_entry_reports_existence() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.put_entry("s", &key("/a"), &response(b"x")).unwrap();

    assert!(storage.delete_entry("s", &key("/a")).unwrap());
    assert!(!storage.delete_entry("s", &key("/a")).unwrap());
  }

  #[test]
  fn test_open_and_delete_store() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.open_store("one").unwrap();
    storage.open_store("one").unwrap();
    storage.put_entry("two", &key("/a"), &response(b"x")).unwrap();
    assert_eq!(storage.store_names().unwrap(), vec!["one", "two"]);

    assert!(storage.delete_store("two").unwrap());
    assert!(!storage.delete_store("two").unwrap());
    assert!(storage.match_entry("two", &key("/a")).unwrap().is_none());
    assert_eq!(storage.store_names().unwrap(), vec!["one"]);
  }
}
