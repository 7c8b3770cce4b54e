use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::cache::{SqliteStorage, Tier};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Origin the page runs on; shadow file paths resolve against it
  pub origin: String,
  /// Scope the worker is registered at
  pub scope: String,
  pub script_url: String,
  /// Store database (default: $XDG_DATA_HOME/shadowfiles/store.db)
  pub database: Option<PathBuf>,
  /// Tier written by updates that do not name one
  pub update_tier: Tier,
  pub reply_timeout_ms: u64,
  pub log: LogConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: "http://localhost:8080/".to_string(),
      scope: "/".to_string(),
      script_url: "/sw.js".to_string(),
      database: None,
      update_tier: Tier::Ephemeral,
      reply_timeout_ms: 10_000,
      log: LogConfig::default(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// Default filter when RUST_LOG is unset
  pub level: String,
  /// Directory for rolling log files (default: $XDG_DATA_HOME/shadowfiles/logs)
  pub directory: Option<PathBuf>,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      directory: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./shadowfiles.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/shadowfiles/config.yaml
  ///
  /// Defaults apply when no file is found.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("shadowfiles.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("shadowfiles").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    config.origin_url()?;
    Ok(config)
  }

  pub fn origin_url(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin '{}': {}", self.origin, e))
  }

  /// Store database path.
  ///
  /// Checks SHADOWFILES_DB first, then the config file, then the data dir.
  pub fn database_path(&self) -> Result<PathBuf> {
    if let Ok(path) = std::env::var("SHADOWFILES_DB") {
      return Ok(PathBuf::from(path));
    }
    match &self.database {
      Some(path) => Ok(path.clone()),
      None => SqliteStorage::default_path(),
    }
  }

  pub fn log_directory(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.log.directory {
      return Ok(dir.clone());
    }
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;
    Ok(data_dir.join("shadowfiles").join("logs"))
  }

  pub fn reply_timeout(&self) -> Duration {
    Duration::from_millis(self.reply_timeout_ms)
  }
}
