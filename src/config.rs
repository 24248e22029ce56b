use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::query::RetryPolicy;
use crate::store::Theme;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub api: ApiConfig,
  #[serde(default)]
  pub query: QueryConfig,
  #[serde(default)]
  pub storage: StorageConfig,
  #[serde(default)]
  pub theme: ThemeConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Origin serving `/api/products`
  #[serde(default = "default_base_url")]
  pub base_url: String,
  #[serde(default = "default_timeout_ms")]
  pub timeout_ms: u64,
}

fn default_base_url() -> String {
  "http://localhost:3000".to_string()
}

fn default_timeout_ms() -> u64 {
  10_000
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      base_url: default_base_url(),
      timeout_ms: default_timeout_ms(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryConfig {
  #[serde(default = "default_stale_time_ms")]
  pub stale_time_ms: u64,
  #[serde(default = "default_max_retries")]
  pub max_retries: u32,
}

fn default_stale_time_ms() -> u64 {
  30_000
}

fn default_max_retries() -> u32 {
  3
}

impl Default for QueryConfig {
  fn default() -> Self {
    Self {
      stale_time_ms: default_stale_time_ms(),
      max_retries: default_max_retries(),
    }
  }
}

impl QueryConfig {
  pub fn stale_time(&self) -> Duration {
    Duration::from_millis(self.stale_time_ms)
  }

  pub fn retry(&self) -> RetryPolicy {
    RetryPolicy::new(self.max_retries)
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
  /// SQLite file backing the persisted UI store
  pub path: Option<PathBuf>,
}

impl StorageConfig {
  /// Configured path, or `<data_dir>/storefront-sync/store.db`.
  pub fn resolved_path(&self) -> Result<PathBuf> {
    if let Some(path) = &self.path {
      return Ok(path.clone());
    }
    Ok(data_dir()?.join("store.db"))
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ThemeConfig {
  /// Stand-in for the OS color-scheme preference, used when nothing is stored
  #[serde(default)]
  pub system_preference: Theme,
}

/// Application data directory, `<data_dir>/storefront-sync`.
pub fn data_dir() -> Result<PathBuf> {
  let base = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?;
  Ok(base.join("storefront-sync"))
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided (must exist)
  /// 2. ./storefront.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/storefront-sync/config.yaml
  ///
  /// With no file found, defaults apply. `STOREFRONT_API_URL` overrides
  /// `api.base_url` either way.
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

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Config::default(),
    };

    if let Ok(url) = std::env::var("STOREFRONT_API_URL") {
      config.api.base_url = url;
    }

    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("storefront.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("storefront-sync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    Ok(serde_yaml::from_str(contents)?)
  }
}
