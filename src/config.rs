use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub remote: RemoteConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub storage: StorageConfig,
  #[serde(default)]
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
  /// Origin of the dashboard, e.g. "https://ops.example-hospital.org"
  pub base_url: String,
  /// Path prefix routed through the network-first strategy
  #[serde(default = "default_api_prefix")]
  pub api_prefix: String,
  /// Bounded wait before a request counts as unreachable
  #[serde(default = "default_timeout_ms")]
  pub timeout_ms: u64,
}

fn default_api_prefix() -> String {
  "/api/".to_string()
}

fn default_timeout_ms() -> u64 {
  5_000
}

impl RemoteConfig {
  pub fn base(&self) -> Result<Url> {
    Url::parse(&self.base_url).map_err(|e| eyre!("Invalid remote.base_url {}: {}", self.base_url, e))
  }

  /// Root of the remote API, e.g. "https://ops.example-hospital.org/api/"
  pub fn api_base(&self) -> Result<Url> {
    self
      .base()?
      .join(&self.api_prefix)
      .map_err(|e| eyre!("Invalid remote.api_prefix {}: {}", self.api_prefix, e))
  }

  pub fn timeout(&self) -> Duration {
    Duration::from_millis(self.timeout_ms)
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Cache generation identifier, bumped on every deploy
  #[serde(default = "default_cache_version")]
  pub version: String,
  /// Path of the application shell served to offline navigations
  #[serde(default = "default_app_shell")]
  pub app_shell: String,
  /// Static assets fetched into the cache during install
  #[serde(default = "default_precache")]
  pub precache: Vec<String>,
}

fn default_cache_version() -> String {
  "v1".to_string()
}

fn default_app_shell() -> String {
  "/index.html".to_string()
}

fn default_precache() -> Vec<String> {
  vec!["/".to_string(), "/index.html".to_string()]
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      version: default_cache_version(),
      app_shell: default_app_shell(),
      precache: default_precache(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
  #[serde(default = "default_interval_secs")]
  pub interval_secs: u64,
  #[serde(default = "default_probe_interval_secs")]
  pub probe_interval_secs: u64,
  /// Maximum number of entities replayed at the same time
  #[serde(default = "default_concurrency")]
  pub concurrency: usize,
}

fn default_interval_secs() -> u64 {
  300
}

fn default_probe_interval_secs() -> u64 {
  15
}

fn default_concurrency() -> usize {
  4
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      interval_secs: default_interval_secs(),
      probe_interval_secs: default_probe_interval_secs(),
      concurrency: default_concurrency(),
    }
  }
}

impl SyncConfig {
  pub fn interval(&self) -> Duration {
    Duration::from_secs(self.interval_secs.max(1))
  }

  pub fn probe_interval(&self) -> Duration {
    Duration::from_secs(self.probe_interval_secs.max(1))
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
  /// Database file (defaults to $XDG_DATA_HOME/wardsync/store.db)
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
  #[serde(default = "default_log_level")]
  pub level: String,
  /// Directory for rolling log files (defaults to the data directory)
  pub directory: Option<PathBuf>,
}

fn default_log_level() -> String {
  "info".to_string()
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: default_log_level(),
      directory: None,
    }
  }
}

/// Application data directory, shared by the store and the log files.
pub fn data_dir() -> Result<PathBuf> {
  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?;

  Ok(data_dir.join("wardsync"))
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./wardsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/wardsync/config.yaml
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

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => {
        return Err(eyre!(
          "No configuration file found. Create one at ~/.config/wardsync/config.yaml\n\
                 with at least `remote.base_url` set."
        ))
      }
    };

    Ok(config.apply_env())
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("wardsync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("wardsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub(crate) fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    config.remote.base()?;
    Ok(config)
  }

  /// Deploy tooling sets WARDSYNC_CACHE_VERSION instead of editing the file.
  fn apply_env(mut self) -> Self {
    if let Ok(version) = std::env::var("WARDSYNC_CACHE_VERSION") {
      if !version.trim().is_empty() {
        self.cache.version = version.trim().to_string();
      }
    }
    self
  }

  /// Database file location.
  pub fn store_path(&self) -> Result<PathBuf> {
    match &self.storage.path {
      Some(p) => Ok(p.clone()),
      None => Ok(data_dir()?.join("store.db")),
    }
  }
}
