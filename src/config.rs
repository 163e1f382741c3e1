use chrono::Duration;
use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::cache::{DescriptorRegistry, ResourceDescriptor};
use crate::request::RequestOptions;

/// Fifteen minutes, in milliseconds
const DEFAULT_MS_TO_LIVE: u64 = 15 * 60 * 1000;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub log: LogConfig,
  /// Descriptors for untyped payloads, matched on their `type` field
  #[serde(default)]
  pub resources: Vec<ResourceDescriptor>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Root the relative hrefs are resolved against
  pub url: String,
  /// Extra headers sent with every request
  #[serde(default)]
  pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Default time to live of cached responses, in milliseconds
  #[serde(default = "default_ms_to_live")]
  pub ms_to_live: u64,
  #[serde(default = "default_true")]
  pub re_request_on_stale: bool,
  #[serde(default = "default_true")]
  pub use_cached_version_if_available: bool,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      ms_to_live: DEFAULT_MS_TO_LIVE,
      re_request_on_stale: true,
      use_cached_version_if_available: true,
    }
  }
}

impl CacheConfig {
  pub fn ttl(&self) -> Duration {
    Duration::milliseconds(self.ms_to_live.min(i64::MAX as u64) as i64)
  }

  /// Request options every consumer starts from.
  pub fn request_options(&self) -> RequestOptions {
    RequestOptions {
      use_cached_version_if_available: self.use_cached_version_if_available,
      re_request_on_stale: self.re_request_on_stale,
      ms_to_live: None,
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogConfig {
  /// Also write logs to this file
  pub file: Option<PathBuf>,
}

fn default_ms_to_live() -> u64 {
  DEFAULT_MS_TO_LIVE
}

fn default_true() -> bool {
  true
}

impl Config {
  /// A configuration with defaults for everything but the API root.
  pub fn for_url(url: impl Into<String>) -> Self {
    Self {
      api: ApiConfig {
        url: url.into(),
        headers: BTreeMap::new(),
      },
      cache: CacheConfig::default(),
      log: LogConfig::default(),
      resources: Vec::new(),
    }
  }

  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./halcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/halcache/config.yaml
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
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/halcache/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("halcache.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("halcache").join("config.yaml");
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
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    if config.api.url.trim().is_empty() {
      return Err(eyre!("api.url must not be empty"));
    }
    Ok(config)
  }

  /// Registry built from the `resources` section.
  pub fn registry(&self) -> DescriptorRegistry {
    self.resources.iter().cloned().collect()
  }

  /// Get the API token from the environment.
  ///
  /// Checks HALCACHE_TOKEN.
  pub fn get_api_token() -> Result<String> {
    std::env::var("HALCACHE_TOKEN")
      .map_err(|_| eyre!("API token not found. Set the HALCACHE_TOKEN environment variable."))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_minimal_config_uses_defaults() {
    let config = Config::from_yaml("api:\n  url: https://rest.api/server/api\n").unwrap();
    assert_eq!(config.cache.ms_to_live, 900_000);
    assert_eq!(config.cache.ttl(), Duration::minutes(15));
    assert!(config.cache.re_request_on_stale);
    assert!(config.cache.use_cached_version_if_available);
    assert!(config.log.file.is_none());
    assert!(config.registry().is_empty());
  }

  #[test]
  fn test_full_config() {
    let yaml = r#"
api:
  url: https://rest.api/server/api
  headers:
    X-On-Behalf-Of: admin
cache:
  ms_to_live: 1000
  re_request_on_stale: false
log:
  file: /tmp/halcache.log
resources:
  - type_name: item
    relations:
      - name: owner
        target_type: person
"#;
    let config = Config::from_yaml(yaml).unwrap();
    assert_eq!(config.api.headers.get("X-On-Behalf-Of").unwrap(), "admin");

    let options = config.cache.request_options();
    assert!(!options.re_request_on_stale);
    assert!(options.use_cached_version_if_available);
    assert_eq!(config.cache.ttl(), Duration::milliseconds(1000));
    assert!(config.registry().get("item").unwrap().find_relation("owner").is_some());
  }

  #[test]
  fn test_rejects_empty_url() {
    assert!(Config::from_yaml("api:\n  url: ''\n").is_err());
    assert!(Config::from_yaml("cache:\n  ms_to_live: 5\n").is_err());
  }

  #[test]
  fn test_missing_explicit_path() {
    let err = Config::load(Some(Path::new("/nonexistent/halcache.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }
}
