use color_eyre::{eyre::eyre, Result};
use pondok::ClientConfig;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub api: ApiConfig,
  /// Staleness, retry and eviction settings
  #[serde(default)]
  pub cache: ClientConfig,
  /// Save the cache to disk on exit and restore it on start
  #[serde(default)]
  pub persist: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  #[serde(default = "default_base_url")]
  pub base_url: String,
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
  /// Extra or overriding routes, keyed by resource kind
  #[serde(default)]
  pub routes: BTreeMap<String, String>,
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      base_url: default_base_url(),
      timeout_secs: default_timeout_secs(),
      routes: BTreeMap::new(),
    }
  }
}

fn default_base_url() -> String {
  "http://localhost:8000/api/v1".to_string()
}

fn default_timeout_secs() -> u64 {
  10
}

impl ApiConfig {
  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.timeout_secs)
  }
}

impl Config {
  /// Read the config file, or fall back to defaults when there is none.
  ///
  /// An explicit path must exist. Otherwise the first existing file of
  /// [`Config::candidates`] is used.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = match explicit_path {
      Some(p) if !p.exists() => return Err(eyre!("Config file not found: {}", p.display())),
      Some(p) => Some(p.to_path_buf()),
      None => Self::candidates().into_iter().find(|p| p.exists()),
    };
    let Some(path) = path else {
      tracing::debug!("no config file found, using defaults");
      return Ok(Self::default());
    };

    tracing::debug!(path = %path.display(), "loading config");
    let contents = std::fs::read_to_string(&path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;
    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  /// `./pondok.yaml`, then `pondok/config.yaml` under the user config dir.
  fn candidates() -> Vec<PathBuf> {
    std::iter::once(PathBuf::from("pondok.yaml"))
      .chain(dirs::config_dir().map(|dir| dir.join("pondok").join("config.yaml")))
      .collect()
  }

  fn parse(contents: &str) -> Result<Self, serde_yaml::Error> {
    serde_yaml::from_str(contents)
  }

  /// Get the API token from the environment, if set.
  ///
  /// Checks PONDOK_API_TOKEN.
  pub fn get_api_token() -> Option<String> {
    std::env::var("PONDOK_API_TOKEN")
      .ok()
      .filter(|token| !token.is_empty())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_full_config() {
    let config = Config::parse(
      r#"
api:
  base_url: https://pondok.example/api/v1
  timeout_secs: 5
  routes:
    donations: /donations
cache:
  stale_time_secs: 120
  gc_time_secs: 600
  retry:
    max_retries: 2
    base_delay_ms: 500
  resources:
    pesantren-stats:
      stale_time_secs: 3600
persist: true
"#,
    )
    .unwrap();

    assert_eq!(config.api.base_url, "https://pondok.example/api/v1");
    assert_eq!(config.api.timeout(), Duration::from_secs(5));
    assert_eq!(config.api.routes["donations"], "/donations");
    assert_eq!(config.cache.stale_time, Duration::from_secs(120));
    assert_eq!(config.cache.retry.max_retries, 2);
    assert_eq!(
      config.cache.options_for("pesantren-stats").stale_time,
      Duration::from_secs(3600)
    );
    assert!(config.persist);
  }

  #[test]
  fn test_empty_config_uses_defaults() {
    let config = Config::parse("{}").unwrap();
    assert_eq!(config.api.base_url, default_base_url());
    assert_eq!(config.cache.gc_time, Duration::from_secs(300));
    assert!(!config.persist);
  }

  #[test]
  fn test_missing_explicit_path_is_an_error() {
    let path = std::env::temp_dir().join("pondok-no-such-config.yaml");
    let err = Config::load(Some(&path)).unwrap_err();
    assert!(err.to_string().contains("not found"));
  }

  #[test]
  fn test_load_explicit_file() {
    let path = std::env::temp_dir().join(format!("pondok-config-{}.yaml", std::process::id()));
    std::fs::write(&path, "api:\n  timeout_secs: 3\npersist: true\n").unwrap();

    let config = Config::load(Some(&path));
    std::fs::remove_file(&path).unwrap();
    let config = config.unwrap();
    assert_eq!(config.api.timeout(), Duration::from_secs(3));
    assert_eq!(config.api.base_url, default_base_url());
    assert!(config.persist);
  }

  #[test]
  fn test_unparsable_file_names_the_path() {
    let path = std::env::temp_dir().join(format!("pondok-broken-{}.yaml", std::process::id()));
    std::fs::write(&path, "api: [unterminated").unwrap();

    let err = Config::load(Some(&path)).unwrap_err();
    std::fs::remove_file(&path).unwrap();
    assert!(err.to_string().contains("pondok-broken"));
  }

  #[test]
  fn test_candidates_start_with_local_file() {
    assert_eq!(Config::candidates()[0], PathBuf::from("pondok.yaml"));
  }
}
