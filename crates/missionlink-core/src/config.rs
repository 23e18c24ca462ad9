//! Application configuration management.
//!
//! Configuration is stored at `~/.config/missionlink/config.json`. Backend
//! credentials may also come from the environment (`MISSIONLINK_API_URL`,
//! `MISSIONLINK_API_KEY`, `MISSIONLINK_ACCESS_TOKEN`), which wins over the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::offline::DEFAULT_PRECACHE;
use crate::query::RetryPolicy;

/// Application name used for config/cache directory paths
const APP_NAME: &str = "missionlink";

/// Config file name
const CONFIG_FILE: &str = "config.json";

const ENV_API_URL: &str = "MISSIONLINK_API_URL";
const ENV_API_KEY: &str = "MISSIONLINK_API_KEY";
const ENV_ACCESS_TOKEN: &str = "MISSIONLINK_ACCESS_TOKEN";

const DEFAULT_STALE_TIME_SECS: u64 = 30;
const DEFAULT_RETRY_ATTEMPTS: u32 = 3;

fn default_stale_time() -> u64 {
    DEFAULT_STALE_TIME_SECS
}

fn default_retry_attempts() -> u32 {
    DEFAULT_RETRY_ATTEMPTS
}

fn default_precache() -> Vec<String> {
    DEFAULT_PRECACHE.iter().map(|s| s.to_string()).collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Base URL of the data API backend
    pub api_url: Option<String>,
    /// Public (anonymous) API key
    pub api_key: Option<String>,
    /// Bearer token of the signed-in user
    pub access_token: Option<String>,
    /// User id the resource commands act for
    pub user_id: Option<String>,
    /// Origin of the web application served through the offline cache
    pub app_origin: Option<String>,
    pub cache_dir: Option<PathBuf>,
    #[serde(default = "default_precache")]
    pub precache: Vec<String>,
    #[serde(default = "default_stale_time")]
    pub stale_time_secs: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Directory for daily log files; stderr only when unset
    pub log_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: None,
            api_key: None,
            access_token: None,
            user_id: None,
            app_origin: None,
            cache_dir: None,
            precache: default_precache(),
            stale_time_secs: DEFAULT_STALE_TIME_SECS,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            log_dir: None,
        }
    }
}

impl Config {
    /// Load the config file (if any), then apply environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path()?)?;
        config.apply_env(|name| std::env::var(name).ok());
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let lookup = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        if let Some(url) = lookup(ENV_API_URL) {
            self.api_url = Some(url);
        }
        if let Some(key) = lookup(ENV_API_KEY) {
            self.api_key = Some(key);
        }
        if let Some(token) = lookup(ENV_ACCESS_TOKEN) {
            self.access_token = Some(token);
        }
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Directory of the offline cache partitions.
    pub fn cache_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.cache_dir {
            return Ok(dir.clone());
        }
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    /// Directory of local values.
    pub fn data_dir(&self) -> Result<PathBuf> {
        let data_dir = dirs::data_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME))
    }

    pub fn api_url(&self) -> Result<&str> {
        self.api_url
            .as_deref()
            .with_context(|| format!("No API URL configured (set {} or api_url)", ENV_API_URL))
    }

    /// Host of the data API; the offline cache never serves it.
    pub fn api_host(&self) -> Option<String> {
        let url = url::Url::parse(self.api_url.as_deref()?).ok()?;
        url.host_str().map(str::to_string)
    }

    pub fn api_key(&self) -> Result<&str> {
        self.api_key
            .as_deref()
            .with_context(|| format!("No API key configured (set {} or api_key)", ENV_API_KEY))
    }

    pub fn stale_time(&self) -> Duration {
        Duration::from_secs(self.stale_time_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_attempts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = Config::load_from(&dir.path().join("config.json")).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.precache.len(), DEFAULT_PRECACHE.len());
    }

    #[test]
    fn test_round_trip_and_partial_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("config.json");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, r#"{"api_url": "https://db.example", "retry_attempts": 5}"#).unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.api_url().unwrap(), "https://db.example");
        assert_eq!(config.retry_policy().max_attempts, 5);
        assert_eq!(config.stale_time(), Duration::from_secs(30));

        config.save_to(&path).unwrap();
        assert_eq!(Config::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config = Config {
            api_url: Some("https://file.example".to_string()),
            api_key: Some("file-key".to_string()),
            ..Config::default()
        };
        let env: HashMap<&str, &str> = [
            (ENV_API_URL, "https://env.example"),
            (ENV_ACCESS_TOKEN, "token"),
            (ENV_API_KEY, "  "),
        ]
        .into_iter()
        .collect();

        config.apply_env(|name| env.get(name).map(|v| v.to_string()));
        assert_eq!(config.api_url.as_deref(), Some("https://env.example"));
        assert_eq!(config.api_key.as_deref(), Some("file-key"));
        assert_eq!(config.access_token.as_deref(), Some("token"));
    }

    #[test]
    fn test_missing_credentials_are_errors() {
        let config = Config::default();
        assert!(config.api_url().is_err());
        assert!(config.api_key().is_err());
        assert!(config.api_host().is_none());
    }

    #[test]
    fn test_api_host() {
        let config = Config {
            api_url: Some("https://abc.backend.example/".to_string()),
            ..Config::default()
        };
        assert_eq!(config.api_host().as_deref(), Some("abc.backend.example"));

        let config = Config {
            api_url: Some("not a url".to_string()),
            ..Config::default()
        };
        assert!(config.api_host().is_none());
    }

    #[test]
    fn test_invalid_file_reports_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        std::fs::write(&path, "not json").unwrap();
        let err = Config::load_from(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }
}
