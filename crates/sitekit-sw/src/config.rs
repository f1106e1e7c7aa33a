//! Host configuration file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sitekit_common::{LogFormat, RetryConfig};
use sitekit_net::LoaderConfig;
use url::Url;

use crate::{ServiceWorkerError, SwResult};

/// Settings for hosting a worker outside a browser.
///
/// Every field has a default, so a config file only needs the keys it
/// changes:
///
/// ```json
/// { "origin": "https://learn.example.com", "loader": { "timeout_secs": 5 } }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Site origin the worker serves.
    pub origin: Option<Url>,
    /// Build manifest to install.
    pub manifest: Option<PathBuf>,
    /// Directory holding the cache buckets.
    pub cache_dir: PathBuf,
    pub loader: LoaderSettings,
    pub install_retry: RetrySettings,
    /// One of `pretty`, `compact`, `json`.
    pub log_format: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            origin: None,
            manifest: None,
            cache_dir: default_cache_dir(),
            loader: LoaderSettings::default(),
            install_retry: RetrySettings::default(),
            log_format: "pretty".to_string(),
        }
    }
}

/// Network loader settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderSettings {
    pub user_agent: Option<String>,
    pub timeout_secs: u64,
    pub max_redirects: usize,
}

impl Default for LoaderSettings {
    fn default() -> Self {
        let defaults = LoaderConfig::default();
        Self {
            user_agent: None,
            timeout_secs: defaults.default_timeout.as_secs(),
            max_redirects: defaults.max_redirects,
        }
    }
}

/// Install retry settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            initial_delay_ms: 250,
        }
    }
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("sitekit")
        .join("sw")
}

impl HostConfig {
    /// Parse a config from JSON.
    pub fn from_json(json: &str) -> SwResult<Self> {
        serde_json::from_str(json).map_err(|e| ServiceWorkerError::ConfigError(e.to_string()))
    }

    /// Read a config file.
    pub async fn load(path: impl AsRef<Path>) -> SwResult<Self> {
        let path = path.as_ref();
        let json = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ServiceWorkerError::ConfigError(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&json)
            .map_err(|e| ServiceWorkerError::ConfigError(format!("{}: {}", path.display(), e)))
    }

    pub fn loader_config(&self) -> LoaderConfig {
        let defaults = LoaderConfig::default();
        LoaderConfig {
            user_agent: self.loader.user_agent.clone().unwrap_or(defaults.user_agent),
            default_timeout: Duration::from_secs(self.loader.timeout_secs),
            max_redirects: self.loader.max_redirects,
        }
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::fixed(
            self.install_retry.max_attempts,
            Duration::from_millis(self.install_retry.initial_delay_ms),
        )
    }

    pub fn log_format(&self) -> SwResult<LogFormat> {
        self.log_format
            .parse()
            .map_err(|e: sitekit_common::SiteKitError| ServiceWorkerError::ConfigError(e.to_string()))
    }

    /// The configured origin, or a config error naming the missing key.
    pub fn require_origin(&self) -> SwResult<&Url> {
        self.origin
            .as_ref()
            .ok_or_else(|| ServiceWorkerError::ConfigError("origin is not set".into()))
    }

    /// The configured manifest path, or a config error naming the missing key.
    pub fn require_manifest(&self) -> SwResult<&Path> {
        self.manifest
            .as_deref()
            .ok_or_else(|| ServiceWorkerError::ConfigError("manifest is not set".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HostConfig::default();
        assert!(config.origin.is_none());
        assert!(config.cache_dir.ends_with("sitekit/sw"));
        assert_eq!(config.loader.timeout_secs, 30);
        assert_eq!(config.retry_config().max_attempts, 1);
        assert_eq!(config.log_format().unwrap(), LogFormat::Pretty);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = HostConfig::from_json(
            r#"{ "origin": "https://learn.example.com", "loader": { "timeout_secs": 5 } }"#,
        )
        .unwrap();

        assert_eq!(config.require_origin().unwrap().as_str(), "https://learn.example.com/");
        assert_eq!(config.loader_config().default_timeout, Duration::from_secs(5));
        assert_eq!(config.loader.max_redirects, LoaderConfig::default().max_redirects);
        assert!(config.require_manifest().is_err());
    }

    #[test]
    fn test_retry_settings() {
        let config =
            HostConfig::from_json(r#"{ "install_retry": { "max_attempts": 4, "initial_delay_ms": 10 } }"#)
                .unwrap();
        let retry = config.retry_config();
        assert_eq!(retry.max_attempts, 4);
        assert_eq!(retry.delay_for_attempt(2), Duration::from_millis(10));
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            HostConfig::from_json(r#"{ "origin": "not a url" }"#),
            Err(ServiceWorkerError::ConfigError(_))
        ));

        let config = HostConfig::from_json(r#"{ "log_format": "xml" }"#).unwrap();
        assert!(matches!(config.log_format(), Err(ServiceWorkerError::ConfigError(_))));
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sw.json");
        std::fs::write(&path, r#"{ "cache_dir": "/tmp/sitekit-test", "log_format": "json" }"#).unwrap();

        let config = HostConfig::load(&path).await.unwrap();
        assert_eq!(config.cache_dir, PathBuf::from("/tmp/sitekit-test"));
        assert_eq!(config.log_format().unwrap(), LogFormat::Json);

        assert!(HostConfig::load(dir.path().join("missing.json")).await.is_err());
    }
}
