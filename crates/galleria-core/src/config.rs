//! Application configuration management.
//!
//! This module handles loading and saving the client configuration: backend
//! URL, request timeout, where tokens are kept and how concurrent token
//! refreshes are coordinated.
//!
//! Configuration is stored at `~/.config/galleria/config.json`. Environment
//! variables override file values after loading.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::auth::{
    CredentialStore, EncryptedFileBackend, KeyringBackend, MemoryBackend, RefreshPolicy,
    SERVICE_NAME,
};

/// Application name used for config/data directory paths
const APP_NAME: &str = "galleria";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Default backend location for a local development server
pub const DEFAULT_API_BASE_URL: &str = "http://127.0.0.1:8000/api";

/// HTTP request timeout in seconds.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

pub const ENV_API_URL: &str = "GALLERIA_API_URL";
pub const ENV_CREDENTIAL_BACKEND: &str = "GALLERIA_CREDENTIAL_BACKEND";
pub const ENV_TIMEOUT_SECS: &str = "GALLERIA_TIMEOUT_SECS";
/// Passphrase for the encrypted token file backend
pub const ENV_TOKEN_PASSPHRASE: &str = "GALLERIA_TOKEN_PASSPHRASE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialBackendKind {
    #[default]
    Keyring,
    File,
    Memory,
}

impl std::str::FromStr for CredentialBackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "keyring" => Ok(Self::Keyring),
            "file" => Ok(Self::File),
            "memory" => Ok(Self::Memory),
            other => Err(anyhow::anyhow!("Unknown credential backend: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_base_url: String,
    pub request_timeout_secs: u64,
    pub credential_backend: CredentialBackendKind,
    pub refresh_policy: RefreshPolicy,
    pub last_username: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            credential_backend: CredentialBackendKind::default(),
            refresh_policy: RefreshPolicy::default(),
            last_username: None,
        }
    }
}

impl Config {
    /// Load from disk (defaults if absent), then apply environment overrides
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents).context("Failed to parse config file")?
        } else {
            Self::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Apply overrides from `lookup` (the process environment in production)
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_API_URL).filter(|u| !u.trim().is_empty()) {
            self.api_base_url = url.trim().to_string();
        }
        if let Some(raw) = lookup(ENV_CREDENTIAL_BACKEND) {
            match raw.parse() {
                Ok(kind) => self.credential_backend = kind,
                Err(e) => warn!(error = %e, "Ignoring {}", ENV_CREDENTIAL_BACKEND),
            }
        }
        if let Some(raw) = lookup(ENV_TIMEOUT_SECS) {
            match raw.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => self.request_timeout_secs = secs,
                _ => warn!(value = %raw, "Ignoring invalid {}", ENV_TIMEOUT_SECS),
            }
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Directory for the encrypted token file and log files
    pub fn data_dir(&self) -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME))
    }

    /// Build the credential store selected by `credential_backend`
    pub fn credential_store(&self) -> Result<CredentialStore> {
        let store = match self.credential_backend {
            CredentialBackendKind::Keyring => {
                CredentialStore::new(Arc::new(KeyringBackend::new(SERVICE_NAME)))
            }
            CredentialBackendKind::File => {
                let passphrase = std::env::var(ENV_TOKEN_PASSPHRASE).with_context(|| {
                    format!("{} must be set to use the file credential backend", ENV_TOKEN_PASSPHRASE)
                })?;
                let dir = self.data_dir()?.join("tokens");
                CredentialStore::new(Arc::new(EncryptedFileBackend::new(dir, passphrase)))
            }
            CredentialBackendKind::Memory => CredentialStore::new(Arc::new(MemoryBackend::new())),
        };
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let config: Config = serde_json::from_str(r#"{"last_username": "mei"}"#).unwrap();
        assert_eq!(config.api_base_url, DEFAULT_API_BASE_URL);
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.credential_backend, CredentialBackendKind::Keyring);
        assert_eq!(config.refresh_policy, RefreshPolicy::Coalesce);
        assert_eq!(config.last_username.as_deref(), Some("mei"));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_overrides(env(&[
            (ENV_API_URL, "https://photos.example.com/api/"),
            (ENV_CREDENTIAL_BACKEND, "File"),
            (ENV_TIMEOUT_SECS, "5"),
        ]));
        assert_eq!(config.api_base_url, "https://photos.example.com/api/");
        assert_eq!(config.credential_backend, CredentialBackendKind::File);
        assert_eq!(config.request_timeout_secs, 5);
    }

    #[test]
    fn test_invalid_overrides_are_ignored() {
        let mut config = Config::default();
        config.apply_overrides(env(&[
            (ENV_API_URL, "  "),
            (ENV_CREDENTIAL_BACKEND, "floppy"),
            (ENV_TIMEOUT_SECS, "0"),
        ]));
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_config_round_trips_through_json() {
        let config = Config {
            refresh_policy: RefreshPolicy::Independent,
            credential_backend: CredentialBackendKind::Memory,
            ..Config::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains(r#""refresh_policy":"independent""#));
        assert_eq!(serde_json::from_str::<Config>(&json).unwrap(), config);
    }

    #[test]
    fn test_memory_backend_store() {
        let config = Config {
            credential_backend: CredentialBackendKind::Memory,
            ..Config::default()
        };
        let store = config.credential_store().unwrap();
        assert!(store.load().unwrap().is_none());
    }
}
