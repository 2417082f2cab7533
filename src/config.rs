//! Configuration for healthshare

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::HealthError;
use crate::services::Rewards;

/// Default storage directory
pub fn default_storage_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("healthshare")
}

/// Where encrypted payloads go
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlobBackend {
    /// Content-addressed files under `<storage_dir>/blobs`
    Fs,
    /// Process memory; lost on restart
    Memory,
}

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Database, blobs and config file live here
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    #[serde(default = "default_http_port")]
    pub http_port: u16,

    #[serde(default = "default_bind_host")]
    pub bind_host: String,

    /// Hide internal error detail from clients
    #[serde(default)]
    pub production: bool,

    #[serde(default = "default_blob_backend")]
    pub blob_backend: BlobBackend,

    /// HS256 secret; empty selects the dev secret (refused in production)
    #[serde(default)]
    pub jwt_secret: String,

    /// Bearer token lifetime in seconds
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: u64,

    /// Tokens credited per accepted record
    #[serde(default = "default_submission_reward")]
    pub submission_reward: i64,

    /// Tokens credited to the owner per approved access request
    #[serde(default = "default_participation_reward")]
    pub participation_reward: i64,
}

fn default_http_port() -> u16 {
    8095
}

fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}

fn default_blob_backend() -> BlobBackend {
    BlobBackend::Fs
}

fn default_token_ttl() -> u64 {
    3600
}

fn default_submission_reward() -> i64 {
    10
}

fn default_participation_reward() -> i64 {
    5
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            http_port: default_http_port(),
            bind_host: default_bind_host(),
            production: false,
            blob_backend: default_blob_backend(),
            jwt_secret: String::new(),
            token_ttl_secs: default_token_ttl(),
            submission_reward: default_submission_reward(),
            participation_reward: default_participation_reward(),
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, HealthError> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| HealthError::Config(e.to_string()))
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), HealthError> {
        let content = toml::to_string_pretty(self).map_err(|e| HealthError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject settings that are unsafe or meaningless
    pub fn validate(&self) -> Result<(), HealthError> {
        if self.production && self.jwt_secret.is_empty() {
            return Err(HealthError::Config("jwt_secret is required in production".into()));
        }
        if self.token_ttl_secs == 0 {
            return Err(HealthError::Config("token_ttl_secs must be positive".into()));
        }
        if self.submission_reward <= 0 {
            return Err(HealthError::Config("submission_reward must be positive".into()));
        }
        if self.participation_reward < 0 {
            return Err(HealthError::Config("participation_reward cannot be negative".into()));
        }
        Ok(())
    }

    pub fn rewards(&self) -> Rewards {
        Rewards {
            submission: self.submission_reward,
            participation: self.participation_reward,
        }
    }

    pub fn blobs_dir(&self) -> PathBuf {
        self.storage_dir.join("blobs")
    }

    pub fn config_path(&self) -> PathBuf {
        self.storage_dir.join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_takes_defaults() {
        let config: Config = toml::from_str("http_port = 9000\nproduction = true\njwt_secret = \"x\"").unwrap();
        assert_eq!(config.http_port, 9000);
        assert!(config.production);
        assert_eq!(config.blob_backend, BlobBackend::Fs);
        assert_eq!(config.submission_reward, 10);
        assert_eq!(config.rewards().participation, 5);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        let config = Config {
            storage_dir: dir.path().to_path_buf(),
            blob_backend: BlobBackend::Memory,
            ..Config::default()
        };
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.storage_dir, dir.path());
        assert_eq!(loaded.blob_backend, BlobBackend::Memory);
    }

    #[test]
    fn test_validate() {
        assert!(Config::default().validate().is_ok());

        let production = Config { production: true, ..Config::default() };
        assert!(matches!(production.validate(), Err(HealthError::Config(_))));

        let negative = Config { submission_reward: -1, ..Config::default() };
        assert!(negative.validate().is_err());

        let zero = Config { submission_reward: 0, ..Config::default() };
        assert!(matches!(zero.validate(), Err(HealthError::Config(_))));

        let no_participation = Config { participation_reward: 0, ..Config::default() };
        assert!(no_participation.validate().is_ok());
    }
}
