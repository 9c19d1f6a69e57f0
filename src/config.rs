//! Connection profiles
//!
//! Resolved connection parameters per backend, persisted as JSON in the user's
//! config directory. Secrets (passwords, key passphrases) are never written.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::providers::{ProviderConfig, ProviderError, ProviderType, S3Config, SftpConfig};

/// Extra keys holding secrets, dropped before saving
const SECRET_EXTRA_KEYS: &[&str] = &["key_passphrase"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize profiles: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Invalid(#[from] ProviderError),
}

/// Saved profiles keyed by name (the backend name unless chosen otherwise)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionProfiles {
    #[serde(default)]
    pub profiles: BTreeMap<String, ProviderConfig>,
}

impl ConnectionProfiles {
    pub fn get(&self, name: &str) -> Option<&ProviderConfig> {
        self.profiles.get(name)
    }

    /// Store a profile with its secrets stripped
    pub fn insert(&mut self, name: impl Into<String>, mut config: ProviderConfig) {
        config.password = None;
        for key in SECRET_EXTRA_KEYS {
            config.extra.remove(*key);
        }
        self.profiles.insert(name.into(), config);
    }
}

/// Get the path to the profiles file
pub fn config_path() -> PathBuf {
    let config_dir = dirs::config_dir().unwrap_or_else(|| dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")));
    config_dir.join("strata").join("connections.json")
}

/// Load profiles from the default location
pub fn load_profiles() -> ConnectionProfiles {
    load_profiles_from(&config_path())
}

/// Load profiles, falling back to an empty set when the file is missing or unreadable
pub fn load_profiles_from(path: &Path) -> ConnectionProfiles {
    if !path.exists() {
        return ConnectionProfiles::default();
    }
    match fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str(&content) {
            Ok(profiles) => return profiles,
            Err(e) => tracing::warn!("Failed to parse connection profiles: {}", e),
        },
        Err(e) => tracing::warn!("Failed to read connection profiles: {}", e),
    }
    ConnectionProfiles::default()
}

/// Save profiles to the default location
pub fn save_profiles(profiles: &ConnectionProfiles) -> Result<PathBuf, ConfigError> {
    let path = config_path();
    save_profiles_to(profiles, &path)?;
    Ok(path)
}

pub fn save_profiles_to(profiles: &ConnectionProfiles, path: &Path) -> Result<(), ConfigError> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let content = serde_json::to_string_pretty(profiles)?;
    fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    tracing::info!("Connection profiles saved to {:?}", path);
    Ok(())
}

/// Check that a profile can produce a provider configuration
pub fn validate_profile(config: &ProviderConfig) -> Result<(), ConfigError> {
    match config.kind()? {
        ProviderType::S3 => {
            let s3 = S3Config::from_provider_config(config)?;
            if s3.access_key_id.is_empty() != config.password.as_deref().unwrap_or("").is_empty() {
                return Err(ProviderError::InvalidConfig(
                    "Access key and secret key must be given together".to_string(),
                )
                .into());
            }
        }
        ProviderType::Sftp => {
            SftpConfig::from_provider_config(config)?;
        }
        ProviderType::Custom => {}
    }
    Ok(())
}
