use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};

/// Persisted settings.
///
/// Every field is a string so a half-filled config file loads cleanly;
/// missing fields default to empty and are validated only at the point of
/// use (`credentials`, `require_channels`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub api_id: String,
    #[serde(default)]
    pub api_hash: String,
    #[serde(default)]
    pub source_channel_id: String,
    #[serde(default)]
    pub destination_channel_id: String,
    #[serde(default)]
    pub phone_number: String,
}

impl Config {
    /// `~/.tgrelay` (falls back to the current directory without a home).
    pub fn default_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".tgrelay")
    }

    pub fn default_path() -> PathBuf {
        Self::default_dir().join("config.json")
    }

    /// Load from `path`; a missing file yields the default (all-empty) config.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Set a field by its persisted key name. Unknown keys are rejected so a
    /// typo in `config set` does not silently write a dead field.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "api_id" => self.api_id = value.to_string(),
            "api_hash" => self.api_hash = value.to_string(),
            "source_channel_id" => self.source_channel_id = value.to_string(),
            "destination_channel_id" => self.destination_channel_id = value.to_string(),
            "phone_number" => self.phone_number = value.to_string(),
            other => return Err(RelayError::Config(format!("unknown config key: {other}"))),
        }
        Ok(())
    }

    /// API credentials, validated: both must be present and `api_id` numeric.
    pub fn credentials(&self) -> Result<(i32, String)> {
        if self.api_id.is_empty() || self.api_hash.is_empty() {
            return Err(RelayError::Config(
                "api_id and api_hash must be set (see `config set`)".to_string(),
            ));
        }
        let api_id = self
            .api_id
            .parse::<i32>()
            .map_err(|_| RelayError::Config(format!("api_id is not numeric: {}", self.api_id)))?;
        Ok((api_id, self.api_hash.clone()))
    }

    pub fn require_channels(&self) -> Result<()> {
        if self.source_channel_id.is_empty() || self.destination_channel_id.is_empty() {
            return Err(RelayError::Config(
                "source_channel_id and destination_channel_id must be set".to_string(),
            ));
        }
        Ok(())
    }
}
