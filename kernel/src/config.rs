// Rebuild Configuration
//
// Optional JSON settings for a rebuild. Every field has a default,
// so an empty object is a valid configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::log::LOG_NAME_PREFIX;
use crate::store::{StoreConfig, VerificationLevel};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RebuildConfig {
    /// File name prefix of log segments, in source and target alike.
    pub log_prefix: String,

    /// Size in bytes past which the target starts a new log segment.
    pub log_rotation_threshold: u64,

    /// Keep every log segment of the rebuilt store on shutdown.
    pub keep_target_logs: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

impl Default for RebuildConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl RebuildConfig {
    /// Built-in configuration used when no file is given.
    pub fn default_config() -> Self {
        Self {
            log_prefix: LOG_NAME_PREFIX.into(),
            log_rotation_threshold: 16 * 1024 * 1024,
            keep_target_logs: true,
        }
    }

    pub fn from_json(data: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&data)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.log_prefix.is_empty() {
            return Err(ConfigError::Invalid("log_prefix must not be empty".into()));
        }
        if self.log_prefix.contains(|c| c == '/' || c == '\\') {
            return Err(ConfigError::Invalid(format!(
                "log_prefix {:?} must not contain a path separator",
                self.log_prefix
            )));
        }
        // The ordinal is parsed from the digits after the prefix.
        if self.log_prefix.ends_with(|c: char| c.is_ascii_digit()) {
            return Err(ConfigError::Invalid(format!(
                "log_prefix {:?} must not end in a digit",
                self.log_prefix
            )));
        }
        if self.log_rotation_threshold == 0 {
            return Err(ConfigError::Invalid(
                "log_rotation_threshold must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Store options for the replay source. Logs are always kept.
    pub fn source_store_config(&self) -> StoreConfig {
        StoreConfig {
            keep_logical_logs: true,
            verification: VerificationLevel::Logging,
            log_prefix: self.log_prefix.clone(),
            log_rotation_threshold: self.log_rotation_threshold,
        }
    }

    pub fn target_store_config(&self, full: bool) -> StoreConfig {
        StoreConfig {
            keep_logical_logs: self.keep_target_logs,
            verification: if full {
                VerificationLevel::FullWithLogging
            } else {
                VerificationLevel::Logging
            },
            log_prefix: self.log_prefix.clone(),
            log_rotation_threshold: self.log_rotation_threshold,
        }
    }
}
