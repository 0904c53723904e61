//! # App Configuration
//!
//! Optional TOML file read with `--config`: engine limits under `[engine]`,
//! HTTP settings under `[server]`. Unknown keys are rejected so typos
//! surface early. The API key is never read from the file.
//!
//! ```toml
//! [engine]
//! max_resolution_depth = 128
//! max_replacements = 500
//!
//! [server]
//! actions_per_second = 20
//! cors_origins = ["http://localhost:3000"]
//! ```

use docflow_core::{DocError, EngineConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Maximum size of a configuration file (64 KiB).
const MAX_CONFIG_FILE_SIZE: u64 = 64 * 1024;

/// Default number of mutating requests accepted per second.
pub const DEFAULT_ACTIONS_PER_SECOND: u32 = 20;

/// Default request body limit (2 MiB).
pub const DEFAULT_MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Contents of a configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub server: ServerSettings,
}

/// HTTP boundary settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSettings {
    /// Actions and restores accepted per second; 0 turns the limit off.
    pub actions_per_second: u32,
    /// Origins allowed cross-origin access. Empty means same-origin only,
    /// `"*"` means any origin.
    pub cors_origins: Vec<String>,
    pub max_body_bytes: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            actions_per_second: DEFAULT_ACTIONS_PER_SECOND,
            cors_origins: Vec::new(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

impl ServerSettings {
    /// Apply `DOCFLOW_ACTION_RATE` and `DOCFLOW_CORS_ORIGINS` on top of the
    /// file values. Malformed values are ignored with a warning.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(rate) = std::env::var("DOCFLOW_ACTION_RATE") {
            match rate.trim().parse() {
                Ok(rate) => self.actions_per_second = rate,
                Err(e) => tracing::warn!(%rate, error = %e, "ignoring DOCFLOW_ACTION_RATE"),
            }
        }
        if let Ok(origins) = std::env::var("DOCFLOW_CORS_ORIGINS") {
            self.cors_origins = origins
                .split(',')
                .map(str::trim)
                .filter(|o| !o.is_empty())
                .map(String::from)
                .collect();
        }
        self
    }
}

impl AppConfig {
    /// Parse configuration text.
    pub fn from_toml(text: &str) -> Result<Self, DocError> {
        toml::from_str(text)
            .map_err(|e| DocError::DeserializationError(format!("config: {}", e)))
    }

    /// Load from `path`, or defaults when no file is given.
    pub fn load(path: Option<&Path>) -> Result<Self, DocError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let metadata = std::fs::metadata(path).map_err(|e| {
            DocError::IoError(format!("Cannot read config '{}': {}", path.display(), e))
        })?;
        if metadata.len() > MAX_CONFIG_FILE_SIZE {
            return Err(DocError::IoError(format!(
                "Config file {} bytes exceeds maximum allowed {} bytes",
                metadata.len(),
                MAX_CONFIG_FILE_SIZE
            )));
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| DocError::IoError(format!("Read config: {}", e)))?;
        let config = Self::from_toml(&text)?;
        tracing::debug!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Engine limits, clamped to the hard maxima.
    #[must_use]
    pub fn engine_config(&self) -> EngineConfig {
        self.engine.clone().sanitized()
    }
}
