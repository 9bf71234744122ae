// Holder configuration
// Serde-backed settings, loadable from JSON

use crate::context::{ContextConfig, ContextFlags, GpuVersion};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Configuration for a renderer holder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HolderConfig {
    /// Size of the shared input texture
    pub width: u32,
    pub height: u32,
    /// Highest GPU tier to try; lower tiers are tried on failure
    pub max_version: GpuVersion,
    pub flags: ContextFlags,
    /// 8, or 10 for deep-color targets
    pub color_bits: u8,
    /// Texture unit reported to producers
    pub texture_unit: i32,
    pub thread_name: String,
    /// How long construction waits for the worker to come up
    pub ready_timeout_ms: u64,
}

impl Default for HolderConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            max_version: GpuVersion::V3,
            flags: ContextFlags::empty(),
            color_bits: 8,
            texture_unit: 0,
            thread_name: "renderer-holder".to_string(),
            ready_timeout_ms: 10_000,
        }
    }
}

impl HolderConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: HolderConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path.as_ref())?;
        log::debug!("Loaded holder config from {}", path.as_ref().display());
        Self::from_json(&json)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.width == 0 || self.height == 0 {
            return Err(ConfigError::Invalid(format!(
                "Texture size must be non-zero, got {}x{}",
                self.width, self.height
            )));
        }
        if !matches!(self.color_bits, 8 | 10) {
            return Err(ConfigError::Invalid(format!(
                "Unsupported color depth: {} bits",
                self.color_bits
            )));
        }
        if self.texture_unit < 0 {
            return Err(ConfigError::Invalid(format!(
                "Texture unit must be non-negative, got {}",
                self.texture_unit
            )));
        }
        if self.thread_name.is_empty() {
            return Err(ConfigError::Invalid("Thread name is empty".to_string()));
        }
        if self.ready_timeout_ms == 0 {
            return Err(ConfigError::Invalid("Ready timeout must be non-zero".to_string()));
        }
        Ok(())
    }

    pub fn context_config(&self) -> ContextConfig {
        ContextConfig {
            color_bits: self.color_bits,
            flags: self.flags,
        }
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }
}
