//! Engine configuration.
//!
//! Every field has a default matching the reference hardware envelope, so an
//! empty JSON object is a valid configuration.

use std::path::Path;

use bufuse_graph::Format;
use serde::{Deserialize, Serialize};

/// Errors raised while loading a [`FusionConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Tunables for the fusion passes and legality rules.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FusionConfig {
    /// Pass names to run; empty runs every registered pass.
    pub enabled_passes: Vec<String>,
    /// Operator types allowed in an elementwise chain after a producer.
    pub allowed_activations: Vec<String>,
    /// Storage layouts that permit zero-copy buffer reuse between operators.
    pub zero_copy_formats: Vec<Format>,
    /// Largest stride supported by the load/store units.
    pub max_stride: i64,
    /// Largest pooling window extent per spatial dimension.
    pub max_pool_window: i64,
    /// Capacity of the on-chip line buffer in bytes.
    pub l1_line_buffer_bytes: i64,
    /// Channel block size of the NC1HWC0 layout.
    pub c0: i64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            enabled_passes: Vec::new(),
            allowed_activations: ["Relu", "Relu6", "LeakyRelu", "Add", "Mul"]
                .into_iter()
                .map(String::from)
                .collect(),
            zero_copy_formats: vec![Format::Nc1hwc0],
            max_stride: 63,
            max_pool_window: 255,
            l1_line_buffer_bytes: 1 << 20,
            c0: 16,
        }
    }
}

impl FusionConfig {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: FusionConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_stride < 1 {
            return Err(ConfigError::Invalid(format!(
                "max_stride must be positive, got {}",
                self.max_stride
            )));
        }
        if self.max_pool_window < 1 {
            return Err(ConfigError::Invalid(format!(
                "max_pool_window must be positive, got {}",
                self.max_pool_window
            )));
        }
        if self.c0 < 1 || self.l1_line_buffer_bytes < 1 {
            return Err(ConfigError::Invalid(
                "c0 and l1_line_buffer_bytes must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Returns `true` if the named pass should run.
    pub fn pass_enabled(&self, name: &str) -> bool {
        self.enabled_passes.is_empty() || self.enabled_passes.iter().any(|p| p == name)
    }
}
