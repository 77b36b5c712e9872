//! Configuration file of the `streams-fiddle` binary.

use crate::config::StreamsConfig;
use anyhow::{Context, Result};
use cluster_core::ClusterConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FiddleConfig {
    #[serde(default)]
    pub cluster: ClusterConfig,

    #[serde(default)]
    pub streams: StreamsConfig,
}

impl FiddleConfig {
    /// Load and validate a JSON config file. Missing keys take their default.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: FiddleConfig = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.streams.validate().context("Invalid streams config")?;
        Ok(config)
    }

    /// Load `path` when given, defaults otherwise.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }
}
