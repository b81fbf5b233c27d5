use crate::optimizer::OptimizerConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),
}

/// Settings shared by the score test and the full fit. Every field is optional in
/// the TOML file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Number of spectral components; values below one are raised to one.
    pub ncomponents: i64,
    /// One length-scale and period per spatial dimension.
    pub ard: bool,
    pub optimizer: OptimizerConfig,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            ncomponents: 1,
            ard: false,
            optimizer: OptimizerConfig::default(),
        }
    }
}

impl AnalysisConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let toml_string = fs::read_to_string(path)?;
        Ok(toml::from_str(&toml_string)?)
    }
}
