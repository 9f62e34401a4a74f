use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use drover::agent::AgentConfig;
use drover::environments::LocalEnvironmentConfig;
use drover::providers::ModelConfig;

/// Settings file layout: one YAML document with a section per component.
/// Every section and every field is optional; anything omitted falls back
/// to the component defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub agent: AgentConfig,
    pub model: ModelConfig,
    pub environment: LocalEnvironmentConfig,
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("failed to read settings file {}", path.display()))?;
        serde_yaml::from_str(&data)
            .with_context(|| format!("failed to parse settings file {}", path.display()))
    }
}
