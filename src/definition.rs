use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::config::ConfigSpec;
use crate::notify::NotifierSpec;
use crate::pipeline::StageSpec;

pub const SUPPORTED_VERSION: u32 = 1;

/// A declarative pipeline file.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PipelineDefinition {
    pub version: u32,
    pub name: String,
    #[serde(default)]
    pub config: ConfigSpec,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notify: Vec<NotifierSpec>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub notify_on_start: bool,
    pub stages: Vec<StageSpec>,
}

impl PipelineDefinition {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline file: {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Failed to parse pipeline YAML: {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn stage(&self, name: &str) -> Option<&StageSpec> {
        self.stages.iter().find(|s| s.name == name)
    }
}
