use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::definition::PipelineDefinition;
use crate::pipeline::StageSpec;

#[derive(Debug, Serialize, Deserialize)]
pub struct PipelineLock {
    pub pipeline_version: u32,
    pub pipeline: String,
    pub generated_at: DateTime<Utc>,
    pub stages: Vec<StageLock>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageLock {
    pub name: String,
    pub uses: String,
    pub params_hash: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub branches: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub archive_on_success: Vec<String>,
}

impl PipelineLock {
    pub fn from_definition(def: &PipelineDefinition) -> Self {
        Self {
            pipeline_version: def.version,
            pipeline: def.name.clone(),
            generated_at: Utc::now(),
            stages: def.stages.iter().map(lock_stage).collect(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open lockfile: {}", path.display()))?;
        serde_yaml::from_reader(file)
            .with_context(|| format!("Failed to parse lockfile: {}", path.display()))
    }

    /// Names of stages whose kind, parameters, filters or archive globs
    /// differ from `def`, plus stages added or removed.
    pub fn drift(&self, def: &PipelineDefinition) -> Vec<String> {
        let current: Vec<StageLock> = def.stages.iter().map(lock_stage).collect();
        let mut drifted = Vec::new();
        for (idx, locked) in self.stages.iter().enumerate() {
            match current.get(idx) {
                Some(now) if now == locked => {}
                Some(now) if now.name == locked.name => drifted.push(locked.name.clone()),
                Some(now) => drifted.push(format!("{} -> {}", locked.name, now.name)),
                None => drifted.push(format!("{} (removed)", locked.name)),
            }
        }
        for extra in current.iter().skip(self.stages.len()) {
            drifted.push(format!("{} (added)", extra.name));
        }
        drifted
    }
}

pub fn generate_lock(def: &PipelineDefinition, path: &Path) -> Result<()> {
    let lock = PipelineLock::from_definition(def);
    let file = File::create(path)
        .with_context(|| format!("Failed to create lockfile: {}", path.display()))?;
    serde_yaml::to_writer(file, &lock)
        .with_context(|| format!("Failed to write lockfile: {}", path.display()))?;
    Ok(())
}

fn lock_stage(spec: &StageSpec) -> StageLock {
    StageLock {
        name: spec.name.clone(),
        uses: spec.uses.clone(),
        params_hash: hash_params(spec),
        branches: spec.branches.clone(),
        archive_on_success: spec.archive_on_success.clone(),
    }
}

fn hash_params(spec: &StageSpec) -> String {
    let mut hasher = Sha256::new();
    // serde_json maps are ordered by key, so equal parameters hash equally.
    let serialized = serde_json::to_vec(&spec.params.clone().unwrap_or_default()).unwrap_or_default();
    hasher.update(spec.uses.as_bytes());
    hasher.update([0]);
    hasher.update(serialized);
    format!("{:x}", hasher.finalize())
}
