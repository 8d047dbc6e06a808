use std::collections::HashSet;

use anyhow::Result;
use serde::Serialize;

use crate::definition::{PipelineDefinition, SUPPORTED_VERSION};
use crate::pipeline::{StageRegistry, StageSpec};

#[derive(Debug, Default, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

pub fn validate_definition(def: &PipelineDefinition, registry: &StageRegistry) -> ValidationReport {
    let mut report = ValidationReport::default();

    if def.version != SUPPORTED_VERSION {
        report
            .errors
            .push(format!("Unsupported pipeline version: {}", def.version));
    }

    if def.name.trim().is_empty() {
        report.errors.push("Pipeline name cannot be empty".into());
    }

    if def.stages.is_empty() {
        report
            .errors
            .push("Pipeline must contain at least one stage".into());
    }

    let mut seen = HashSet::new();
    for (idx, stage) in def.stages.iter().enumerate() {
        let label = format!("Stage {} ('{}')", idx + 1, stage.name);
        if stage.name.trim().is_empty() {
            report.errors.push(format!("Stage {} has an empty name", idx + 1));
        } else if !seen.insert(stage.name.as_str()) {
            report
                .errors
                .push(format!("{label}: duplicate stage name"));
        }
        report.merge(validate_patterns(&label, stage));
        report.merge(validate_stage_order(idx, stage, &def.stages));
        if let Err(err) = validate_stage(stage, registry) {
            report.errors.push(format!("{label}: {err:#}"));
        }
    }

    report
}

fn validate_stage(stage: &StageSpec, registry: &StageRegistry) -> Result<()> {
    let params = stage.params.clone().unwrap_or_default();
    registry.create(&stage.uses, params)?;
    Ok(())
}

fn validate_patterns(label: &str, stage: &StageSpec) -> ValidationReport {
    let mut report = ValidationReport::default();
    for pattern in &stage.archive_on_success {
        if pattern.trim().is_empty() {
            report
                .errors
                .push(format!("{label}: archive patterns cannot be empty"));
        } else if let Err(err) = glob::Pattern::new(pattern) {
            report.errors.push(format!(
                "{label}: archive pattern '{pattern}' is not a valid glob: {err}"
            ));
        } else if pattern.starts_with('/') || pattern.split('/').any(|part| part == "..") {
            report.errors.push(format!(
                "{label}: archive pattern '{pattern}' must stay inside the workspace"
            ));
        }
    }
    for pattern in &stage.branches {
        if let Err(err) = glob::Pattern::new(pattern) {
            report.errors.push(format!(
                "{label}: branch pattern '{pattern}' is not a valid glob: {err}"
            ));
        }
    }
    if stage.allow_empty_archive && stage.archive_on_success.is_empty() {
        report.warnings.push(format!(
            "{label}: allow_empty_archive has no effect without archive_on_success"
        ));
    }
    report
}

fn validate_stage_order(idx: usize, stage: &StageSpec, pipeline: &[StageSpec]) -> ValidationReport {
    let mut report = ValidationReport::default();
    let earlier = &pipeline[..idx];
    let param = |key: &str| {
        stage
            .params
            .as_ref()
            .and_then(|p| p.get(key))
            .and_then(|v| v.as_str())
    };
    let builds_image = earlier.iter().any(|prev| prev.uses == "image");

    match stage.uses.as_str() {
        "image-scan" if param("image").is_none() && param("command").is_none() && !builds_image => {
            report.errors.push(format!(
                "Stage {} ('{}') scans {{image}} but no image stage runs before it",
                idx + 1,
                stage.name
            ));
        }
        "publish"
            if matches!(param("target"), None | Some("docker"))
                && param("image").is_none()
                && !builds_image =>
        {
            report.errors.push(format!(
                "Stage {} ('{}') pushes {{image}} but no image stage runs before it",
                idx + 1,
                stage.name
            ));
        }
        "deploy" if stage.branches.is_empty() => {
            report.warnings.push(format!(
                "Stage {} ('{}') deploys on every branch; consider a 'branches' filter",
                idx + 1,
                stage.name
            ));
        }
        _ => {}
    }
    if stage.uses == "image" && earlier.iter().any(|prev| prev.uses == "image") {
        report.warnings.push(format!(
            "Stage {} ('{}') builds a second image; later stages see only the last one",
            idx + 1,
            stage.name
        ));
    }
    report
}
