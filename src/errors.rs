//! Error taxonomy for pipeline runs.
//!
//! Configuration and definition problems are detected before the first stage
//! starts and abort the run without a notification. Stage execution errors
//! are the only errors that happen mid-run; they end the run as `Failed`.

use serde::Serialize;
use thiserror::Error;

/// An external tool reported failure, or a stage could not complete its work.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("stage '{stage}' failed{}: {detail}", .exit_code.map(|c| format!(" with exit code {c}")).unwrap_or_default())]
pub struct StageExecutionError {
    pub stage: String,
    pub exit_code: Option<i32>,
    pub detail: String,
}

impl StageExecutionError {
    pub fn new(stage: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            exit_code: None,
            detail: detail.into(),
        }
    }

    pub fn with_exit_code(mut self, code: Option<i32>) -> Self {
        self.exit_code = code;
        self
    }
}

/// A credential or environment value needed by the pipeline is missing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("stage '{stage}' requires configuration option '{key}' which is not set")]
    MissingOption { stage: String, key: &'static str },

    #[error("environment variable '{var}' referenced by '{key}' is not set")]
    MissingEnvironment { key: &'static str, var: String },

    #[error("invalid value for '{key}': {reason}")]
    InvalidValue { key: &'static str, reason: String },
}

/// The pipeline file itself is malformed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DefinitionError {
    #[error("unsupported pipeline version: {0}")]
    UnsupportedVersion(u32),

    #[error("pipeline must contain at least one stage")]
    Empty,

    #[error("duplicate stage name '{0}'")]
    DuplicateStage(String),

    #[error("stage {index} ('{name}'): {reason}")]
    InvalidStage {
        index: usize,
        name: String,
        reason: String,
    },
}

/// Errors that prevent a run from starting.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error("failed to construct stage '{stage}': {reason}")]
    StageConstruction { stage: String, reason: String },
}
