pub mod archive;
pub mod config;
pub mod definition;
pub mod errors;
pub mod lockfile;
pub mod notify;
pub mod observability;
pub mod pipeline;
pub mod stages;
pub mod templates;
pub mod tools;
pub mod trigger;
pub mod validation;

pub use config::{ConfigKey, RunConfig};
pub use definition::PipelineDefinition;
pub use errors::{ConfigurationError, PipelineError, StageExecutionError};
pub use notify::{NotificationEvent, Notifier, Severity};
pub use pipeline::{RunContext, RunResult, RunStatus, Stage, StageRegistry, StageRunner};
pub use tools::{CommandRunner, ProcessRunner};
pub use trigger::{TriggerEvent, TriggerKind};
