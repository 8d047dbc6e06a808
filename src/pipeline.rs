use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Result, anyhow};
use glob::Pattern;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{error, info, instrument, warn};

use crate::archive::{ArchivedFile, Archiver};
use crate::config::{ConfigKey, RunConfig};
use crate::errors::{ConfigurationError, DefinitionError, PipelineError, StageExecutionError};
use crate::notify::{NotificationEvent, Notifier, Severity};
use crate::observability::MetricsCollector;
use crate::tools::CommandRunner;
use crate::trigger::TriggerEvent;

pub type StageParameters = Map<String, Value>;

/// One entry of the `stages:` list in a pipeline file.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StageSpec {
    pub name: String,
    pub uses: String,
    #[serde(default, rename = "with", skip_serializing_if = "Option::is_none")]
    pub params: Option<StageParameters>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub archive_on_success: Vec<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub allow_empty_archive: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub branches: Vec<String>,
}

impl StageSpec {
    pub fn new(name: impl Into<String>, uses: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uses: uses.into(),
            params: None,
            archive_on_success: Vec::new(),
            allow_empty_archive: false,
            branches: Vec::new(),
        }
    }
}

/// Mutable state threaded through the stages of one run.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: String,
    pub pipeline: String,
    pub workdir: PathBuf,
    pub trigger: TriggerEvent,
    pub config: RunConfig,
    /// Values published by earlier stages, usable as `{name}` placeholders.
    pub variables: BTreeMap<String, String>,
    pub current_stage: String,
}

impl RunContext {
    pub fn new(
        pipeline: impl Into<String>,
        run_id: impl Into<String>,
        workdir: impl Into<PathBuf>,
        trigger: TriggerEvent,
        config: RunConfig,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            pipeline: pipeline.into(),
            workdir: workdir.into(),
            trigger,
            config,
            variables: BTreeMap::new(),
            current_stage: String::new(),
        }
    }

    pub fn set_var(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.variables.insert(name.into(), value.into());
    }

    pub fn var(&self, name: &str) -> Option<&str> {
        self.variables.get(name).map(String::as_str)
    }

    pub fn lookup(&self, name: &str) -> Option<String> {
        match name {
            "branch" => Some(self.trigger.branch.clone()),
            "commit" => self.trigger.commit.clone(),
            "short_commit" => self
                .trigger
                .commit
                .as_ref()
                .map(|c| c.chars().take(8).collect()),
            "event" => Some(self.trigger.kind.to_string()),
            "run_id" => Some(self.run_id.clone()),
            "pipeline" => Some(self.pipeline.clone()),
            "stage" => Some(self.current_stage.clone()),
            "workdir" => Some(self.workdir.to_string_lossy().into_owned()),
            other => self
                .variables
                .get(other)
                .cloned()
                .or_else(|| self.config.template_value(other)),
        }
    }

    /// Substitutes `{name}` placeholders. `${...}` is left for the shell, and
    /// `{{` / `}}` produce literal braces.
    pub fn render(&self, template: &str) -> Result<String> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(start) = rest.find(['{', '}']) {
            let (before, tail) = rest.split_at(start);
            out.push_str(before);
            if tail.starts_with("{{") || tail.starts_with("}}") {
                out.push_str(&tail[..1]);
                rest = &tail[2..];
                continue;
            }
            if tail.starts_with('}') {
                out.push('}');
                rest = &tail[1..];
                continue;
            }
            let end = tail.find('}');
            let name = end.map(|end| &tail[1..end]);
            match name {
                Some(name) if !out.ends_with('$') && is_placeholder(name) => {
                    let value = self
                        .lookup(name)
                        .ok_or_else(|| anyhow!("Unknown placeholder '{{{name}}}' in '{template}'"))?;
                    out.push_str(&value);
                    rest = &tail[name.len() + 2..];
                }
                _ => {
                    out.push('{');
                    rest = &tail[1..];
                }
            }
        }
        out.push_str(rest);
        Ok(out)
    }

    pub fn resolve_path(&self, relative: &str) -> Result<PathBuf> {
        let rendered = self.render(relative)?;
        let path = Path::new(&rendered);
        Ok(if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workdir.join(path)
        })
    }
}

fn is_placeholder(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

/// The work a stage performs. Implementations delegate to external tools
/// through the supplied [`CommandRunner`].
pub trait StageAction: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Configuration that must be present before the run may start.
    fn required_config(&self) -> Vec<ConfigKey> {
        Vec::new()
    }

    fn run(&self, ctx: &mut RunContext, tools: &dyn CommandRunner) -> Result<()>;
}

impl<F> StageAction for F
where
    F: Fn(&mut RunContext, &dyn CommandRunner) -> Result<()> + Send + Sync,
{
    fn kind(&self) -> &'static str {
        "closure"
    }

    fn run(&self, ctx: &mut RunContext, tools: &dyn CommandRunner) -> Result<()> {
        self(ctx, tools)
    }
}

/// A named unit of pipeline work.
pub struct Stage {
    pub name: String,
    pub action: Box<dyn StageAction>,
    pub archive_on_success: Vec<String>,
    pub allow_empty_archive: bool,
    pub branches: Vec<Pattern>,
}

impl Stage {
    pub fn new(name: impl Into<String>, action: impl StageAction + 'static) -> Self {
        Self {
            name: name.into(),
            action: Box::new(action),
            archive_on_success: Vec::new(),
            allow_empty_archive: false,
            branches: Vec::new(),
        }
    }

    pub fn archive(mut self, patterns: &[&str]) -> Self {
        self.archive_on_success = patterns.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn on_branches(mut self, patterns: Vec<Pattern>) -> Self {
        self.branches = patterns;
        self
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("kind", &self.action.kind())
            .field("archive_on_success", &self.archive_on_success)
            .field("branches", &self.branches)
            .finish()
    }
}

type StageConstructor =
    Arc<dyn Fn(StageParameters) -> Result<Box<dyn StageAction>> + Send + Sync>;

pub struct StageRegistry {
    factories: HashMap<String, StageConstructor>,
}

impl Default for StageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StageRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register<F>(&mut self, kind: impl Into<String>, constructor: F)
    where
        F: Fn(StageParameters) -> Result<Box<dyn StageAction>> + Send + Sync + 'static,
    {
        self.factories.insert(kind.into(), Arc::new(constructor));
    }

    pub fn create(&self, kind: &str, params: StageParameters) -> Result<Box<dyn StageAction>> {
        let factory = self.factories.get(kind).ok_or_else(|| {
            anyhow!(
                "Unknown stage kind '{}'. Available kinds: {}",
                kind,
                self.known_kinds().join(", ")
            )
        })?;
        factory(params)
    }

    pub fn known_kinds(&self) -> Vec<String> {
        let mut names: Vec<_> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Succeeded,
    Failed,
    Skipped,
    NotRun,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageReport {
    pub name: String,
    pub kind: String,
    pub status: StageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub archived: Vec<ArchivedFile>,
    pub duration_ms: f64,
}

impl StageReport {
    fn for_stage(stage: &Stage, status: StageStatus) -> Self {
        Self {
            name: stage.name.clone(),
            kind: stage.action.kind().to_string(),
            status,
            exit_code: None,
            error: None,
            archived: Vec::new(),
            duration_ms: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub run_id: String,
    pub pipeline: String,
    pub branch: String,
    pub status: RunStatus,
    pub stages: Vec<StageReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StageExecutionError>,
    pub notification: NotificationEvent,
}

impl RunResult {
    pub fn exit_code(&self) -> i32 {
        match self.status {
            RunStatus::Succeeded => 0,
            _ => 1,
        }
    }

    pub fn stage(&self, name: &str) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn archived(&self) -> impl Iterator<Item = &ArchivedFile> {
        self.stages.iter().flat_map(|s| s.archived.iter())
    }
}

/// Executes stages strictly in order, stopping at the first failure, and
/// emits exactly one terminal notification per run.
pub struct StageRunner {
    stages: Vec<Stage>,
    notifier: Box<dyn Notifier>,
    metrics: MetricsCollector,
    notify_on_start: bool,
}

impl StageRunner {
    /// Fails if two stages share a name; names key archives and reports.
    pub fn new(stages: Vec<Stage>, notifier: Box<dyn Notifier>) -> Result<Self, DefinitionError> {
        let mut seen = HashSet::new();
        if let Some(stage) = stages.iter().find(|stage| !seen.insert(stage.name.as_str())) {
            return Err(DefinitionError::DuplicateStage(stage.name.clone()));
        }
        Ok(Self {
            stages,
            notifier,
            metrics: MetricsCollector::new(),
            notify_on_start: false,
        })
    }

    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn notify_on_start(mut self, enabled: bool) -> Self {
        self.notify_on_start = enabled;
        self
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn metrics(&self) -> MetricsCollector {
        self.metrics.clone()
    }

    /// Checks that every stage that would run has the configuration it needs.
    pub fn preflight(&self, ctx: &RunContext) -> Result<(), ConfigurationError> {
        for stage in &self.stages {
            if !ctx.trigger.matches_any(&stage.branches) {
                continue;
            }
            for key in stage.action.required_config() {
                ctx.config.require(&stage.name, key)?;
            }
        }
        Ok(())
    }

    /// Runs the pipeline. Only a configuration problem detected before the
    /// first stage is returned as `Err`; every started run yields a result.
    #[instrument(skip_all, fields(pipeline = %ctx.pipeline, run_id = %ctx.run_id, branch = %ctx.trigger.branch))]
    pub fn run(&self, ctx: &mut RunContext, tools: &dyn CommandRunner) -> Result<RunResult, ConfigurationError> {
        self.preflight(ctx)?;

        let archiver = Archiver::new(if ctx.config.archive_dir.is_absolute() {
            ctx.config.archive_dir.clone()
        } else {
            ctx.workdir.join(&ctx.config.archive_dir)
        });
        let started = Instant::now();
        let mut status = RunStatus::Pending;
        let mut reports = Vec::with_capacity(self.stages.len());
        let mut failure: Option<StageExecutionError> = None;

        status = transition(status, RunStatus::Running);
        if self.notify_on_start {
            let event = NotificationEvent::new(
                ctx.config.notification_channel.clone(),
                Severity::Info,
                format!(
                    "Pipeline '{}' started on branch {} ({})",
                    ctx.pipeline, ctx.trigger.branch, ctx.trigger.kind
                ),
            );
            self.deliver(&event);
        }

        for (idx, stage) in self.stages.iter().enumerate() {
            if failure.is_some() {
                reports.push(StageReport::for_stage(stage, StageStatus::NotRun));
                continue;
            }
            if !ctx.trigger.matches_any(&stage.branches) {
                info!(stage = %stage.name, branch = %ctx.trigger.branch, "Stage skipped by branch filter");
                self.metrics.record_skipped(&stage.name);
                reports.push(StageReport::for_stage(stage, StageStatus::Skipped));
                continue;
            }

            let span = tracing::span!(tracing::Level::INFO, "stage", stage = %stage.name, index = idx + 1);
            let _span_guard = span.enter();
            let mut timer = self.metrics.start_stage(&stage.name);
            ctx.current_stage = stage.name.clone();
            info!(kind = stage.action.kind(), "Stage started");

            let mut report = StageReport::for_stage(stage, StageStatus::Succeeded);
            let outcome = run_action(stage, ctx, tools).and_then(|()| {
                    if stage.archive_on_success.is_empty() {
                        return Ok(Vec::new());
                    }
                    archiver
                        .archive(
                            &ctx.workdir,
                            &ctx.run_id,
                            &stage.name,
                            &stage.archive_on_success,
                            stage.allow_empty_archive,
                        )
                        .map_err(|err| {
                            StageExecutionError::new(&stage.name, format!("archiving failed: {err:#}"))
                        })
                });

            match outcome {
                Ok(archived) => {
                    if !archived.is_empty() {
                        info!(files = archived.len(), dir = %archiver.stage_dir(&ctx.run_id, &stage.name).display(), "Artifacts archived");
                    }
                    report.archived = archived;
                    info!("Stage succeeded");
                }
                Err(err) => {
                    timer.mark_failed();
                    error!(error = %err, "Stage failed");
                    report.status = StageStatus::Failed;
                    report.exit_code = err.exit_code;
                    report.error = Some(err.detail.clone());
                    failure = Some(err);
                }
            }
            report.duration_ms = timer.elapsed().as_secs_f64() * 1_000.0;
            reports.push(report);
        }
        ctx.current_stage.clear();

        status = transition(
            status,
            if failure.is_some() {
                RunStatus::Failed
            } else {
                RunStatus::Succeeded
            },
        );
        self.metrics.record_run(status, started.elapsed());

        let notification = terminal_notification(ctx, status, failure.as_ref());
        self.deliver(&notification);

        Ok(RunResult {
            run_id: ctx.run_id.clone(),
            pipeline: ctx.pipeline.clone(),
            branch: ctx.trigger.branch.clone(),
            status,
            stages: reports,
            failed_stage: failure.as_ref().map(|f| f.stage.clone()),
            error: failure,
            notification,
        })
    }

    fn deliver(&self, event: &NotificationEvent) {
        if let Err(err) = self.notifier.notify(event) {
            warn!(error = %format!("{err:#}"), severity = %event.severity, "Failed to deliver notification");
        }
    }
}

fn transition(from: RunStatus, to: RunStatus) -> RunStatus {
    tracing::debug!(%from, %to, "Run status changed");
    to
}

/// Runs the stage's action, turning a panic into a stage failure.
fn run_action(
    stage: &Stage,
    ctx: &mut RunContext,
    tools: &dyn CommandRunner,
) -> Result<(), StageExecutionError> {
    match panic::catch_unwind(AssertUnwindSafe(|| stage.action.run(ctx, tools))) {
        Ok(result) => result.map_err(|err| into_stage_error(&stage.name, err)),
        Err(payload) => {
            let reason = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown cause".to_string());
            Err(StageExecutionError::new(&stage.name, format!("stage panicked: {reason}")))
        }
    }
}

fn into_stage_error(stage: &str, err: anyhow::Error) -> StageExecutionError {
    match err.downcast::<StageExecutionError>() {
        Ok(mut stage_err) => {
            if stage_err.stage.is_empty() {
                stage_err.stage = stage.to_string();
            }
            stage_err
        }
        Err(other) => StageExecutionError::new(stage, format!("{other:#}")),
    }
}

fn terminal_notification(
    ctx: &RunContext,
    status: RunStatus,
    failure: Option<&StageExecutionError>,
) -> NotificationEvent {
    let logs = ctx
        .config
        .logs_url
        .as_ref()
        .map(|url| format!(" Logs: {}", ctx.render(url).unwrap_or_else(|_| url.clone())))
        .unwrap_or_default();
    let (severity, message) = match failure {
        Some(err) if status == RunStatus::Failed => (
            Severity::Failure,
            format!(
                "Pipeline '{}' failed at stage '{}' on branch {}: {}.{}",
                ctx.pipeline, err.stage, ctx.trigger.branch, err.detail, logs
            ),
        ),
        _ => (
            Severity::Success,
            format!(
                "Pipeline '{}' succeeded on branch {}.{}",
                ctx.pipeline, ctx.trigger.branch, logs
            ),
        ),
    };
    NotificationEvent::new(ctx.config.notification_channel.clone(), severity, message)
}

/// Instantiates stages from their specs, rejecting duplicate names and
/// malformed branch patterns.
pub fn build_pipeline(
    registry: &StageRegistry,
    specs: &[StageSpec],
) -> Result<Vec<Stage>, PipelineError> {
    if specs.is_empty() {
        return Err(DefinitionError::Empty.into());
    }
    let mut seen = HashSet::new();
    let mut stages = Vec::with_capacity(specs.len());
    for (idx, spec) in specs.iter().enumerate() {
        if spec.name.trim().is_empty() {
            return Err(DefinitionError::InvalidStage {
                index: idx + 1,
                name: spec.name.clone(),
                reason: "stage name cannot be empty".into(),
            }
            .into());
        }
        if !seen.insert(spec.name.as_str()) {
            return Err(DefinitionError::DuplicateStage(spec.name.clone()).into());
        }
        let branches = spec
            .branches
            .iter()
            .map(|p| Pattern::new(p))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| DefinitionError::InvalidStage {
                index: idx + 1,
                name: spec.name.clone(),
                reason: format!("invalid branch pattern: {err}"),
            })?;
        let action = registry
            .create(&spec.uses, spec.params.clone().unwrap_or_default())
            .map_err(|err| PipelineError::StageConstruction {
                stage: spec.name.clone(),
                reason: format!("{err:#}"),
            })?;
        stages.push(Stage {
            name: spec.name.clone(),
            action,
            archive_on_success: spec.archive_on_success.clone(),
            allow_empty_archive: spec.allow_empty_archive,
            branches,
        });
    }
    Ok(stages)
}
