use std::env;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use clap::{CommandFactory, Parser, Subcommand, ValueHint};
use clap_complete::Shell;
use pipewright::archive::verify_manifest;
use pipewright::config::RunConfig;
use pipewright::definition::PipelineDefinition;
use pipewright::lockfile::{PipelineLock, generate_lock};
use pipewright::notify::build_notifier;
use pipewright::observability::{MetricsCollector, MetricsSnapshot, log_snapshot};
#[cfg(feature = "metrics-server")]
use pipewright::observability::server::MetricsServer;
use pipewright::pipeline::{RunContext, RunResult, StageRegistry, StageRunner, build_pipeline};
use pipewright::stages;
use pipewright::templates::{TEMPLATES, generate_template};
use pipewright::tools::ProcessRunner;
use pipewright::trigger::{TriggerEvent, TriggerKind};
use pipewright::validation::validate_definition;
use serde_json::to_writer_pretty;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, prelude::*};

#[cfg(feature = "otel")]
use opentelemetry::KeyValue;
#[cfg(feature = "otel")]
use opentelemetry_otlp::WithExportConfig;
#[cfg(feature = "otel")]
use opentelemetry_sdk::{resource::Resource, trace as sdktrace};
#[cfg(feature = "metrics-server")]
use std::net::SocketAddr;

/// Exit status for a pipeline that could not start: invalid definition or
/// missing configuration.
const EXIT_SETUP: u8 = 2;

fn main() -> ExitCode {
    let Cli { command } = Cli::parse();

    let otlp_endpoint_for_tracing = match &command {
        Commands::Run { otlp_endpoint, .. } => otlp_endpoint.clone(),
        _ => None,
    };

    if let Err(err) = configure_tracing(otlp_endpoint_for_tracing.as_deref()) {
        eprintln!("error: {err:#}");
        return ExitCode::FAILURE;
    }

    let command_result = match command {
        Commands::Run {
            pipeline,
            target,
            dry_run,
            report,
            print_metrics,
            metrics_json,
            metrics_prometheus,
            metrics_listen,
            otlp_endpoint,
        } => {
            let _ = otlp_endpoint; // already handled in tracing configuration
            if dry_run {
                plan_pipeline(&pipeline, &target)
            } else {
                run_pipeline(
                    &pipeline,
                    &target,
                    report,
                    MetricsOutput {
                        print: print_metrics,
                        json: metrics_json,
                        prometheus: metrics_prometheus,
                        listen: metrics_listen,
                    },
                )
            }
        }
        Commands::Plan { pipeline, target } => plan_pipeline(&pipeline, &target),
        Commands::Validate { pipeline } => validate_cmd(&pipeline),
        Commands::Lint { pipelines } => lint_pipelines(&pipelines),
        Commands::Lock {
            pipeline,
            output,
            check,
        } => lock_pipeline(&pipeline, output, check),
        Commands::ListStages => {
            list_stages();
            Ok(ExitCode::SUCCESS)
        }
        Commands::Init {
            template,
            name,
            output,
            force,
        } => init_pipeline(&template, name, &output, force),
        Commands::VerifyArchive { dir } => verify_archive(&dir),
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "pipewright", &mut io::stdout());
            Ok(ExitCode::SUCCESS)
        }
    };

    #[cfg(feature = "otel")]
    if otlp_endpoint_for_tracing.is_some() {
        opentelemetry::global::shutdown_tracer_provider();
    }

    match command_result {
        Ok(code) => code,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn configure_tracing(otlp_endpoint: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    #[cfg(feature = "otel")]
    {
        if let Some(endpoint) = otlp_endpoint {
            let tracer =
                opentelemetry_otlp::new_pipeline()
                    .tracing()
                    .with_trace_config(sdktrace::Config::default().with_resource(Resource::new(
                        vec![KeyValue::new("service.name", "pipewright")],
                    )))
                    .with_exporter(
                        opentelemetry_otlp::new_exporter()
                            .tonic()
                            .with_endpoint(endpoint),
                    )
                    .install_simple()?;

            tracing_subscriber::registry()
                .with(filter.clone())
                .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .try_init()
                .map_err(|err| anyhow!(err.to_string()))?;
        } else {
            tracing_subscriber::registry()
                .with(filter.clone())
                .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
                .try_init()
                .map_err(|err| anyhow!(err.to_string()))?;
        }
    }

    #[cfg(not(feature = "otel"))]
    {
        if let Some(endpoint) = otlp_endpoint {
            eprintln!(
                "warning: --otlp-endpoint '{}' requested but OpenTelemetry support is not enabled. Rebuild with --features otel.",
                endpoint
            );
        }

        tracing_subscriber::registry()
            .with(filter.clone())
            .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
            .try_init()
            .map_err(|err| anyhow!(err.to_string()))?;
    }

    Ok(())
}

struct MetricsOutput {
    print: bool,
    json: Option<PathBuf>,
    prometheus: Option<PathBuf>,
    listen: Option<String>,
}

/// Everything a run needs, resolved before the first stage starts.
struct Prepared {
    definition: PipelineDefinition,
    context: RunContext,
    runner: StageRunner,
}

fn prepare(pipeline_path: &Path, target: &TargetArgs) -> Result<Prepared> {
    let definition = PipelineDefinition::load(pipeline_path)?;
    let registry = build_registry();

    let report = validate_definition(&definition, &registry);
    for warning in &report.warnings {
        warn!(file = %pipeline_path.display(), "{warning}");
    }
    if !report.is_ok() {
        for error_msg in &report.errors {
            error!(file = %pipeline_path.display(), "{error_msg}");
        }
        bail!(
            "Pipeline '{}' is invalid ({} error(s))",
            pipeline_path.display(),
            report.errors.len()
        );
    }

    let config = RunConfig::from_env(&definition.config)?;
    let trigger = target.trigger()?;
    let workdir = match &target.workdir {
        Some(dir) => dir.clone(),
        None => env::current_dir().context("Failed to determine current directory")?,
    };
    let run_id = target.run_id();

    let stages = build_pipeline(&registry, &definition.stages)?;
    let tools = Arc::new(ProcessRunner);
    let notifier = build_notifier(&definition.notify, &workdir, tools)?;
    let runner = StageRunner::new(stages, Box::new(notifier))?
        .with_metrics(MetricsCollector::global().clone())
        .notify_on_start(definition.notify_on_start);

    let context = RunContext::new(definition.name.clone(), run_id, workdir, trigger, config);
    Ok(Prepared {
        definition,
        context,
        runner,
    })
}

fn run_pipeline(
    pipeline_path: &Path,
    target: &TargetArgs,
    report_path: Option<PathBuf>,
    metrics: MetricsOutput,
) -> Result<ExitCode> {
    let Prepared {
        definition,
        mut context,
        runner,
    } = match prepare(pipeline_path, target) {
        Ok(prepared) => prepared,
        Err(err) => {
            error!("{err:#}");
            return Ok(ExitCode::from(EXIT_SETUP));
        }
    };

    let metrics_handle = runner.metrics();

    #[cfg(feature = "metrics-server")]
    let metrics_server = if let Some(addr_str) = &metrics.listen {
        let addr: SocketAddr = addr_str
            .parse()
            .with_context(|| format!("Invalid metrics listen address: {addr_str}"))?;
        Some(MetricsServer::start(addr, metrics_handle.clone())?)
    } else {
        None
    };

    #[cfg(not(feature = "metrics-server"))]
    if let Some(addr_str) = &metrics.listen {
        warn!(
            "Metrics server feature not enabled; ignoring --metrics-listen={}.",
            addr_str
        );
    }

    info!(
        pipeline = %definition.name,
        run_id = %context.run_id,
        branch = %context.trigger.branch,
        stages = definition.stages.len(),
        "Starting pipeline run"
    );

    let result = match runner.run(&mut context, &ProcessRunner) {
        Ok(result) => result,
        Err(err) => {
            error!("{err}");
            return Ok(ExitCode::from(EXIT_SETUP));
        }
    };

    print_summary(&result);

    // The run outcome alone decides the exit code.
    if let Some(path) = report_path {
        if let Err(err) = write_report(&path, &result) {
            warn!("{err:#}");
        }
    }
    if let Err(err) = write_metrics(&metrics, &metrics_handle.snapshot()) {
        warn!("{err:#}");
    }

    #[cfg(feature = "metrics-server")]
    if let Some(mut server) = metrics_server {
        server.stop();
    }

    Ok(ExitCode::from(result.exit_code() as u8))
}

#[derive(serde::Serialize)]
struct RunReport<'a> {
    finished_at: chrono::DateTime<chrono::Utc>,
    exit_code: i32,
    #[serde(flatten)]
    result: &'a RunResult,
}

impl<'a> RunReport<'a> {
    fn new(result: &'a RunResult) -> Self {
        Self {
            finished_at: chrono::Utc::now(),
            exit_code: result.exit_code(),
            result,
        }
    }
}

fn write_report(path: &Path, result: &RunResult) -> Result<()> {
    create_parent_dir(path)?;
    let file = File::create(path)
        .with_context(|| format!("Failed to create report file: {}", path.display()))?;
    to_writer_pretty(file, &RunReport::new(result))
        .with_context(|| format!("Failed to write report JSON: {}", path.display()))?;
    info!(report = %path.display(), "Run report written");
    Ok(())
}

fn print_summary(result: &RunResult) {
    for stage in &result.stages {
        let status = serde_json::to_value(stage.status)
            .ok()
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_default();
        println!(
            "{:<24} {:<12} {:<10} {:>8.0} ms",
            stage.name, stage.kind, status, stage.duration_ms
        );
    }
    println!("{}", result.notification.message);
}

fn write_metrics(output: &MetricsOutput, snapshot: &MetricsSnapshot) -> Result<()> {
    if output.print {
        log_snapshot(snapshot);
    }
    if let Some(path) = &output.json {
        create_parent_dir(path)?;
        let file = File::create(path)
            .with_context(|| format!("Failed to create metrics file: {}", path.display()))?;
        to_writer_pretty(file, snapshot)
            .with_context(|| format!("Failed to write metrics JSON: {}", path.display()))?;
        info!(metrics = %path.display(), "Metrics JSON written");
    }
    if let Some(path) = &output.prometheus {
        create_parent_dir(path)?;
        fs::write(path, snapshot.to_prometheus())
            .with_context(|| format!("Failed to write Prometheus metrics: {}", path.display()))?;
        info!(metrics = %path.display(), "Prometheus metrics written");
    }
    Ok(())
}

fn plan_pipeline(pipeline_path: &Path, target: &TargetArgs) -> Result<ExitCode> {
    let Prepared {
        definition,
        context,
        runner,
    } = match prepare(pipeline_path, target) {
        Ok(prepared) => prepared,
        Err(err) => {
            error!("{err:#}");
            return Ok(ExitCode::from(EXIT_SETUP));
        }
    };

    println!(
        "Pipeline '{}' on branch {} ({})",
        definition.name, context.trigger.branch, context.trigger.kind
    );
    for (idx, stage) in runner.stages().iter().enumerate() {
        let decision = if context.trigger.matches_any(&stage.branches) {
            "run"
        } else {
            "skip (branch filter)"
        };
        let archive = if stage.archive_on_success.is_empty() {
            String::new()
        } else {
            format!(" archive: {}", stage.archive_on_success.join(", "))
        };
        println!(
            "{:>2}. {} [{}] {}{}",
            idx + 1,
            stage.name,
            stage.action.kind(),
            decision,
            archive
        );
    }

    if let Err(err) = runner.preflight(&context) {
        error!("{err}");
        return Ok(ExitCode::from(EXIT_SETUP));
    }
    Ok(ExitCode::SUCCESS)
}

fn list_stages() {
    let registry = build_registry();
    for name in registry.known_kinds() {
        println!("{name}");
    }
}

fn validate_cmd(pipeline_path: &Path) -> Result<ExitCode> {
    let definition = PipelineDefinition::load(pipeline_path)?;
    let registry = build_registry();
    let report = validate_definition(&definition, &registry);

    for warning in &report.warnings {
        warn!(file = %pipeline_path.display(), "{warning}");
    }

    if report.is_ok() {
        info!(
            file = %pipeline_path.display(),
            stages = definition.stages.len(),
            "Pipeline validation passed"
        );
        Ok(ExitCode::SUCCESS)
    } else {
        for error_msg in &report.errors {
            error!(file = %pipeline_path.display(), "{error_msg}");
        }
        Ok(ExitCode::from(EXIT_SETUP))
    }
}

fn lint_pipelines(pipelines: &[PathBuf]) -> Result<ExitCode> {
    if pipelines.is_empty() {
        bail!("No pipeline files supplied for linting");
    }

    let registry = build_registry();
    let mut failures = 0usize;

    for pipeline_path in pipelines {
        match PipelineDefinition::load(pipeline_path) {
            Ok(definition) => {
                let report = validate_definition(&definition, &registry);
                for warning in &report.warnings {
                    warn!(file = %pipeline_path.display(), "{warning}");
                }
                if report.is_ok() {
                    info!(file = %pipeline_path.display(), "Lint passed");
                } else {
                    failures += 1;
                    for error_msg in &report.errors {
                        error!(file = %pipeline_path.display(), "{error_msg}");
                    }
                }
            }
            Err(err) => {
                failures += 1;
                error!(file = %pipeline_path.display(), "Failed to load pipeline: {err:#}");
            }
        }
    }

    if failures > 0 {
        error!("Lint failed for {failures} pipeline file(s)");
        return Ok(ExitCode::from(EXIT_SETUP));
    }

    info!("All pipeline lint checks passed");
    Ok(ExitCode::SUCCESS)
}

fn lock_pipeline(pipeline_path: &Path, output: Option<PathBuf>, check: bool) -> Result<ExitCode> {
    let definition = PipelineDefinition::load(pipeline_path)?;
    let output_path = output.unwrap_or_else(|| pipeline_path.with_extension("lock"));

    if check {
        let lock = PipelineLock::load(&output_path)?;
        let drifted = lock.drift(&definition);
        if drifted.is_empty() {
            info!(lockfile = %output_path.display(), "Lockfile is up to date");
            return Ok(ExitCode::SUCCESS);
        }
        for stage in &drifted {
            println!("- {stage}");
        }
        error!(
            lockfile = %output_path.display(),
            "Pipeline drifted from lockfile in {} stage(s)",
            drifted.len()
        );
        return Ok(ExitCode::FAILURE);
    }

    let registry = build_registry();
    let report = validate_definition(&definition, &registry);
    if !report.is_ok() {
        for error_msg in &report.errors {
            error!(file = %pipeline_path.display(), "{error_msg}");
        }
        bail!("Cannot lock an invalid pipeline");
    }

    create_parent_dir(&output_path)?;
    generate_lock(&definition, &output_path)?;
    info!(
        lockfile = %output_path.display(),
        "Lockfile generated successfully"
    );

    Ok(ExitCode::SUCCESS)
}

fn init_pipeline(
    template: &str,
    name: Option<String>,
    output: &Path,
    force: bool,
) -> Result<ExitCode> {
    if output.exists() && !force {
        bail!(
            "'{}' already exists; pass --force to overwrite it",
            output.display()
        );
    }
    let name = match name {
        Some(name) => name,
        None => env::current_dir()
            .ok()
            .and_then(|dir| dir.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "service".into()),
    };
    let generated = generate_template(template, &name, output)?;
    info!(
        template = %template,
        path = %generated.display(),
        "Pipeline template generated"
    );
    Ok(ExitCode::SUCCESS)
}

fn verify_archive(dir: &Path) -> Result<ExitCode> {
    let report = verify_manifest(dir)?;
    for path in &report.mismatched {
        println!("MISMATCH {}", path.display());
    }
    for path in &report.missing {
        println!("MISSING  {}", path.display());
    }
    if report.is_ok() {
        info!(
            dir = %dir.display(),
            files = report.verified.len(),
            "Archive digests verified"
        );
        Ok(ExitCode::SUCCESS)
    } else {
        error!(
            dir = %dir.display(),
            mismatched = report.mismatched.len(),
            missing = report.missing.len(),
            "Archive verification failed"
        );
        Ok(ExitCode::FAILURE)
    }
}

fn create_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

fn build_registry() -> StageRegistry {
    let mut registry = StageRegistry::new();
    stages::register_defaults(&mut registry);
    registry
}

#[derive(Parser)]
#[command(
    name = "pipewright",
    version,
    about = "Fail-fast CI/CD stage runner"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// What the run is for. Falls back to the usual CI environment variables.
#[derive(clap::Args, Debug, Clone)]
struct TargetArgs {
    #[arg(long, value_hint = ValueHint::DirPath)]
    workdir: Option<PathBuf>,
    #[arg(long)]
    branch: Option<String>,
    #[arg(long, value_enum, default_value_t = TriggerKind::Manual)]
    event: TriggerKind,
    #[arg(long)]
    commit: Option<String>,
    /// Webhook payload (Bitbucket push / pull request, or `{"ref": ...}`).
    #[arg(long = "event-file", value_hint = ValueHint::FilePath, conflicts_with = "branch")]
    event_file: Option<PathBuf>,
    #[arg(long = "run-id")]
    run_id: Option<String>,
}

impl TargetArgs {
    fn trigger(&self) -> Result<TriggerEvent> {
        let mut trigger = if let Some(path) = &self.event_file {
            TriggerEvent::load(path)?
        } else {
            let branch = self
                .branch
                .clone()
                .or_else(|| env_value("BRANCH_NAME"))
                .or_else(|| env_value("GIT_BRANCH"))
                .ok_or_else(|| {
                    anyhow!("No branch given; pass --branch, --event-file or set BRANCH_NAME")
                })?;
            TriggerEvent::new(self.event, branch)
        };
        if let Some(commit) = self.commit.clone().or_else(|| env_value("GIT_COMMIT")) {
            trigger = trigger.with_commit(commit);
        }
        Ok(trigger)
    }

    fn run_id(&self) -> String {
        self.run_id
            .clone()
            .or_else(|| env_value("BUILD_NUMBER"))
            .unwrap_or_else(|| chrono::Utc::now().format("%Y%m%d%H%M%S").to_string())
    }
}

fn env_value(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

#[derive(Subcommand)]
enum Commands {
    /// Execute the pipeline's stages in order.
    Run {
        #[arg(value_hint = ValueHint::FilePath)]
        pipeline: PathBuf,
        #[command(flatten)]
        target: TargetArgs,
        #[arg(long)]
        dry_run: bool,
        /// Write the run result as JSON.
        #[arg(long)]
        report: Option<PathBuf>,
        #[arg(long)]
        print_metrics: bool,
        #[arg(long = "metrics-json")]
        metrics_json: Option<PathBuf>,
        #[arg(long = "metrics-prometheus")]
        metrics_prometheus: Option<PathBuf>,
        #[arg(long = "metrics-listen")]
        metrics_listen: Option<String>,
        #[arg(long = "otlp-endpoint")]
        otlp_endpoint: Option<String>,
    },
    /// Show which stages would run for a branch without executing anything.
    Plan {
        #[arg(value_hint = ValueHint::FilePath)]
        pipeline: PathBuf,
        #[command(flatten)]
        target: TargetArgs,
    },
    Validate {
        #[arg(value_hint = ValueHint::FilePath)]
        pipeline: PathBuf,
    },
    Lint {
        #[arg(required = true)]
        pipelines: Vec<PathBuf>,
    },
    /// Write (or with --check, compare against) a lockfile of stage digests.
    Lock {
        pipeline: PathBuf,
        #[arg(long)]
        output: Option<PathBuf>,
        #[arg(long)]
        check: bool,
    },
    ListStages,
    /// Generate a starter pipeline file.
    Init {
        #[arg(long, default_value = "minimal", value_parser = clap::builder::PossibleValuesParser::new(TEMPLATES.iter().copied()))]
        template: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long, default_value = "pipewright.yaml")]
        output: PathBuf,
        #[arg(long)]
        force: bool,
    },
    /// Recompute the digests in an archived stage's SHA256SUMS.
    VerifyArchive {
        #[arg(value_hint = ValueHint::DirPath)]
        dir: PathBuf,
    },
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}
