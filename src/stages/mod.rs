use std::collections::BTreeMap;

use anyhow::{Context, Result, anyhow, bail};
use serde_json::Value;
use tracing::debug;

use crate::errors::StageExecutionError;
use crate::pipeline::{RunContext, StageAction, StageParameters, StageRegistry};
use crate::tools::{CommandRunner, Invocation, ToolOutput};

pub mod delivery;
pub mod scan;

pub use delivery::{DeployStage, ImageStage, PublishStage};
pub use scan::{AnalyzeStage, ImageScanStage, ScanStage};

pub fn register_defaults(registry: &mut StageRegistry) {
    registry.register("shell", |params| {
        Ok(Box::new(ShellStage::from_params(params)?))
    });
    registry.register("build", |params| {
        Ok(Box::new(BuildStage::from_params(params)?))
    });
    registry.register("scan", |params| {
        Ok(Box::new(ScanStage::from_params(params)?))
    });
    registry.register("analyze", |params| {
        Ok(Box::new(AnalyzeStage::from_params(params)?))
    });
    registry.register("image", |params| {
        Ok(Box::new(ImageStage::from_params(params)?))
    });
    registry.register("image-scan", |params| {
        Ok(Box::new(ImageScanStage::from_params(params)?))
    });
    registry.register("publish", |params| {
        Ok(Box::new(PublishStage::from_params(params)?))
    });
    registry.register("deploy", |params| {
        Ok(Box::new(DeployStage::from_params(params)?))
    });
}

/// How a stage spells an external command in the pipeline file: a single
/// string goes through `sh -c`, a list is executed as argv.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandLine {
    Shell(String),
    Argv(Vec<String>),
}

impl CommandLine {
    fn invocation(&self, ctx: &RunContext, options: &ToolOptions) -> Result<Invocation> {
        let (program, args) = match self {
            CommandLine::Shell(script) => ("sh".to_string(), vec!["-c".to_string(), ctx.render(script)?]),
            CommandLine::Argv(argv) => {
                let mut rendered = argv
                    .iter()
                    .map(|arg| ctx.render(arg))
                    .collect::<Result<Vec<_>>>()?;
                if rendered.is_empty() {
                    bail!("command cannot be empty");
                }
                let program = rendered.remove(0);
                (program, rendered)
            }
        };
        options.invocation(ctx, program, args)
    }
}

/// Parameters every stage kind accepts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOptions {
    pub env: BTreeMap<String, String>,
    pub workdir: Option<String>,
}

impl ToolOptions {
    fn take(params: &mut StageParameters) -> Result<Self> {
        let env = match params.remove("env") {
            None => BTreeMap::new(),
            Some(Value::Object(map)) => map
                .into_iter()
                .map(|(k, v)| {
                    let value = match v {
                        Value::String(s) => s,
                        other => other.to_string(),
                    };
                    (k, value)
                })
                .collect(),
            Some(other) => bail!("'env' must be a mapping, found {other}"),
        };
        Ok(Self {
            env,
            workdir: take_string(params, "workdir"),
        })
    }

    fn invocation(&self, ctx: &RunContext, program: String, args: Vec<String>) -> Result<Invocation> {
        let cwd = match &self.workdir {
            Some(dir) => ctx.resolve_path(dir)?,
            None => ctx.workdir.clone(),
        };
        let mut invocation = Invocation::new(program, cwd).args(args);
        for (key, value) in &self.env {
            invocation.env.insert(key.clone(), ctx.render(value)?);
        }
        Ok(invocation)
    }
}

/// Runs `invocation` and turns a non-zero exit into a [`StageExecutionError`].
pub(crate) fn run_checked(
    ctx: &RunContext,
    tools: &dyn CommandRunner,
    invocation: &Invocation,
) -> Result<ToolOutput> {
    debug!(command = %invocation.display(), "Running tool");
    let output = tools
        .run(invocation)
        .with_context(|| format!("Failed to invoke '{}'", invocation.program))?;
    if output.success() {
        return Ok(output);
    }
    let status = output
        .exit_code
        .map(|code| format!("exit status {code}"))
        .unwrap_or_else(|| "termination by signal".to_string());
    let detail = match output.failure_hint() {
        Some(hint) => format!("`{}` ended with {status}: {hint}", invocation.display()),
        None => format!("`{}` ended with {status}", invocation.display()),
    };
    Err(StageExecutionError::new(&ctx.current_stage, detail)
        .with_exit_code(output.exit_code)
        .into())
}

/// Runs an arbitrary command or script.
pub struct ShellStage {
    command: CommandLine,
    options: ToolOptions,
}

impl ShellStage {
    pub fn from_params(mut params: StageParameters) -> Result<Self> {
        let command = take_command(&mut params, "run")?
            .ok_or_else(|| anyhow!("shell stage requires 'run' parameter"))?;
        let options = ToolOptions::take(&mut params)?;
        ensure_consumed("shell", &params)?;
        Ok(Self { command, options })
    }
}

impl StageAction for ShellStage {
    fn kind(&self) -> &'static str {
        "shell"
    }

    fn run(&self, ctx: &mut RunContext, tools: &dyn CommandRunner) -> Result<()> {
        let invocation = self.command.invocation(ctx, &self.options)?;
        run_checked(ctx, tools, &invocation)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BuildTool {
    Maven,
    Gradle,
    Npm,
}

impl BuildTool {
    fn from_str(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "maven" | "mvn" => Some(Self::Maven),
            "gradle" => Some(Self::Gradle),
            "npm" | "node" => Some(Self::Npm),
            _ => None,
        }
    }

    /// One or more argv sequences run in order.
    fn default_steps(&self, args: &[String], wrapper: bool) -> Vec<Vec<String>> {
        match self {
            BuildTool::Maven => {
                let goals: Vec<String> = if args.is_empty() {
                    vec!["clean".into(), "package".into()]
                } else {
                    args.to_vec()
                };
                vec![["mvn", "-B"].into_iter().map(String::from).chain(goals).collect()]
            }
            BuildTool::Gradle => {
                let program = if wrapper { "./gradlew" } else { "gradle" };
                let tasks: Vec<String> = if args.is_empty() {
                    vec!["build".into()]
                } else {
                    args.to_vec()
                };
                vec![std::iter::once(program.to_string()).chain(tasks).collect()]
            }
            BuildTool::Npm => {
                let script = args.first().cloned().unwrap_or_else(|| "build".into());
                vec![
                    vec!["npm".into(), "ci".into()],
                    vec!["npm".into(), "run".into(), script],
                ]
            }
        }
    }
}

/// Compiles and packages the checkout with the project's build tool.
pub struct BuildStage {
    steps: Vec<CommandLine>,
    options: ToolOptions,
}

impl BuildStage {
    pub fn from_params(mut params: StageParameters) -> Result<Self> {
        let custom = take_command(&mut params, "command")?;
        let tool = take_string(&mut params, "tool");
        let args = take_string_list(&mut params, "args")?.unwrap_or_default();
        let wrapper = take_bool(&mut params, "wrapper")?.unwrap_or(true);
        let options = ToolOptions::take(&mut params)?;
        ensure_consumed("build", &params)?;

        let steps = match (custom, tool) {
            (Some(command), None) => vec![command],
            (None, Some(tool)) => {
                let tool = BuildTool::from_str(&tool).ok_or_else(|| {
                    anyhow!("Unsupported build tool '{tool}' (expected maven, gradle or npm)")
                })?;
                tool.default_steps(&args, wrapper)
                    .into_iter()
                    .map(CommandLine::Argv)
                    .collect()
            }
            (Some(_), Some(_)) => bail!("build stage accepts either 'tool' or 'command', not both"),
            (None, None) => bail!("build stage requires 'tool' or 'command' parameter"),
        };
        Ok(Self { steps, options })
    }
}

impl StageAction for BuildStage {
    fn kind(&self) -> &'static str {
        "build"
    }

    fn run(&self, ctx: &mut RunContext, tools: &dyn CommandRunner) -> Result<()> {
        for step in &self.steps {
            let invocation = step.invocation(ctx, &self.options)?;
            run_checked(ctx, tools, &invocation)?;
        }
        Ok(())
    }
}

pub(crate) fn take_command(params: &mut StageParameters, key: &str) -> Result<Option<CommandLine>> {
    match params.remove(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(script)) if script.trim().is_empty() => bail!("'{key}' cannot be empty"),
        Some(Value::String(script)) => Ok(Some(CommandLine::Shell(script))),
        Some(Value::Array(items)) => {
            let argv = items
                .into_iter()
                .map(|item| match item {
                    Value::String(s) => Ok(s),
                    Value::Number(n) => Ok(n.to_string()),
                    other => Err(anyhow!("'{key}' entries must be strings, found {other}")),
                })
                .collect::<Result<Vec<_>>>()?;
            if argv.is_empty() {
                bail!("'{key}' cannot be empty");
            }
            Ok(Some(CommandLine::Argv(argv)))
        }
        Some(other) => bail!("'{key}' must be a string or a list, found {other}"),
    }
}

pub(crate) fn take_string(params: &mut StageParameters, key: &str) -> Option<String> {
    params.remove(key).and_then(|value| match value {
        Value::Null => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    })
}

pub(crate) fn take_string_list(params: &mut StageParameters, key: &str) -> Result<Option<Vec<String>>> {
    match params.remove(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.split_whitespace().map(String::from).collect())),
        Some(Value::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => Ok(s),
                other => Ok(other.to_string()),
            })
            .collect::<Result<Vec<_>>>()
            .map(Some),
        Some(other) => bail!("'{key}' must be a list of strings, found {other}"),
    }
}

pub(crate) fn take_bool(params: &mut StageParameters, key: &str) -> Result<Option<bool>> {
    match params.remove(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value_as_bool(&value)
            .map(Some)
            .ok_or_else(|| anyhow!("'{key}' must be a boolean, found {value}")),
    }
}

fn value_as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(num) => num.as_u64().map(|n| n != 0),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "yes" | "on" | "1" => Some(true),
            "false" | "no" | "off" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Rejects parameters no constructor consumed, which are almost always typos.
pub(crate) fn ensure_consumed(kind: &str, params: &StageParameters) -> Result<()> {
    if params.is_empty() {
        return Ok(());
    }
    let unknown: Vec<_> = params.keys().map(String::as_str).collect();
    bail!("{kind} stage does not accept parameter(s): {}", unknown.join(", "))
}
