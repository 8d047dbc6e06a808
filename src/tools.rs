//! External tool invocation.
//!
//! Stages never spawn processes directly; they describe an [`Invocation`] and
//! hand it to a [`CommandRunner`]. [`ProcessRunner`] is the real thing,
//! [`ScriptedRunner`] replays canned responses for tests and rehearsals.

use std::collections::{BTreeMap, VecDeque};
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: PathBuf,
    /// Fed to the child's stdin. Never logged.
    pub stdin: Option<String>,
}

impl Invocation {
    pub fn new(program: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: cwd.into(),
            stdin: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn envs(mut self, env: &BTreeMap<String, String>) -> Self {
        self.env
            .extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Human readable command line.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Last non-empty line of stderr (or stdout), used as failure detail.
    pub fn failure_hint(&self) -> Option<&str> {
        [&self.stderr, &self.stdout]
            .into_iter()
            .flat_map(|stream| stream.lines().rev())
            .map(str::trim)
            .find(|line| !line.is_empty())
    }
}

/// Executes one external command to completion.
///
/// An `Err` means the command could not be started at all; a command that ran
/// and failed is reported through [`ToolOutput::exit_code`].
pub trait CommandRunner: Send + Sync {
    fn run(&self, invocation: &Invocation) -> Result<ToolOutput>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

impl CommandRunner for ProcessRunner {
    fn run(&self, invocation: &Invocation) -> Result<ToolOutput> {
        info!(command = %invocation.display(), cwd = %invocation.cwd.display(), "Invoking tool");
        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .envs(&invocation.env)
            .current_dir(&invocation.cwd)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if invocation.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });

        let mut child = command
            .spawn()
            .with_context(|| format!("Failed to start '{}'", invocation.program))?;

        if let Some(input) = &invocation.stdin {
            let mut stdin = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("stdin of '{}' unavailable", invocation.program))?;
            stdin
                .write_all(input.as_bytes())
                .with_context(|| format!("Failed to write stdin of '{}'", invocation.program))?;
        }

        let output = child
            .wait_with_output()
            .with_context(|| format!("Failed to wait for '{}'", invocation.program))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        for line in stdout.lines() {
            info!(target: "pipewright::tool", "{line}");
        }
        for line in stderr.lines() {
            warn!(target: "pipewright::tool", "{line}");
        }
        debug!(program = %invocation.program, status = ?output.status.code(), "Tool finished");

        Ok(ToolOutput {
            exit_code: output.status.code(),
            stdout,
            stderr,
        })
    }
}

/// Replays responses keyed by program name, recording every invocation.
///
/// Programs without a queued response succeed with empty output.
#[derive(Debug, Clone, Default)]
pub struct ScriptedRunner {
    responses: Arc<Mutex<BTreeMap<String, VecDeque<ToolOutput>>>>,
    calls: Arc<Mutex<Vec<Invocation>>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, program: &str, output: ToolOutput) -> &Self {
        if let Ok(mut guard) = self.responses.lock() {
            guard
                .entry(program.to_string())
                .or_default()
                .push_back(output);
        }
        self
    }

    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn programs(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.program).collect()
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, invocation: &Invocation) -> Result<ToolOutput> {
        if let Ok(mut guard) = self.calls.lock() {
            guard.push(invocation.clone());
        }
        let next = self
            .responses
            .lock()
            .map_err(|_| anyhow!("scripted responses poisoned"))?
            .get_mut(&invocation.program)
            .and_then(VecDeque::pop_front);
        Ok(next.unwrap_or_else(|| ToolOutput::ok("")))
    }
}
