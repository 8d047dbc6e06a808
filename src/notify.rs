use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};

use crate::tools::{CommandRunner, Invocation};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Success,
    Failure,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Info => "info",
            Severity::Success => "success",
            Severity::Failure => "failure",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub channel: String,
    pub severity: Severity,
    pub message: String,
}

impl NotificationEvent {
    pub fn new(channel: impl Into<String>, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            severity,
            message: message.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.severity != Severity::Info
    }
}

/// A destination for run notifications (chat, issue tracker, log, ...).
pub trait Notifier: Send + Sync {
    fn notify(&self, event: &NotificationEvent) -> Result<()>;
}

/// Writes notifications into the tracing log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, event: &NotificationEvent) -> Result<()> {
        match event.severity {
            Severity::Info | Severity::Success => {
                info!(channel = %event.channel, severity = %event.severity, "{}", event.message)
            }
            Severity::Failure => {
                error!(channel = %event.channel, severity = %event.severity, "{}", event.message)
            }
        }
        Ok(())
    }
}

/// Appends each notification as one JSON line.
#[derive(Debug, Clone)]
pub struct JsonLinesNotifier {
    path: PathBuf,
}

impl JsonLinesNotifier {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Notifier for JsonLinesNotifier {
    fn notify(&self, event: &NotificationEvent) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create notification directory: {}", parent.display())
            })?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open notification log: {}", self.path.display()))?;
        let line = serde_json::to_string(event)?;
        writeln!(file, "{line}")
            .with_context(|| format!("Failed to append notification: {}", self.path.display()))?;
        Ok(())
    }
}

/// Hands the notification to an external command such as a chat webhook
/// client or an issue-tracker CLI.
///
/// The command receives `{"channel", "severity", "text"}` JSON on stdin and
/// the same values in `PIPEWRIGHT_NOTIFY_*` environment variables.
pub struct CommandNotifier {
    command: Vec<String>,
    only: Option<Severity>,
    workdir: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl CommandNotifier {
    pub fn new(
        command: Vec<String>,
        only: Option<Severity>,
        workdir: impl Into<PathBuf>,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self> {
        if command.is_empty() {
            bail!("command notifier requires a non-empty command");
        }
        Ok(Self {
            command,
            only,
            workdir: workdir.into(),
            runner,
        })
    }
}

impl Notifier for CommandNotifier {
    fn notify(&self, event: &NotificationEvent) -> Result<()> {
        if self.only.is_some_and(|only| only != event.severity) {
            return Ok(());
        }
        let payload = json!({
            "channel": event.channel,
            "severity": event.severity,
            "text": event.message,
        });
        let mut invocation =
            Invocation::new(&self.command[0], &self.workdir).args(self.command[1..].iter().cloned());
        invocation
            .env
            .insert("PIPEWRIGHT_NOTIFY_CHANNEL".into(), event.channel.clone());
        invocation
            .env
            .insert("PIPEWRIGHT_NOTIFY_SEVERITY".into(), event.severity.to_string());
        invocation
            .env
            .insert("PIPEWRIGHT_NOTIFY_MESSAGE".into(), event.message.clone());
        let invocation = invocation.stdin(payload.to_string());

        let output = self.runner.run(&invocation)?;
        if !output.success() {
            bail!(
                "notification command '{}' exited with {:?}: {}",
                invocation.display(),
                output.exit_code,
                output.failure_hint().unwrap_or("no output")
            );
        }
        Ok(())
    }
}

/// Keeps every event in memory. Clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct MemoryNotifier {
    events: Arc<Mutex<Vec<NotificationEvent>>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<NotificationEvent> {
        self.events.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn terminal_events(&self) -> Vec<NotificationEvent> {
        self.events()
            .into_iter()
            .filter(NotificationEvent::is_terminal)
            .collect()
    }
}

impl Notifier for MemoryNotifier {
    fn notify(&self, event: &NotificationEvent) -> Result<()> {
        if let Ok(mut guard) = self.events.lock() {
            guard.push(event.clone());
        }
        Ok(())
    }
}

/// Delivers to every sink; a failing sink does not stop the others.
#[derive(Default)]
pub struct Fanout {
    sinks: Vec<Box<dyn Notifier>>,
}

impl Fanout {
    pub fn new(sinks: Vec<Box<dyn Notifier>>) -> Self {
        Self { sinks }
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl Notifier for Fanout {
    fn notify(&self, event: &NotificationEvent) -> Result<()> {
        let mut failures = Vec::new();
        for sink in &self.sinks {
            if let Err(err) = sink.notify(event) {
                warn!(error = %format!("{err:#}"), "Notification sink failed");
                failures.push(format!("{err:#}"));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            bail!("{} notification sink(s) failed: {}", failures.len(), failures.join("; "))
        }
    }
}

/// One entry of the `notify:` list in a pipeline file.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum NotifierSpec {
    Log,
    File {
        path: PathBuf,
    },
    Command {
        command: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        only: Option<Severity>,
    },
}

pub fn build_notifier(
    specs: &[NotifierSpec],
    workdir: &Path,
    runner: Arc<dyn CommandRunner>,
) -> Result<Fanout> {
    if specs.is_empty() {
        return Ok(Fanout::new(vec![Box::new(LogNotifier)]));
    }
    let mut sinks: Vec<Box<dyn Notifier>> = Vec::with_capacity(specs.len());
    for spec in specs {
        match spec {
            NotifierSpec::Log => sinks.push(Box::new(LogNotifier)),
            NotifierSpec::File { path } => {
                let path = if path.is_absolute() {
                    path.clone()
                } else {
                    workdir.join(path)
                };
                sinks.push(Box::new(JsonLinesNotifier::new(path)));
            }
            NotifierSpec::Command { command, only } => sinks.push(Box::new(CommandNotifier::new(
                command.clone(),
                *only,
                workdir,
                runner.clone(),
            )?)),
        }
    }
    Ok(Fanout::new(sinks))
}
