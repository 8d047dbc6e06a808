use anyhow::{Context, Result, anyhow};
use serde_json::Value;
use tracing::info;

use super::{
    CommandLine, ToolOptions, ensure_consumed, run_checked, take_command, take_string,
    take_string_list,
};
use crate::config::ConfigKey;
use crate::errors::StageExecutionError;
use crate::pipeline::{RunContext, StageAction, StageParameters};
use crate::tools::CommandRunner;

/// Dependency or source vulnerability scan (OWASP Dependency-Check, npm
/// audit, ...). The scanner's exit status decides the outcome.
pub struct ScanStage {
    command: CommandLine,
    report: Option<String>,
    options: ToolOptions,
}

impl ScanStage {
    pub fn from_params(mut params: StageParameters) -> Result<Self> {
        let command = take_command(&mut params, "command")?
            .ok_or_else(|| anyhow!("scan stage requires 'command' parameter"))?;
        let report = take_string(&mut params, "report");
        let options = ToolOptions::take(&mut params)?;
        ensure_consumed("scan", &params)?;
        Ok(Self {
            command,
            report,
            options,
        })
    }
}

impl StageAction for ScanStage {
    fn kind(&self) -> &'static str {
        "scan"
    }

    fn run(&self, ctx: &mut RunContext, tools: &dyn CommandRunner) -> Result<()> {
        let invocation = self.command.invocation(ctx, &self.options)?;
        run_checked(ctx, tools, &invocation)?;

        if let Some(report) = &self.report {
            let path = ctx.resolve_path(report)?;
            if !path.is_file() {
                return Err(StageExecutionError::new(
                    &ctx.current_stage,
                    format!("scanner did not produce report '{}'", path.display()),
                )
                .into());
            }
            info!(report = %path.display(), "Scan report available");
            ctx.set_var("scan_report", path.to_string_lossy());
        }
        Ok(())
    }
}

/// Container image scan, Trivy by default. Scans `{image}` unless told
/// otherwise, so it normally follows an `image` stage.
pub struct ImageScanStage {
    command: Option<CommandLine>,
    image: String,
    severity: String,
    report: Option<String>,
    options: ToolOptions,
}

impl ImageScanStage {
    pub fn from_params(mut params: StageParameters) -> Result<Self> {
        let command = take_command(&mut params, "command")?;
        let image = take_string(&mut params, "image").unwrap_or_else(|| "{image}".into());
        let severity = take_string_list(&mut params, "severity")?
            .map(|levels| levels.join(",").to_uppercase())
            .unwrap_or_else(|| "HIGH,CRITICAL".into());
        let report = take_string(&mut params, "report");
        let options = ToolOptions::take(&mut params)?;
        ensure_consumed("image-scan", &params)?;
        Ok(Self {
            command,
            image,
            severity,
            report,
            options,
        })
    }

    fn default_command(&self) -> CommandLine {
        let mut argv: Vec<String> = vec![
            "trivy".into(),
            "image".into(),
            "--exit-code".into(),
            "1".into(),
            "--no-progress".into(),
            "--severity".into(),
            self.severity.clone(),
        ];
        if let Some(report) = &self.report {
            argv.extend(["--format".into(), "json".into(), "--output".into(), report.clone()]);
        }
        argv.push(self.image.clone());
        CommandLine::Argv(argv)
    }
}

impl StageAction for ImageScanStage {
    fn kind(&self) -> &'static str {
        "image-scan"
    }

    fn run(&self, ctx: &mut RunContext, tools: &dyn CommandRunner) -> Result<()> {
        let command = self
            .command
            .clone()
            .unwrap_or_else(|| self.default_command());
        let invocation = command.invocation(ctx, &self.options)?;
        run_checked(ctx, tools, &invocation)?;
        Ok(())
    }
}

/// Static analysis with a quality gate (SonarQube).
///
/// The scanner is asked to wait for the gate, so a failed gate surfaces as a
/// non-zero exit. When `gate_report` names a JSON file in the shape of the
/// `api/qualitygates/project_status` response it is checked as well.
pub struct AnalyzeStage {
    command: Option<CommandLine>,
    project_key: Option<String>,
    gate_report: Option<String>,
    options: ToolOptions,
}

impl AnalyzeStage {
    pub fn from_params(mut params: StageParameters) -> Result<Self> {
        let command = take_command(&mut params, "command")?;
        let project_key = take_string(&mut params, "project_key");
        let gate_report = take_string(&mut params, "gate_report");
        let options = ToolOptions::take(&mut params)?;
        ensure_consumed("analyze", &params)?;
        Ok(Self {
            command,
            project_key,
            gate_report,
            options,
        })
    }

    fn default_command(&self) -> CommandLine {
        let mut argv: Vec<String> = vec![
            "sonar-scanner".into(),
            "-Dsonar.host.url={sonar_server_url}".into(),
            "-Dsonar.qualitygate.wait=true".into(),
        ];
        if let Some(key) = &self.project_key {
            argv.push(format!("-Dsonar.projectKey={key}"));
        }
        CommandLine::Argv(argv)
    }

    fn check_gate(&self, ctx: &RunContext) -> Result<String> {
        let Some(report) = &self.gate_report else {
            return Ok("OK".into());
        };
        let path = ctx.resolve_path(report)?;
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read quality gate report: {}", path.display()))?;
        let json: Value = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse quality gate report: {}", path.display()))?;
        let status = json
            .pointer("/projectStatus/status")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("quality gate report has no projectStatus.status"))?;
        if status.eq_ignore_ascii_case("OK") {
            return Ok(status.to_string());
        }
        let failing: Vec<String> = json
            .pointer("/projectStatus/conditions")
            .and_then(Value::as_array)
            .map(|conditions| {
                conditions
                    .iter()
                    .filter(|c| c.get("status").and_then(Value::as_str) == Some("ERROR"))
                    .filter_map(|c| c.get("metricKey").and_then(Value::as_str))
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        let detail = if failing.is_empty() {
            format!("quality gate status {status}")
        } else {
            format!("quality gate status {status} ({})", failing.join(", "))
        };
        Err(StageExecutionError::new(&ctx.current_stage, detail).into())
    }
}

impl StageAction for AnalyzeStage {
    fn kind(&self) -> &'static str {
        "analyze"
    }

    fn required_config(&self) -> Vec<ConfigKey> {
        vec![ConfigKey::SonarServerUrl]
    }

    fn run(&self, ctx: &mut RunContext, tools: &dyn CommandRunner) -> Result<()> {
        let command = self
            .command
            .clone()
            .unwrap_or_else(|| self.default_command());
        let mut invocation = command.invocation(ctx, &self.options)?;
        if let Some(url) = &ctx.config.sonar_server_url {
            invocation
                .env
                .entry("SONAR_HOST_URL".into())
                .or_insert_with(|| url.clone());
        }
        run_checked(ctx, tools, &invocation)?;
        let status = self.check_gate(ctx)?;
        info!(status = %status, "Quality gate passed");
        ctx.set_var("quality_gate", status);
        Ok(())
    }
}
