use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use serde::Serialize;
use tracing::{debug, info};

use crate::pipeline::RunStatus;

#[cfg(feature = "metrics-server")]
pub mod server;

#[derive(Debug, Default, Serialize, Clone)]
pub struct MetricsSnapshot {
    pub stages: BTreeMap<String, StageMetrics>,
    pub total_duration_ms: f64,
    pub runs_succeeded: u64,
    pub runs_failed: u64,
    pub last_status: Option<RunStatus>,
}

#[derive(Debug, Default, Serialize, Clone)]
pub struct StageMetrics {
    pub calls: u64,
    pub failures: u64,
    pub skipped: u64,
    pub total_duration_ms: f64,
    pub max_duration_ms: f64,
}

#[derive(Debug, Default, Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsSnapshot>>,
}

impl MetricsCollector {
    /// Process-wide collector shared by the runner and the metrics server.
    pub fn global() -> &'static MetricsCollector {
        static INSTANCE: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);
        &INSTANCE
    }

    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MetricsSnapshot::default())),
        }
    }

    pub fn start_stage(&self, stage_name: &str) -> StageTimer {
        StageTimer {
            stage: stage_name.to_string(),
            started_at: Instant::now(),
            collector: self.inner.clone(),
            failed: false,
            recorded: false,
        }
    }

    pub fn record_skipped(&self, stage_name: &str) {
        if let Ok(mut guard) = self.inner.lock() {
            guard
                .stages
                .entry(stage_name.to_string())
                .or_default()
                .skipped += 1;
        }
    }

    pub fn record_run(&self, status: RunStatus, duration: Duration) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.total_duration_ms = duration.as_secs_f64() * 1_000.0;
            match status {
                RunStatus::Succeeded => guard.runs_succeeded += 1,
                RunStatus::Failed => guard.runs_failed += 1,
                RunStatus::Pending | RunStatus::Running => {}
            }
            guard.last_status = Some(status);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn reset(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            *guard = MetricsSnapshot::default();
        }
    }
}

/// Records a stage's duration when dropped.
pub struct StageTimer {
    stage: String,
    started_at: Instant,
    collector: Arc<Mutex<MetricsSnapshot>>,
    failed: bool,
    recorded: bool,
}

impl StageTimer {
    pub fn mark_failed(&mut self) {
        self.failed = true;
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    fn record(&mut self) {
        if self.recorded {
            return;
        }
        let duration_ms = self.started_at.elapsed().as_secs_f64() * 1_000.0;
        if let Ok(mut guard) = self.collector.lock() {
            let metrics = guard.stages.entry(self.stage.clone()).or_default();
            metrics.calls += 1;
            if self.failed {
                metrics.failures += 1;
            }
            metrics.total_duration_ms += duration_ms;
            if duration_ms > metrics.max_duration_ms {
                metrics.max_duration_ms = duration_ms;
            }
        }
        debug!(
            stage = self.stage.as_str(),
            duration_ms,
            failed = self.failed,
            "Stage duration recorded"
        );
        self.recorded = true;
    }
}

impl Drop for StageTimer {
    fn drop(&mut self) {
        self.record();
    }
}

pub fn log_snapshot(snapshot: &MetricsSnapshot) {
    info!(
        total_duration_ms = snapshot.total_duration_ms,
        stage_count = snapshot.stages.len(),
        runs_succeeded = snapshot.runs_succeeded,
        runs_failed = snapshot.runs_failed,
        "Pipeline metrics summary"
    );
    for (stage, metrics) in &snapshot.stages {
        info!(
            stage = stage.as_str(),
            calls = metrics.calls,
            failures = metrics.failures,
            skipped = metrics.skipped,
            total_ms = metrics.total_duration_ms,
            max_ms = metrics.max_duration_ms,
            "Stage metrics"
        );
    }
}

impl MetricsSnapshot {
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();
        counter(
            &mut out,
            "pipewright_runs_succeeded_total",
            "Pipeline runs that ended Succeeded",
            self.runs_succeeded,
        );
        counter(
            &mut out,
            "pipewright_runs_failed_total",
            "Pipeline runs that ended Failed",
            self.runs_failed,
        );

        let series: [(&str, &str, &str, fn(&StageMetrics) -> String); 5] = [
            ("pipewright_stage_calls_total", "counter", "Stage invocation count", |m| {
                m.calls.to_string()
            }),
            ("pipewright_stage_failures_total", "counter", "Stage failure count", |m| {
                m.failures.to_string()
            }),
            ("pipewright_stage_skipped_total", "counter", "Stages skipped by branch filter", |m| {
                m.skipped.to_string()
            }),
            (
                "pipewright_stage_duration_seconds_total",
                "counter",
                "Accumulated stage duration in seconds",
                |m| format!("{:.6}", m.total_duration_ms / 1_000.0),
            ),
            (
                "pipewright_stage_duration_seconds_max",
                "gauge",
                "Maximum stage duration in seconds",
                |m| format!("{:.6}", m.max_duration_ms / 1_000.0),
            ),
        ];
        for (name, kind, help, value) in series {
            let _ = writeln!(out, "# HELP {name} {help}");
            let _ = writeln!(out, "# TYPE {name} {kind}");
            for (stage, metrics) in &self.stages {
                let _ = writeln!(
                    out,
                    "{name}{{stage=\"{}\"}} {}",
                    escape_label(stage),
                    value(metrics)
                );
            }
        }

        let _ = writeln!(out, "# HELP pipewright_run_duration_seconds Last run duration");
        let _ = writeln!(out, "# TYPE pipewright_run_duration_seconds gauge");
        let _ = writeln!(
            out,
            "pipewright_run_duration_seconds {:.6}",
            self.total_duration_ms / 1_000.0
        );
        out
    }
}

fn counter(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} counter");
    let _ = writeln!(out, "{name} {value}");
}

fn escape_label(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
