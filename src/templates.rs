use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::{Value, json};

use crate::config::{ConfigSpec, DEFAULT_PASSWORD_ENV, RegistryCredentialsSpec};
use crate::definition::{PipelineDefinition, SUPPORTED_VERSION};
use crate::notify::{NotifierSpec, Severity};
use crate::pipeline::{StageParameters, StageSpec};

pub const TEMPLATES: &[&str] = &["maven-service", "node-service", "minimal"];

pub fn template(name: &str, pipeline: &str) -> Result<PipelineDefinition> {
    let def = match name {
        "maven-service" => maven_service(pipeline),
        "node-service" => node_service(pipeline),
        "minimal" => minimal(pipeline),
        other => anyhow::bail!(
            "Unknown template '{other}'. Available templates: {}",
            TEMPLATES.join(", ")
        ),
    };
    Ok(def)
}

pub fn generate_template(name: &str, pipeline: &str, destination: &Path) -> Result<PathBuf> {
    let def = template(name, pipeline)?;
    let rendered = def.to_yaml()?;
    if let Some(parent) = destination.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    fs::write(destination, rendered)
        .with_context(|| format!("Failed to write pipeline file: {}", destination.display()))?;

    Ok(destination.to_path_buf())
}

fn maven_service(pipeline: &str) -> PipelineDefinition {
    let mut build = stage("Build", "build", json!({ "tool": "maven", "args": ["clean", "verify"] }));
    build.archive_on_success = vec!["target/*.jar".into()];

    let mut dependency_check = stage(
        "Dependency Check",
        "scan",
        json!({
            "command": "dependency-check.sh --project {pipeline} --scan . --format HTML --out reports --failOnCVSS 7",
            "report": "reports/dependency-check-report.html"
        }),
    );
    dependency_check.archive_on_success = vec!["reports/dependency-check-report.html".into()];

    let mut definition = service_skeleton(pipeline);
    definition.stages = [
        vec![
            build,
            dependency_check,
            stage("Static Analysis", "analyze", json!({ "project_key": pipeline })),
        ],
        delivery_stages(pipeline),
    ]
    .concat();
    definition
}

fn node_service(pipeline: &str) -> PipelineDefinition {
    let mut build = stage("Build", "build", json!({ "tool": "npm" }));
    build.archive_on_success = vec!["dist/**/*".into()];

    let mut definition = service_skeleton(pipeline);
    definition.stages = [
        vec![
            build,
            stage("Unit Tests", "shell", json!({ "run": "npm test -- --ci" })),
            stage(
                "Dependency Audit",
                "scan",
                json!({ "command": ["npm", "audit", "--audit-level=high"] }),
            ),
            stage("Static Analysis", "analyze", json!({ "project_key": pipeline })),
        ],
        delivery_stages(pipeline),
    ]
    .concat();
    definition
}

fn minimal(pipeline: &str) -> PipelineDefinition {
    PipelineDefinition {
        version: SUPPORTED_VERSION,
        name: pipeline.to_string(),
        config: ConfigSpec::default(),
        notify: vec![NotifierSpec::Log],
        notify_on_start: false,
        stages: vec![
            stage("Build", "shell", json!({ "run": "make build" })),
            stage("Test", "shell", json!({ "run": "make test" })),
        ],
    }
}

fn service_skeleton(pipeline: &str) -> PipelineDefinition {
    PipelineDefinition {
        version: SUPPORTED_VERSION,
        name: pipeline.to_string(),
        config: ConfigSpec {
            sonar_server_url: Some("https://sonar.example.com".into()),
            nexus_url: None,
            docker_registry_credentials: Some(RegistryCredentialsSpec {
                registry: "registry.example.com".into(),
                username: "ci-bot".into(),
                password_env: DEFAULT_PASSWORD_ENV.into(),
            }),
            notification_channel: Some("#builds".into()),
            logs_url: Some("https://ci.example.com/job/{pipeline}".into()),
            archive_dir: None,
        },
        notify: vec![
            NotifierSpec::Log,
            NotifierSpec::Command {
                command: vec!["./ci/notify-slack.sh".into()],
                only: None,
            },
            NotifierSpec::Command {
                command: vec!["./ci/open-jira-issue.sh".into()],
                only: Some(Severity::Failure),
            },
        ],
        notify_on_start: true,
        stages: Vec::new(),
    }
}

fn delivery_stages(pipeline: &str) -> Vec<StageSpec> {
    let mut deploy = stage(
        "Deploy",
        "deploy",
        json!({ "app": pipeline, "revision": "{commit}" }),
    );
    deploy.branches = vec!["main".into()];
    let mut push = stage("Push Image", "publish", json!({}));
    push.branches = vec!["main".into(), "release/*".into()];

    vec![
        stage(
            "Docker Build",
            "image",
            json!({ "name": format!("{{registry}}/{pipeline}") }),
        ),
        stage("Image Scan", "image-scan", json!({ "severity": ["HIGH", "CRITICAL"] })),
        push,
        deploy,
    ]
}

fn stage(name: &str, uses: &str, params: Value) -> StageSpec {
    let mut spec = StageSpec::new(name, uses);
    spec.params = match params {
        Value::Object(map) if !map.is_empty() => Some(map),
        _ => None::<StageParameters>,
    };
    spec
}
