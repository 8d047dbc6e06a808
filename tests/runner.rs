use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use pipewright::archive::verify_manifest;
use pipewright::config::{ConfigKey, ConfigSpec, RegistryCredentialsSpec, RunConfig};
use pipewright::definition::PipelineDefinition;
use pipewright::errors::{ConfigurationError, DefinitionError};
use pipewright::notify::{MemoryNotifier, NotificationEvent, Notifier, Severity};
use pipewright::pipeline::{
    RunContext, RunStatus, Stage, StageRegistry, StageRunner, StageStatus, build_pipeline,
};
use pipewright::stages;
use pipewright::tools::{CommandRunner, ScriptedRunner, ToolOutput};
use pipewright::trigger::{TriggerEvent, TriggerKind};
use tempfile::tempdir;

const BUILD_SCAN_DEPLOY: &str = r#"
version: 1
name: orders
stages:
  - name: Build
    uses: build
    with: { tool: maven }
    archive_on_success: ["target/*.jar"]
  - name: Scan
    uses: scan
    with:
      command: [dependency-check.sh, --failOnCVSS, "7"]
    archive_on_success: ["reports/*.html"]
  - name: Deploy
    uses: deploy
    with: { app: orders }
"#;

fn registry() -> StageRegistry {
    let mut registry = StageRegistry::new();
    stages::register_defaults(&mut registry);
    registry
}

fn runner_for(yaml: &str, notifier: &MemoryNotifier) -> StageRunner {
    let definition = PipelineDefinition::parse(yaml).unwrap();
    let stages = build_pipeline(&registry(), &definition.stages).unwrap();
    StageRunner::new(stages, Box::new(notifier.clone())).unwrap()
}

fn context(workdir: &Path, branch: &str, run_id: &str) -> RunContext {
    RunContext::new(
        "orders",
        run_id,
        workdir,
        TriggerEvent::new(TriggerKind::Push, branch).with_commit("4f1c2ab9e0d3"),
        RunConfig::default(),
    )
}

fn write_file(root: &Path, relative: &str, contents: &str) {
    let path = root.join(relative);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, contents).unwrap();
}

#[test]
fn failing_scan_stops_before_deploy() {
    let temp = tempdir().unwrap();
    write_file(temp.path(), "target/orders.jar", "jar bytes");
    write_file(temp.path(), "reports/dependency-check.html", "<html/>");

    let notifier = MemoryNotifier::new();
    let runner = runner_for(BUILD_SCAN_DEPLOY, &notifier);
    let tools = ScriptedRunner::new();
    tools.respond(
        "dependency-check.sh",
        ToolOutput::failed(1, "One or more dependencies were identified with CVSS >= 7"),
    );

    let mut ctx = context(temp.path(), "main", "42");
    let result = runner.run(&mut ctx, &tools).unwrap();

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.exit_code(), 1);
    assert_eq!(result.failed_stage.as_deref(), Some("Scan"));
    assert_eq!(result.error.as_ref().unwrap().exit_code, Some(1));
    assert_eq!(tools.programs(), vec!["mvn", "dependency-check.sh"]);
    assert_eq!(result.stage("Deploy").unwrap().status, StageStatus::NotRun);

    let terminal = notifier.terminal_events();
    assert_eq!(terminal.len(), 1);
    assert_eq!(terminal[0].severity, Severity::Failure);
    assert!(terminal[0].message.contains("'Scan'"), "{}", terminal[0].message);
    assert!(terminal[0].message.contains("CVSS >= 7"));

    let archive = temp.path().join(".pipewright/archive/42");
    assert!(archive.join("Build/target/orders.jar").is_file());
    assert!(!archive.join("Scan").exists());
}

#[test]
fn successful_run_archives_every_stage() {
    let temp = tempdir().unwrap();
    write_file(temp.path(), "target/orders.jar", "jar bytes");
    write_file(temp.path(), "reports/dependency-check.html", "<html/>");

    let notifier = MemoryNotifier::new();
    let runner = runner_for(BUILD_SCAN_DEPLOY, &notifier);
    let tools = ScriptedRunner::new();

    let mut ctx = context(temp.path(), "main", "43");
    let result = runner.run(&mut ctx, &tools).unwrap();

    assert_eq!(result.status, RunStatus::Succeeded);
    assert_eq!(result.exit_code(), 0);
    assert!(result.failed_stage.is_none());
    assert_eq!(
        tools.programs(),
        vec!["mvn", "dependency-check.sh", "argocd", "argocd"]
    );

    let events = notifier.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].severity, Severity::Success);
    assert_eq!(events[0].channel, "#builds");
    assert_eq!(events[0].message, "Pipeline 'orders' succeeded on branch main.");

    let archive = temp.path().join(".pipewright/archive/43");
    for (stage, file) in [
        ("Build", "target/orders.jar"),
        ("Scan", "reports/dependency-check.html"),
    ] {
        let dir = archive.join(stage);
        assert!(dir.join(file).is_file(), "{stage} missing {file}");
        let report = verify_manifest(&dir).unwrap();
        assert!(report.is_ok());
        assert_eq!(report.verified.len(), 1);
    }
    assert_eq!(result.archived().count(), 2);
}

#[test]
fn no_stage_after_the_failing_one_runs() {
    let names = ["Checkout", "Build", "Test", "Package", "Deploy"];
    for failing in 0..names.len() {
        let executed = Arc::new(Mutex::new(Vec::new()));
        let stages = names
            .iter()
            .enumerate()
            .map(|(idx, name)| {
                let executed = executed.clone();
                Stage::new(*name, move |ctx: &mut RunContext, _: &dyn CommandRunner| {
                    executed.lock().unwrap().push(ctx.current_stage.clone());
                    if idx == failing {
                        Err(anyhow!("exit status 2"))
                    } else {
                        Ok(())
                    }
                })
            })
            .collect();
        let notifier = MemoryNotifier::new();
        let runner = StageRunner::new(stages, Box::new(notifier.clone())).unwrap();
        let temp = tempdir().unwrap();
        let result = runner
            .run(&mut context(temp.path(), "main", "1"), &ScriptedRunner::new())
            .unwrap();

        let expected: Vec<String> = names[..=failing].iter().map(|s| s.to_string()).collect();
        assert_eq!(*executed.lock().unwrap(), expected);
        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.failed_stage.as_deref(), Some(names[failing]));
        for later in &result.stages[failing + 1..] {
            assert_eq!(later.status, StageStatus::NotRun);
        }

        let terminal = notifier.terminal_events();
        assert_eq!(terminal.len(), 1);
        assert_eq!(terminal[0].severity, Severity::Failure);
        assert!(terminal[0].message.contains(names[failing]));
    }
}

#[test]
fn identical_responses_give_identical_outcomes() {
    let run = |run_id: &str| {
        let temp = tempdir().unwrap();
        write_file(temp.path(), "target/orders.jar", "jar bytes");
        let notifier = MemoryNotifier::new();
        let runner = runner_for(BUILD_SCAN_DEPLOY, &notifier);
        let tools = ScriptedRunner::new();
        tools.respond("dependency-check.sh", ToolOutput::failed(1, "CVE-2024-1234"));
        let result = runner
            .run(&mut context(temp.path(), "develop", run_id), &tools)
            .unwrap();
        (result.status, notifier.terminal_events())
    };

    let (first_status, first_events) = run("100");
    let (second_status, second_events) = run("101");
    assert_eq!(first_status, second_status);
    assert_eq!(first_events, second_events);
}

#[test]
fn missing_configuration_aborts_before_any_stage() {
    let yaml = r#"
version: 1
name: orders
stages:
  - name: Build
    uses: build
    with: { tool: maven }
  - name: Sonar
    uses: analyze
"#;
    let temp = tempdir().unwrap();
    let notifier = MemoryNotifier::new();
    let runner = runner_for(yaml, &notifier);
    let tools = ScriptedRunner::new();

    let err = runner
        .run(&mut context(temp.path(), "main", "5"), &tools)
        .unwrap_err();
    assert_eq!(
        err,
        ConfigurationError::MissingOption {
            stage: "Sonar".into(),
            key: ConfigKey::SonarServerUrl.as_str(),
        }
    );
    assert!(tools.calls().is_empty());
    assert!(notifier.events().is_empty());
}

#[test]
fn branch_filters_skip_stages_and_their_requirements() {
    let yaml = r#"
version: 1
name: orders
stages:
  - name: Build
    uses: build
    with: { tool: gradle }
  - name: Push
    uses: publish
    with: { image: registry.example.com/orders:latest }
    branches: [main, "release/*"]
  - name: Deploy
    uses: deploy
    with: { app: orders, wait: false }
    branches: [main]
"#;
    let temp = tempdir().unwrap();
    let notifier = MemoryNotifier::new();
    let runner = runner_for(yaml, &notifier);
    let tools = ScriptedRunner::new();

    let result = runner
        .run(&mut context(temp.path(), "feature/login", "6"), &tools)
        .unwrap();
    assert_eq!(result.status, RunStatus::Succeeded);
    assert_eq!(result.stage("Push").unwrap().status, StageStatus::Skipped);
    assert_eq!(result.stage("Deploy").unwrap().status, StageStatus::Skipped);
    assert_eq!(tools.programs(), vec!["./gradlew"]);
    assert_eq!(notifier.terminal_events().len(), 1);

    // On main the push needs registry credentials.
    let err = runner
        .run(&mut context(temp.path(), "main", "7"), &tools)
        .unwrap_err();
    assert!(matches!(err, ConfigurationError::MissingOption { ref stage, .. } if stage == "Push"));
}

#[test]
fn empty_archive_match_fails_the_stage() {
    let temp = tempdir().unwrap();
    let notifier = MemoryNotifier::new();
    let runner = runner_for(BUILD_SCAN_DEPLOY, &notifier);
    let tools = ScriptedRunner::new();

    let result = runner
        .run(&mut context(temp.path(), "main", "8"), &tools)
        .unwrap();
    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.failed_stage.as_deref(), Some("Build"));
    assert!(
        result.error.as_ref().unwrap().detail.contains("No files matched"),
        "{:?}",
        result.error
    );
    assert_eq!(tools.programs(), vec!["mvn"]);
}

#[test]
fn partial_archive_is_removed_when_a_later_pattern_matches_nothing() {
    let temp = tempdir().unwrap();
    write_file(temp.path(), "target/orders.jar", "jar bytes");
    let notifier = MemoryNotifier::new();
    let runner = StageRunner::new(
        vec![
            Stage::new("Build", |_: &mut RunContext, _: &dyn CommandRunner| {
                Ok::<(), anyhow::Error>(())
            })
            .archive(&["target/*.jar", "reports/*.html"]),
        ],
        Box::new(notifier.clone()),
    )
    .unwrap();

    let result = runner
        .run(&mut context(temp.path(), "main", "1"), &ScriptedRunner::new())
        .unwrap();
    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.stage("Build").unwrap().status, StageStatus::Failed);
    assert!(result.stage("Build").unwrap().archived.is_empty());
    assert!(!temp.path().join(".pipewright/archive/1/Build").exists());
    assert_eq!(notifier.terminal_events().len(), 1);
}

#[test]
fn duplicate_stage_names_are_rejected_by_the_runner() {
    let noop = |_: &mut RunContext, _: &dyn CommandRunner| Ok::<(), anyhow::Error>(());
    let err = StageRunner::new(
        vec![Stage::new("Build", noop), Stage::new("Build", noop)],
        Box::new(MemoryNotifier::new()),
    )
    .err()
    .unwrap();
    assert_eq!(err, DefinitionError::DuplicateStage("Build".into()));
}

#[test]
fn panicking_stage_fails_the_run_with_one_notification() {
    let later_ran = Arc::new(Mutex::new(false));
    let flag = later_ran.clone();
    let notifier = MemoryNotifier::new();
    let runner = StageRunner::new(
        vec![
            Stage::new("Build", |_: &mut RunContext, _: &dyn CommandRunner| {
                if true {
                    panic!("index out of bounds");
                }
                Ok::<(), anyhow::Error>(())
            }),
            Stage::new("Deploy", move |_: &mut RunContext, _: &dyn CommandRunner| {
                *flag.lock().unwrap() = true;
                Ok::<(), anyhow::Error>(())
            }),
        ],
        Box::new(notifier.clone()),
    )
    .unwrap();

    let temp = tempdir().unwrap();
    let result = runner
        .run(&mut context(temp.path(), "main", "2"), &ScriptedRunner::new())
        .unwrap();
    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.failed_stage.as_deref(), Some("Build"));
    assert!(result.error.as_ref().unwrap().detail.contains("index out of bounds"));
    assert_eq!(result.stage("Deploy").unwrap().status, StageStatus::NotRun);
    assert!(!*later_ran.lock().unwrap());

    let terminal = notifier.terminal_events();
    assert_eq!(terminal.len(), 1);
    assert_eq!(terminal[0].severity, Severity::Failure);
    assert_eq!(runner.metrics().snapshot().runs_failed, 1);
}

#[test]
fn unset_registry_password_only_matters_when_push_runs() {
    let yaml = r#"
version: 1
name: orders
stages:
  - name: Build
    uses: build
    with: { tool: gradle }
  - name: Push
    uses: publish
    with: { image: registry.example.com/orders:latest }
    branches: [main]
"#;
    let spec = ConfigSpec {
        docker_registry_credentials: Some(RegistryCredentialsSpec {
            registry: "registry.example.com".into(),
            username: "ci-bot".into(),
            password_env: "REGISTRY_PASSWORD".into(),
        }),
        ..ConfigSpec::default()
    };
    let config = RunConfig::resolve(&spec, |_| None).unwrap();

    let temp = tempdir().unwrap();
    let notifier = MemoryNotifier::new();
    let runner = runner_for(yaml, &notifier);
    let tools = ScriptedRunner::new();
    let trigger = |branch: &str| TriggerEvent::new(TriggerKind::Push, branch);

    let mut ctx = RunContext::new("orders", "20", temp.path(), trigger("feature/login"), config.clone());
    let result = runner.run(&mut ctx, &tools).unwrap();
    assert_eq!(result.status, RunStatus::Succeeded);
    assert_eq!(result.stage("Push").unwrap().status, StageStatus::Skipped);

    let mut ctx = RunContext::new("orders", "21", temp.path(), trigger("main"), config);
    let err = runner.run(&mut ctx, &tools).unwrap_err();
    assert_eq!(
        err,
        ConfigurationError::MissingEnvironment {
            key: ConfigKey::DockerRegistryCredentials.as_str(),
            var: "REGISTRY_PASSWORD".into(),
        }
    );
    assert_eq!(tools.programs(), vec!["./gradlew"]);
}

#[test]
fn image_reference_flows_into_scan_and_push() {
    let yaml = r#"
version: 1
name: orders
stages:
  - name: Docker Build
    uses: image
    with: { name: "{registry}/orders" }
  - name: Trivy
    uses: image-scan
  - name: Push
    uses: publish
"#;
    let spec = ConfigSpec {
        docker_registry_credentials: Some(RegistryCredentialsSpec {
            registry: "registry.example.com".into(),
            username: "ci-bot".into(),
            password_env: "REGISTRY_PASSWORD".into(),
        }),
        ..ConfigSpec::default()
    };
    let config = RunConfig::resolve(&spec, |name| {
        (name == "REGISTRY_PASSWORD").then(|| "s3cret".to_string())
    })
    .unwrap();

    let temp = tempdir().unwrap();
    let notifier = MemoryNotifier::new();
    let runner = runner_for(yaml, &notifier);
    let tools = ScriptedRunner::new();
    let mut ctx = RunContext::new(
        "orders",
        "12",
        temp.path(),
        TriggerEvent::new(TriggerKind::Push, "refs/heads/release/1.4"),
        config,
    );

    let result = runner.run(&mut ctx, &tools).unwrap();
    assert_eq!(result.status, RunStatus::Succeeded);

    let image = "registry.example.com/orders:release-1.4-12";
    assert_eq!(ctx.var("image"), Some(image));
    assert_eq!(ctx.var("published"), Some(image));

    let calls = tools.calls();
    assert_eq!(calls.len(), 4);
    assert_eq!(calls[0].args[..3], ["build", "-t", image]);
    assert_eq!(calls[1].program, "trivy");
    assert_eq!(calls[1].args.last().map(String::as_str), Some(image));
    assert_eq!(calls[2].args[0], "login");
    assert_eq!(calls[2].stdin.as_deref(), Some("s3cret"));
    assert_eq!(calls[3].args, vec!["push", image]);
}

struct BrokenChannel;

impl Notifier for BrokenChannel {
    fn notify(&self, _event: &NotificationEvent) -> Result<()> {
        Err(anyhow!("webhook returned 503"))
    }
}

#[test]
fn notification_failure_does_not_change_the_outcome() {
    let runner = StageRunner::new(
        vec![Stage::new("Build", |_: &mut RunContext, _: &dyn CommandRunner| {
            Ok::<(), anyhow::Error>(())
        })],
        Box::new(BrokenChannel),
    )
    .unwrap();
    let temp = tempdir().unwrap();
    let result = runner
        .run(&mut context(temp.path(), "main", "9"), &ScriptedRunner::new())
        .unwrap();
    assert_eq!(result.status, RunStatus::Succeeded);
    assert_eq!(result.notification.severity, Severity::Success);
}

#[test]
fn start_event_is_informational_only() {
    let notifier = MemoryNotifier::new();
    let runner = StageRunner::new(
        vec![Stage::new("Build", |_: &mut RunContext, _: &dyn CommandRunner| {
            Err::<(), anyhow::Error>(anyhow!("compilation failed"))
        })],
        Box::new(notifier.clone()),
    )
    .unwrap()
    .notify_on_start(true);
    let temp = tempdir().unwrap();
    runner
        .run(&mut context(temp.path(), "main", "10"), &ScriptedRunner::new())
        .unwrap();

    let events = notifier.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].severity, Severity::Info);
    assert!(!events[0].is_terminal());
    assert_eq!(notifier.terminal_events().len(), 1);
    assert_eq!(events[1].severity, Severity::Failure);
}
