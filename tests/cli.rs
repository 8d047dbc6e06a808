use std::fs;
use std::path::Path;

use assert_cmd::Command;
use tempfile::tempdir;

fn pipewright(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("pipewright").expect("binary present");
    cmd.current_dir(dir)
        .env("RUST_LOG", "warn")
        .env_remove("PIPEWRIGHT_SONAR_SERVER_URL")
        .env_remove("PIPEWRIGHT_NOTIFICATION_CHANNEL")
        .env_remove("PIPEWRIGHT_ARCHIVE_DIR");
    cmd
}

fn stdout_of(cmd: &mut Command, expected_code: i32) -> String {
    let output = cmd.output().expect("command runs");
    assert_eq!(
        output.status.code(),
        Some(expected_code),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).into_owned()
}

const SHELL_PIPELINE: &str = r#"
version: 1
name: demo
notify:
  - kind: file
    path: notifications.jsonl
stages:
  - name: Build
    uses: shell
    with:
      run: "mkdir -p out && echo built-{branch} > out/app.txt"
    archive_on_success: ["out/*.txt"]
  - name: Test
    uses: shell
    with:
      run: "test -f out/app.txt"
"#;

#[test]
fn list_stages_prints_every_kind() {
    let temp = tempdir().unwrap();
    let stdout = stdout_of(pipewright(temp.path()).arg("list-stages"), 0);
    let kinds: Vec<&str> = stdout.lines().collect();
    assert_eq!(
        kinds,
        vec!["analyze", "build", "deploy", "image", "image-scan", "publish", "scan", "shell"]
    );
}

#[test]
fn validate_reports_setup_errors_with_exit_code_two() {
    let temp = tempdir().unwrap();
    fs::write(temp.path().join("ok.yaml"), SHELL_PIPELINE).unwrap();
    fs::write(
        temp.path().join("dup.yaml"),
        "version: 1\nname: demo\nstages:\n  - { name: A, uses: shell, with: { run: 'true' } }\n  - { name: A, uses: shell, with: { run: 'true' } }\n",
    )
    .unwrap();

    pipewright(temp.path())
        .args(["validate", "ok.yaml"])
        .assert()
        .success();
    pipewright(temp.path())
        .args(["validate", "dup.yaml"])
        .assert()
        .code(2);
}

#[cfg(unix)]
#[test]
fn run_succeeds_and_archives() {
    let temp = tempdir().unwrap();
    fs::write(temp.path().join("pipewright.yaml"), SHELL_PIPELINE).unwrap();

    let stdout = stdout_of(
        pipewright(temp.path()).args([
            "run",
            "pipewright.yaml",
            "--branch",
            "main",
            "--run-id",
            "7",
            "--report",
            "report.json",
        ]),
        0,
    );
    assert!(stdout.contains("Pipeline 'demo' succeeded on branch main."));

    let stage_dir = temp.path().join(".pipewright/archive/7/Build");
    assert_eq!(
        fs::read_to_string(stage_dir.join("out/app.txt")).unwrap().trim(),
        "built-main"
    );
    pipewright(temp.path())
        .arg("verify-archive")
        .arg(&stage_dir)
        .assert()
        .success();

    let notifications = fs::read_to_string(temp.path().join("notifications.jsonl")).unwrap();
    assert_eq!(notifications.lines().count(), 1);
    assert!(notifications.contains("\"severity\":\"success\""));

    let report: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(temp.path().join("report.json")).unwrap())
            .unwrap();
    assert_eq!(report["status"], "succeeded");
    assert_eq!(report["exit_code"], 0);
    assert_eq!(report["stages"].as_array().unwrap().len(), 2);
}

#[cfg(unix)]
#[test]
fn failing_stage_exits_one_and_names_the_stage() {
    let temp = tempdir().unwrap();
    let pipeline = SHELL_PIPELINE.replace("test -f out/app.txt", "exit 3");
    let pipeline = format!(
        "{pipeline}  - name: Publish\n    uses: shell\n    with:\n      run: \"touch published\"\n"
    );
    fs::write(temp.path().join("pipewright.yaml"), pipeline).unwrap();

    let stdout = stdout_of(
        pipewright(temp.path()).args(["run", "pipewright.yaml", "--branch", "develop", "--run-id", "8"]),
        1,
    );
    assert!(stdout.contains("failed at stage 'Test'"), "{stdout}");
    assert!(!temp.path().join("published").exists());

    let notifications = fs::read_to_string(temp.path().join("notifications.jsonl")).unwrap();
    assert_eq!(notifications.lines().count(), 1);
    assert!(notifications.contains("\"severity\":\"failure\""));
}

#[cfg(unix)]
#[test]
fn unwritable_report_keeps_success_exit_code() {
    let temp = tempdir().unwrap();
    fs::write(temp.path().join("pipewright.yaml"), SHELL_PIPELINE).unwrap();
    fs::create_dir(temp.path().join("report.json")).unwrap();

    pipewright(temp.path())
        .args(["run", "pipewright.yaml", "--branch", "main", "--report", "report.json"])
        .assert()
        .success();
}

#[cfg(unix)]
#[test]
fn registry_password_is_only_required_where_push_runs() {
    let temp = tempdir().unwrap();
    fs::write(
        temp.path().join("pipewright.yaml"),
        r#"
version: 1
name: demo
config:
  docker_registry_credentials:
    registry: registry.example.com
    username: ci-bot
    password_env: PIPEWRIGHT_CLI_TEST_PASSWORD
stages:
  - name: Build
    uses: shell
    with: { run: "true" }
  - name: Push
    uses: publish
    with: { image: registry.example.com/demo:latest }
    branches: [main]
"#,
    )
    .unwrap();

    let run = |branch: &str| {
        let mut cmd = pipewright(temp.path());
        cmd.env_remove("PIPEWRIGHT_CLI_TEST_PASSWORD")
            .env_remove("PIPEWRIGHT_REGISTRY")
            .env_remove("PIPEWRIGHT_REGISTRY_USERNAME")
            .args(["run", "pipewright.yaml", "--branch", branch]);
        cmd
    };
    run("feature/login").assert().success();
    run("main").assert().code(2);
}

#[test]
fn missing_configuration_exits_two_without_notifying() {
    let temp = tempdir().unwrap();
    fs::write(
        temp.path().join("pipewright.yaml"),
        "version: 1\nname: demo\nnotify:\n  - kind: file\n    path: notifications.jsonl\nstages:\n  - name: Touch\n    uses: shell\n    with: { run: 'touch ran' }\n  - name: Sonar\n    uses: analyze\n",
    )
    .unwrap();

    pipewright(temp.path())
        .args(["run", "pipewright.yaml", "--branch", "main"])
        .assert()
        .code(2);
    assert!(!temp.path().join("ran").exists());
    assert!(!temp.path().join("notifications.jsonl").exists());
}

#[test]
fn init_lock_and_check_drift() {
    let temp = tempdir().unwrap();
    pipewright(temp.path())
        .args(["init", "--template", "maven-service", "--name", "orders"])
        .assert()
        .success();
    pipewright(temp.path())
        .args(["init", "--template", "minimal"])
        .assert()
        .failure();

    pipewright(temp.path())
        .args(["lock", "pipewright.yaml"])
        .assert()
        .success();
    assert!(temp.path().join("pipewright.lock").is_file());
    pipewright(temp.path())
        .args(["lock", "pipewright.yaml", "--check"])
        .assert()
        .success();

    let path = temp.path().join("pipewright.yaml");
    let edited = fs::read_to_string(&path)
        .unwrap()
        .replace("--failOnCVSS 7", "--failOnCVSS 9");
    fs::write(&path, edited).unwrap();
    let stdout = stdout_of(
        pipewright(temp.path()).args(["lock", "pipewright.yaml", "--check"]),
        1,
    );
    assert!(stdout.contains("Dependency Check"));
}

#[test]
fn plan_shows_branch_decisions() {
    let temp = tempdir().unwrap();
    fs::write(
        temp.path().join("pipewright.yaml"),
        "version: 1\nname: demo\nstages:\n  - { name: Build, uses: shell, with: { run: 'true' } }\n  - { name: Release, uses: shell, with: { run: 'true' }, branches: [main] }\n",
    )
    .unwrap();

    let stdout = stdout_of(
        pipewright(temp.path()).args(["plan", "pipewright.yaml", "--branch", "feature/x"]),
        0,
    );
    assert!(stdout.contains(" 1. Build [shell] run"), "{stdout}");
    assert!(stdout.contains(" 2. Release [shell] skip (branch filter)"), "{stdout}");
}
