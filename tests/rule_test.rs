//! End-to-end rule tests against a stand-in engine script.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use alertdesk::config::AppConfig;
use alertdesk::ruletest::{LiveChannel, RuleTester, TestError, TestOptions, TestOutcome};
use assert_cmd::Command;
use tempfile::TempDir;

const RULE: &str = "name: disk-full\ntype: any\nindex: logs-*\n";

/// Write an executable shell script that stands in for the interpreter.
/// It receives `-m <module> --config <file> <rule> [options...]`.
fn fake_engine(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("fake-python");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn config_for(dir: &TempDir, engine: &Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.server.data_dir = dir.path().join("data");
    config.engine.path = dir.path().to_path_buf();
    config.engine.python = engine.to_string_lossy().into_owned();
    config
}

fn staged_files(config: &AppConfig) -> Vec<PathBuf> {
    std::fs::read_dir(config.server.test_dir())
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect()
}

#[tokio::test]
async fn test_success_returns_engine_output_and_cleans_up() {
    let dir = TempDir::new().unwrap();
    let engine = fake_engine(dir.path(), r#"cat "$5""#);
    let config = config_for(&dir, &engine);

    let tester = RuleTester::from_config(&config).await;
    let outcome = tester
        .test_rule(RULE, &TestOptions::default(), None)
        .await
        .unwrap();

    assert_eq!(outcome, TestOutcome::Succeeded(RULE.to_string()));
    assert!(staged_files(&config).is_empty());
}

#[tokio::test]
async fn test_engine_sees_config_and_options() {
    let dir = TempDir::new().unwrap();
    let engine = fake_engine(dir.path(), r#"echo "$@""#);
    let config = config_for(&dir, &engine);
    let options: TestOptions = serde_json::from_str::<alertdesk::ruletest::TestOptionsRequest>(
        r#"{"start":"2024-01-01","end":"2024-01-02","testType":"countOnly","maxResults":5}"#,
    )
    .unwrap()
    .try_into()
    .unwrap();

    let tester = RuleTester::from_config(&config).await;
    let TestOutcome::Succeeded(output) = tester.test_rule(RULE, &options, None).await.unwrap()
    else {
        panic!("expected success");
    };

    assert!(output.starts_with("-m elastalert.test_rule --config config.yaml "));
    assert!(output.contains("--start 2024-01-01 --end 2024-01-02"));
    assert!(output.contains("--max-query-size 5"));
    assert!(output.trim_end().ends_with("--count-only"));
    assert!(!output.contains("--days"));
}

#[tokio::test]
async fn test_failure_carries_stderr_and_cleans_up() {
    let dir = TempDir::new().unwrap();
    let engine = fake_engine(dir.path(), "echo 'rule is missing index' >&2\nexit 2");
    let config = config_for(&dir, &engine);

    let tester = RuleTester::from_config(&config).await;
    let err = tester
        .test_rule(RULE, &TestOptions::default(), None)
        .await
        .unwrap_err();

    match err {
        TestError::RuntimeFailure { code, stderr } => {
            assert_eq!(code, Some(2));
            assert_eq!(stderr, "rule is missing index\n");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(staged_files(&config).is_empty());
}

#[tokio::test]
async fn test_missing_engine_is_spawn_error() {
    let dir = TempDir::new().unwrap();
    let config = config_for(&dir, &dir.path().join("no-such-python"));

    let tester = RuleTester::from_config(&config).await;
    let err = tester
        .test_rule(RULE, &TestOptions::default(), None)
        .await
        .unwrap_err();

    assert!(matches!(err, TestError::Spawn { .. }));
    assert!(staged_files(&config).is_empty());
}

#[tokio::test]
async fn test_closing_live_channel_kills_engine() {
    let dir = TempDir::new().unwrap();
    let engine = fake_engine(dir.path(), "echo started\nexec sleep 30");
    let config = config_for(&dir, &engine);
    let tester = std::sync::Arc::new(RuleTester::from_config(&config).await);

    let (channel, mut rx) = LiveChannel::new();
    let observer = channel.clone();
    let run = {
        let tester = tester.clone();
        tokio::spawn(async move {
            tester
                .test_rule(RULE, &TestOptions::default(), Some(channel))
                .await
        })
    };

    // Telemetry may interleave; wait for the engine's first line.
    loop {
        let event = rx.recv().await.unwrap();
        if event.contains("started") {
            assert!(event.starts_with(r#"{"event":"result""#), "got {event}");
            break;
        }
    }
    observer.close();

    let outcome = tokio::time::timeout(std::time::Duration::from_secs(10), run)
        .await
        .expect("run should settle after the observer left")
        .unwrap()
        .unwrap();
    assert!(matches!(outcome, TestOutcome::Cancelled { .. }));
    assert!(staged_files(&config).is_empty());
}

#[test]
fn test_cli_prints_engine_output() {
    let dir = TempDir::new().unwrap();
    let engine = fake_engine(dir.path(), r#"cat "$5""#);
    let rule_file = dir.path().join("rule.yaml");
    std::fs::write(&rule_file, RULE).unwrap();

    let config_file = dir.path().join("alertdesk.toml");
    std::fs::write(
        &config_file,
        format!(
            "[server]\ndata_dir = {:?}\n\n[engine]\npath = {:?}\npython = {:?}\n",
            dir.path().join("data").display().to_string(),
            dir.path().display().to_string(),
            engine.display().to_string(),
        ),
    )
    .unwrap();

    Command::cargo_bin("alertdesk")
        .unwrap()
        .arg("--config")
        .arg(&config_file)
        .arg("test-rule")
        .arg(&rule_file)
        .args(["--days", "3"])
        .assert()
        .success()
        .stdout(RULE);
}

#[test]
fn test_cli_failure_prints_stderr_and_exits_nonzero() {
    let dir = TempDir::new().unwrap();
    let engine = fake_engine(dir.path(), "echo 'bad rule' >&2\nexit 1");
    let rule_file = dir.path().join("rule.yaml");
    std::fs::write(&rule_file, RULE).unwrap();

    let config_file = dir.path().join("alertdesk.toml");
    std::fs::write(
        &config_file,
        format!(
            "[server]\ndata_dir = {:?}\n\n[engine]\npath = {:?}\npython = {:?}\n",
            dir.path().join("data").display().to_string(),
            dir.path().display().to_string(),
            engine.display().to_string(),
        ),
    )
    .unwrap();

    Command::cargo_bin("alertdesk")
        .unwrap()
        .arg("--config")
        .arg(&config_file)
        .arg("test-rule")
        .arg(&rule_file)
        .assert()
        .failure()
        .stderr(predicates::str::contains("bad rule"));
}
