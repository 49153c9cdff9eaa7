//! Session relay tests against real child processes (`sh -c` scripts).

#![cfg(unix)]

use serde_json::Value;
use std::time::Duration;
use testscope_common::RunRequest;
use testscope_daemon::{Broadcaster, RunnerConfig, SessionManager};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

/// The script sees the requested files as `$1`, `$2`, ...
fn script_runner(script: &str) -> RunnerConfig {
    RunnerConfig {
        command: vec![
            "sh".to_string(),
            "-c".to_string(),
            script.to_string(),
            "sh".to_string(),
        ],
        connect_attempts: 2,
        connect_retry_ms: 10,
        mirror_output: false,
        ..Default::default()
    }
}

fn run_with(files: &[&str]) -> RunRequest {
    RunRequest {
        files: Some(files.iter().map(|f| f.to_string()).collect()),
        test_name_pattern: None,
    }
}

/// Collect frames until the first `exit`.
async fn frames_until_exit(rx: &mut UnboundedReceiver<String>) -> Vec<Value> {
    timeout(Duration::from_secs(10), async {
        let mut frames = Vec::new();
        while let Some(text) = rx.recv().await {
            let frame: Value = serde_json::from_str(&text).expect("relay frames are JSON");
            let done = frame["type"] == "exit";
            frames.push(frame);
            if done {
                break;
            }
        }
        frames
    })
    .await
    .expect("timed out waiting for exit")
}

fn output_text(frames: &[Value], stream: &str) -> String {
    frames
        .iter()
        .filter(|f| f["type"] == "output" && f["data"]["stream"] == stream)
        .filter_map(|f| f["data"]["data"].as_str())
        .collect()
}

#[tokio::test]
async fn relays_output_and_exit_code() {
    let broadcaster = Broadcaster::new();
    let (_id, mut rx) = broadcaster.register();
    let manager = SessionManager::new(
        script_runner("echo hello; echo oops >&2; exit 3"),
        broadcaster.clone(),
    );

    manager.start_run(RunRequest::full()).await.unwrap();
    let frames = frames_until_exit(&mut rx).await;

    assert!(output_text(&frames, "stdout").contains("hello"));
    assert!(output_text(&frames, "stderr").contains("oops"));
    let exit = frames.last().unwrap();
    assert_eq!(exit["data"]["code"], 3);
}

#[tokio::test]
async fn test_process_sees_injected_environment() {
    let broadcaster = Broadcaster::new();
    let (_id, mut rx) = broadcaster.register();
    let manager = SessionManager::new(
        script_runner("echo \"$BUN_INSPECT|$BUN_INSPECT_NOTIFY|$FORCE_COLOR|$1\""),
        broadcaster.clone(),
    );

    manager.start_run(run_with(&["a.test.ts"])).await.unwrap();
    let frames = frames_until_exit(&mut rx).await;

    let line = output_text(&frames, "stdout");
    let parts: Vec<&str> = line.trim().split('|').collect();
    assert_eq!(parts.len(), 4, "{}", line);
    assert!(parts[0].starts_with("ws://127.0.0.1:"));
    assert!(parts[0].ends_with("?wait=1"));
    assert!(parts[1].starts_with("tcp://127.0.0.1:"));
    assert_eq!(parts[2], "1");
    assert_eq!(parts[3], "a.test.ts");
}

#[tokio::test]
async fn superseded_run_is_silenced() {
    let broadcaster = Broadcaster::new();
    let (_id, mut rx) = broadcaster.register();
    let manager = SessionManager::new(
        script_runner("echo \"run-$1\"; if [ \"$1\" = slow ]; then sleep 30; echo late; fi; exit 7"),
        broadcaster.clone(),
    );

    let first = manager.start_run(run_with(&["slow"])).await.unwrap();
    let started = timeout(Duration::from_secs(10), rx.recv()).await.unwrap().unwrap();
    assert!(started.contains("run-slow"));

    let second = manager.start_run(run_with(&["fast"])).await.unwrap();
    assert!(second > first);

    let frames = frames_until_exit(&mut rx).await;
    let stdout = output_text(&frames, "stdout");
    assert!(stdout.contains("run-fast"));
    assert!(!stdout.contains("run-slow"));
    assert!(!stdout.contains("late"));

    // exactly one exit, from the second run
    let exits: Vec<&Value> = frames.iter().filter(|f| f["type"] == "exit").collect();
    assert_eq!(exits.len(), 1);
    assert_eq!(exits[0]["data"]["code"], 7);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn spawn_failure_is_reported_as_exit() {
    let broadcaster = Broadcaster::new();
    let (_id, mut rx) = broadcaster.register();
    let runner = RunnerConfig {
        command: vec!["testscope-no-such-binary".to_string()],
        mirror_output: false,
        ..Default::default()
    };
    let manager = SessionManager::new(runner, broadcaster.clone());

    assert!(manager.start_run(RunRequest::full()).await.is_err());
    let frames = frames_until_exit(&mut rx).await;

    assert!(output_text(&frames, "stderr").contains("Failed to start test run"));
    assert_eq!(frames.last().unwrap()["data"]["code"], Value::Null);
}

#[tokio::test]
async fn stop_kills_the_active_process() {
    let broadcaster = Broadcaster::new();
    let (_id, _rx) = broadcaster.register();
    let manager = SessionManager::new(script_runner("sleep 30"), broadcaster.clone());

    manager.start_run(RunRequest::full()).await.unwrap();
    assert!(manager.state().await.is_some());

    timeout(Duration::from_secs(5), manager.stop()).await.unwrap();
    assert!(manager.state().await.is_none());
}
