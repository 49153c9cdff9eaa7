//! Driver tests against a scripted relay server

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use serde_json::{json, Value};
use std::net::SocketAddr;
use testscope_cli::output::OutputFormat;
use testscope_cli::{DaemonClient, DriverOptions, RunDriver};
use testscope_common::{RunOptions, TestStatus};

/// Frames the fake daemon answers each run with; the request is echoed back
/// as a console call so tests can assert on it.
fn scripted_run(request: &Value) -> Vec<Value> {
    let filtered = request.get("testNamePattern").is_some();
    let mut frames = vec![json!({
        "type": "console",
        "data": { "type": "log", "args": [{ "type": "string", "value": request.to_string() }] }
    })];
    if filtered {
        frames.extend([
            json!({"type": "found", "data": {"id": 1, "name": "math", "type": "describe", "url": "/p/math.test.ts"}}),
            json!({"type": "found", "data": {"id": 2, "name": "divides", "type": "test", "parentId": 1, "url": "/p/math.test.ts"}}),
            json!({"type": "start", "data": {"id": 2}}),
            json!({"type": "end", "data": {"id": 2, "status": "pass", "elapsed": 2}}),
            json!({"type": "exit", "data": {"code": 0}}),
        ]);
    } else {
        frames.extend([
            json!({"type": "found", "data": {"id": 10, "name": "math", "type": "describe", "url": "/p/math.test.ts"}}),
            json!({"type": "found", "data": {"id": 11, "name": "adds", "type": "test", "parentId": 10, "url": "/p/math.test.ts"}}),
            json!({"type": "found", "data": {"id": 12, "name": "divides", "type": "test", "parentId": 10, "url": "/p/math.test.ts"}}),
            json!({"type": "output", "data": {"stream": "stdout", "data": "bun test\n"}}),
            json!({"type": "start", "data": {"id": 11}}),
            json!({"type": "end", "data": {"id": 11, "status": "pass", "elapsed": 1}}),
            json!({"type": "start", "data": {"id": 12}}),
            json!({"type": "end", "data": {"id": 12, "status": "fail", "elapsed": 3, "error": {"message": "division by zero"}}}),
            json!({"type": "exit", "data": {"code": 1}}),
        ]);
    }
    frames
}

async fn relay(mut socket: WebSocket) {
    while let Some(Ok(message)) = socket.recv().await {
        let Message::Text(text) = message else {
            continue;
        };
        let Ok(command) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        for frame in scripted_run(&command) {
            if socket.send(Message::Text(frame.to_string())).await.is_err() {
                return;
            }
        }
    }
}

async fn ws_handler(ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(relay)
}

async fn spawn_fake_daemon() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = Router::new().route("/ws", get(ws_handler));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn quiet_driver() -> RunDriver {
    RunDriver::new(DriverOptions {
        format: OutputFormat::Json,
        ..Default::default()
    })
}

#[tokio::test]
async fn full_run_reports_failures() {
    let addr = spawn_fake_daemon().await;
    let client = DaemonClient::new(&format!("http://{}", addr)).unwrap();
    let mut socket = client.connect().await.unwrap();
    let mut driver = quiet_driver();

    let (report, rerun) = driver.run(&mut socket, RunOptions::full()).await.unwrap();

    assert!(rerun.is_none());
    assert_eq!(report.exit_code, Some(1));
    assert_eq!(report.summary.total, 2);
    assert_eq!(report.summary.passed, 1);
    assert_eq!(report.summary.failed, 1);
    assert_eq!(report.failures[0].path, vec!["math", "divides"]);
    assert_eq!(report.failures[0].error.as_deref(), Some("division by zero"));
    assert!(!report.succeeded());

    let sent = driver.store().console_entries().next().unwrap().message.clone();
    assert_eq!(sent, r#"{"type":"run"}"#);
}

#[tokio::test]
async fn rerun_of_one_test_lands_on_its_stable_node() {
    let addr = spawn_fake_daemon().await;
    let client = DaemonClient::new(&format!("http://{}", addr)).unwrap();
    let mut socket = client.connect().await.unwrap();
    let mut driver = quiet_driver();

    driver.run(&mut socket, RunOptions::full()).await.unwrap();
    let rerun = driver.store().selection_for("12");
    assert_eq!(rerun.test_name_pattern.as_deref(), Some("(^math divides$)|(math divides)"));

    let (report, _) = driver.run(&mut socket, rerun).await.unwrap();

    assert!(report.succeeded());
    let store = driver.store();
    assert_eq!(store.node("12").unwrap().status, TestStatus::Passed);
    assert_eq!(store.node("11").unwrap().status, TestStatus::Passed);
    // no duplicate nodes from the new run's ids
    assert_eq!(store.tree().len(), 3);

    let sent = store.console_entries().next().unwrap().message.clone();
    let sent: Value = serde_json::from_str(&sent).unwrap();
    assert_eq!(sent["files"], json!(["/p/math.test.ts"]));
}
