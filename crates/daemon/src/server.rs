//! HTTP and WebSocket surface
//!
//! - `GET /ws`: relay socket. Clients send `{"type":"run",...}` and receive
//!   every relay message.
//! - `GET /health`
//! - `GET /.well-known/appspecific/com.chrome.devtools.json`: empty object,
//!   keeps browser devtools from logging 404s.
//! - everything else: the UI bundle from `static_dir`.

use crate::broadcast::Broadcaster;
use crate::session::{RunQueue, SessionManager};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use testscope_common::ClientCommand;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

/// Shared server state
pub struct AppState {
    pub sessions: Arc<SessionManager>,
    pub broadcaster: Broadcaster,
    pub runs: RunQueue,
}

impl AppState {
    /// Must be called inside a Tokio runtime; spawns the run queue.
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self {
            broadcaster: sessions.broadcaster().clone(),
            runs: RunQueue::spawn(sessions.clone()),
            sessions,
        }
    }
}

/// Build the router
pub fn router(state: Arc<AppState>, static_dir: PathBuf) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route(
            "/.well-known/appspecific/com.chrome.devtools.json",
            get(devtools_handler),
        )
        .fallback_service(ServeDir::new(static_dir).append_index_html_on_directories(true))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until the listener fails
pub async fn serve(listener: tokio::net::TcpListener, app: Router) -> anyhow::Result<()> {
    let addr: SocketAddr = listener.local_addr()?;
    info!("Listening on http://{}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let session = state.sessions.state().await.map(|s| s.to_string());
    Json(serde_json::json!({
        "status": "ok",
        "version": testscope_common::VERSION,
        "clients": state.broadcaster.client_count(),
        "session": session,
    }))
}

async fn devtools_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({}))
}

async fn ws_handler(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
        .into_response()
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (client_id, mut outbound) = state.broadcaster.register();
    let (mut ws_write, mut ws_read) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if ws_write.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = ws_read.next().await {
        match msg {
            Ok(Message::Text(text)) => handle_command(&state, &text),
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Client {} socket error: {}", client_id, e);
                break;
            }
        }
    }

    state.broadcaster.unregister(client_id);
    writer.abort();
}

fn handle_command(state: &Arc<AppState>, text: &str) {
    let Some(command) = ClientCommand::parse(text) else {
        debug!("Dropping malformed client message: {}", text);
        return;
    };

    match command {
        ClientCommand::Run(request) => state.runs.submit(request),
    }
}
