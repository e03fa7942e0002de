//! HTTP transport for the tool surface.
//!
//! One JSON-RPC-flavored endpoint: `POST /rpc` takes a
//! `{tool, arguments, client_id}` body and returns the tool envelope;
//! `GET /health` reports liveness for orchestration probes; when a
//! shutdown channel is wired, `POST /shutdown` requests a graceful stop.

use std::sync::Arc;

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::info;

use crate::dispatcher::{dispatch_value, ToolDispatcher};

#[derive(Clone)]
struct AppState {
    dispatcher: Arc<ToolDispatcher>,
    shutdown: Option<mpsc::Sender<()>>,
}

/// HTTP server wrapping a dispatcher.
pub struct HttpServer {
    state: AppState,
}

impl HttpServer {
    pub fn new(dispatcher: Arc<ToolDispatcher>) -> Self {
        Self {
            state: AppState {
                dispatcher,
                shutdown: None,
            },
        }
    }

    /// Wire the endpoint that requests a graceful stop
    pub fn with_shutdown(mut self, shutdown: mpsc::Sender<()>) -> Self {
        self.state.shutdown = Some(shutdown);
        self
    }

    /// The axum router; exposed separately for in-process testing
    pub fn router(&self) -> Router {
        Router::new()
            .route("/rpc", post(rpc_handler))
            .route("/health", get(health_handler))
            .route("/shutdown", post(shutdown_handler))
            .with_state(self.state.clone())
    }

    /// Bind and serve until the listener fails or the task is cancelled
    pub async fn serve(self, addr: &str) -> anyhow::Result<()> {
        let router = self.router();
        info!(addr, "Starting tool-call HTTP server");
        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router).await?;
        Ok(())
    }
}

async fn rpc_handler(State(state): State<AppState>, Json(body): Json<Value>) -> Json<Value> {
    Json(dispatch_value(&state.dispatcher, body).await)
}

async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "instance_id": state.dispatcher.instance_id(),
        "uptime_seconds": state.dispatcher.uptime().as_secs(),
    }))
}

async fn shutdown_handler(State(state): State<AppState>) -> Json<Value> {
    match &state.shutdown {
        Some(tx) => {
            let _ = tx.send(()).await;
            Json(json!({ "stopping": true }))
        }
        None => Json(json!({ "stopping": false, "reason": "shutdown endpoint not enabled" })),
    }
}
