//! HTTP control adapter and live snapshot stream.
//!
//! Both are thin shells over [`SystemController`]: the router translates requests into controller
//! calls and controller errors into status codes, and the stream pushes one JSON status line per
//! tick to every connected TCP client.

use crate::config::SystemConfig;
use crate::controller::{SystemController, SystemStatus};
use crate::error::ControllerError;
use crate::events::DEFAULT_SUBSCRIBER_CAPACITY;
use crate::priority::Priority;
use crate::worker::StopToken;
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use crossbeam_channel::select;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};

/// Result type for HTTP handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Error body returned by every failing route.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

impl From<ControllerError> for ApiError {
    fn from(err: ControllerError) -> Self {
        match err {
            ControllerError::InvalidConfig(_) => ApiError::BadRequest(err.to_string()),
            ControllerError::AlreadyRunning | ControllerError::NotRunning => {
                ApiError::Conflict(err.to_string())
            }
            ControllerError::BufferFull => ApiError::ServiceUnavailable(err.to_string()),
            ControllerError::Spawn(_) => ApiError::Internal(err.to_string()),
        }
    }
}

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<SystemController>,
    /// Base for `POST /api/start`; body fields override it one by one.
    defaults: SystemConfig,
    started: Instant,
}

impl AppState {
    pub fn new(controller: Arc<SystemController>) -> Self {
        Self {
            controller,
            defaults: SystemConfig::default(),
            started: Instant::now(),
        }
    }

    /// Use `defaults` (typically the config file's `[system]` table) for fields a start request
    /// leaves out.
    pub fn with_defaults(mut self, defaults: SystemConfig) -> Self {
        self.defaults = defaults;
        self
    }
}

/// Body of `POST /api/add_item`. Both fields are optional.
#[derive(Debug, Default, Deserialize)]
pub struct AddItemRequest {
    pub priority: Option<String>,
    pub data: Option<String>,
}

const DEFAULT_MANUAL_PAYLOAD: &str = "Manual item";

/// Deserialise an optional JSON body; an empty body yields `T::default()`.
fn parse_body<T>(body: &Bytes) -> ApiResult<T>
where
    T: for<'de> Deserialize<'de> + Default,
{
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|err| ApiError::BadRequest(format!("invalid JSON body: {err}")))
}

/// Deserialise a start request, filling every omitted field from `defaults`.
fn parse_start_config(body: &Bytes, defaults: &SystemConfig) -> ApiResult<SystemConfig> {
    let overrides: serde_json::Map<String, Value> = parse_body(body)?;
    let mut merged = match serde_json::to_value(defaults) {
        Ok(Value::Object(fields)) => fields,
        _ => {
            return Err(ApiError::Internal(
                "default config is not a JSON object".to_string(),
            ))
        }
    };
    merged.extend(overrides);
    serde_json::from_value(Value::Object(merged))
        .map_err(|err| ApiError::BadRequest(format!("invalid config: {err}")))
}

/// Run a potentially blocking controller call off the async runtime.
async fn with_controller<T, F>(state: &AppState, call: F) -> ApiResult<T>
where
    F: FnOnce(&SystemController) -> Result<T, ControllerError> + Send + 'static,
    T: Send + 'static,
{
    let controller = state.controller.clone();
    tokio::task::spawn_blocking(move || call(&controller))
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?
        .map_err(ApiError::from)
}

/// GET /api/health
async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.started.elapsed().as_secs(),
    }))
}

/// GET /api/status
async fn status(State(state): State<AppState>) -> ApiResult<Json<SystemStatus>> {
    let status = with_controller(&state, |controller| Ok(controller.get_status())).await?;
    Ok(Json(status))
}

/// GET /api/priorities
async fn priorities() -> Json<Value> {
    let names: Vec<&str> = Priority::ALL.iter().map(|p| p.name()).collect();
    Json(json!({ "priorities": names }))
}

/// POST /api/start
async fn start(State(state): State<AppState>, body: Bytes) -> ApiResult<Json<Value>> {
    let config = parse_start_config(&body, &state.defaults)?;
    let echoed = config.clone();
    with_controller(&state, move |controller| controller.start(config)).await?;
    Ok(Json(json!({ "message": "System started", "config": echoed })))
}

/// POST /api/stop
async fn stop(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let report = with_controller(&state, |controller| controller.stop()).await?;
    Ok(Json(json!({ "message": "System stopped", "report": report })))
}

/// POST /api/add_item
async fn add_item(State(state): State<AppState>, body: Bytes) -> ApiResult<Json<Value>> {
    let request: AddItemRequest = parse_body(&body)?;
    let priority = match request.priority.as_deref() {
        Some(name) => name
            .parse::<Priority>()
            .map_err(|err| ApiError::BadRequest(err.to_string()))?,
        None => Priority::Medium,
    };
    let payload = request
        .data
        .unwrap_or_else(|| DEFAULT_MANUAL_PAYLOAD.to_string());

    let item_id = with_controller(&state, move |controller| {
        controller.add_manual_item(priority, payload)
    })
    .await?;
    Ok(Json(json!({
        "message": format!("Added {priority} priority item"),
        "item_id": item_id,
        "priority": priority,
    })))
}

/// Build the control API router.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(health))
        .route("/api/status", get(status))
        .route("/api/priorities", get(priorities))
        .route("/api/start", post(start))
        .route("/api/stop", post(stop))
        .route("/api/add_item", post(add_item))
        .layer(cors)
        .with_state(state)
}

/// Serve the control API on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "control API listening");
    }
    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

/// One line of the snapshot stream.
#[derive(Debug, Serialize)]
struct StreamLine {
    timestamp_ms: u64,
    /// Events observed since the previous line.
    events: usize,
    status: SystemStatus,
}

/// Background thread that turns controller events into periodic status lines.
///
/// Events arriving between two ticks are coalesced into a single line; a line is emitted on every
/// tick even when nothing changed so clients can detect a stalled connection. The thread selects
/// over the event queue and a ticker, so a steady flood of events cannot starve the ticks.
pub struct SnapshotPublisher {
    stop: StopToken,
    lines: broadcast::Sender<String>,
    thread: Option<JoinHandle<()>>,
}

impl SnapshotPublisher {
    pub fn spawn(controller: Arc<SystemController>, interval: Duration) -> std::io::Result<Self> {
        let (lines, _) = broadcast::channel::<String>(100);
        let stop = StopToken::new();
        let events = controller.subscribe(DEFAULT_SUBSCRIBER_CAPACITY);
        let ticker = crossbeam_channel::tick(interval.max(Duration::from_millis(1)));

        let thread_stop = stop.clone();
        let thread_lines = lines.clone();
        let thread = std::thread::Builder::new()
            .name("Snapshot-Publisher".to_string())
            .spawn(move || {
                let mut pending = 0usize;
                while !thread_stop.is_stopped() {
                    select! {
                        recv(events) -> event => match event {
                            Ok(_) => pending += 1,
                            Err(_) => break,
                        },
                        recv(ticker) -> _ => {
                            publish_line(&thread_lines, pending, controller.get_status());
                            pending = 0;
                        }
                    }
                }
                debug!("snapshot publisher exiting");
            })?;

        Ok(Self {
            stop,
            lines,
            thread: Some(thread),
        })
    }

    /// Sender handle for [`serve_stream`].
    pub fn sender(&self) -> broadcast::Sender<String> {
        self.lines.clone()
    }

    /// Stop the thread and wait for it. Blocks for at most one tick.
    pub fn shutdown(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        self.stop.stop();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn publish_line(lines: &broadcast::Sender<String>, events: usize, status: SystemStatus) {
    let line = StreamLine {
        timestamp_ms: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default(),
        events,
        status,
    };
    match serde_json::to_string(&line) {
        // No receivers is not an error; nobody is connected yet.
        Ok(json) => {
            let _ = lines.send(format!("{json}\n"));
        }
        Err(err) => warn!(%err, "failed to serialise status line"),
    }
}

impl Drop for SnapshotPublisher {
    fn drop(&mut self) {
        self.halt();
    }
}

/// Accept TCP clients on `listener` and forward every published line to each of them.
///
/// Runs until the task is dropped or aborted. A client that falls behind skips the lines it
/// missed; a client whose socket errors is disconnected.
pub async fn serve_stream(listener: TcpListener, lines: broadcast::Sender<String>) {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "snapshot stream listening");
    }
    loop {
        let (mut socket, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(%err, "failed to accept stream client");
                continue;
            }
        };
        debug!(%peer, "stream client connected");
        let mut rx = lines.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(line) => {
                        if socket.write_all(line.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(%peer, skipped, "stream client lagging");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!(%peer, "stream client disconnected");
        });
    }
}
