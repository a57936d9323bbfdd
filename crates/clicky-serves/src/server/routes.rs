use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::extract::{Extension, State};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tower_http::request_id::RequestId;
use tracing::{Span, debug, info, info_span};

use crate::engine::{Engine, Opts, Run, SimpleTool, StreamMode, Target, ToolDef};
use crate::relay::{Deadline, FrameWriter, relay, sse_response};

use super::error::ApiError;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<dyn Engine>,
    pub run_timeout: Duration,
    /// Frames buffered per streaming response before the relay waits on the
    /// client.
    pub frame_buffer: usize,
}

impl AppState {
    fn deadline(&self) -> Deadline {
        Deadline::after(self.run_timeout)
    }
}

/// Body of the `run-tool*` endpoints. A non-empty `content` wins over the
/// structured tool fields.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ToolRequest {
    #[serde(flatten)]
    pub opts: Opts,
    pub input: String,
    pub content: String,
    #[serde(flatten)]
    pub tool: SimpleTool,
}

impl From<ToolRequest> for Run {
    fn from(req: ToolRequest) -> Self {
        let tool = if req.content.is_empty() {
            ToolDef::Simple(req.tool)
        } else {
            ToolDef::FreeForm(req.content)
        };
        Self {
            opts: req.opts,
            target: Target::Tool(tool),
            input: req.input,
        }
    }
}

/// Body of the `run-file*` and `parse` endpoints.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FileRequest {
    #[serde(flatten)]
    pub opts: Opts,
    pub file: String,
    pub input: String,
}

impl From<FileRequest> for Run {
    fn from(req: FileRequest) -> Self {
        Self {
            opts: req.opts,
            target: Target::File(req.file),
            input: req.input,
        }
    }
}

fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    Ok(serde_json::from_slice(body)?)
}

/// `GET /healthz`
pub async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// `GET /version`
pub async fn version(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let out = state
        .engine
        .version()
        .await
        .map_err(|e| ApiError::engine("failed to get version", e))?;
    Ok(Json(json!({ "stdout": out })))
}

/// `GET /list-tools`
pub async fn list_tools(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let out = state
        .engine
        .list_tools()
        .await
        .map_err(|e| ApiError::engine("failed to list tools", e))?;
    Ok(Json(json!({ "stdout": out })))
}

/// `GET /list-models`
pub async fn list_models(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let models = state
        .engine
        .list_models()
        .await
        .map_err(|e| ApiError::engine("failed to list models", e))?;
    Ok(Json(json!({ "stdout": models.join("\n") })))
}

/// `POST /run-tool`
pub async fn run_tool(State(state): State<AppState>, body: Bytes) -> Result<Json<Value>, ApiError> {
    let req: ToolRequest = parse_body(&body)?;
    debug!(?req, "Executing tool");
    execute(&state, req.into(), "failed to execute tool").await
}

/// `POST /run-file`
pub async fn run_file(State(state): State<AppState>, body: Bytes) -> Result<Json<Value>, ApiError> {
    let req: FileRequest = parse_body(&body)?;
    debug!(?req, "Executing file");
    execute(&state, req.into(), "failed to execute file").await
}

async fn execute(
    state: &AppState,
    run: Run,
    context: &'static str,
) -> Result<Json<Value>, ApiError> {
    let out = state
        .engine
        .run(&run, &state.deadline())
        .await
        .map_err(|e| ApiError::engine(context, e))?;
    Ok(Json(json!({ "output": out })))
}

/// `POST /run-tool-stream`
pub async fn run_tool_stream(
    State(state): State<AppState>,
    request_id: Option<Extension<RequestId>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let req: ToolRequest = parse_body(&body)?;
    stream(&state, request_id, req.into(), StreamMode::Raw)
}

/// `POST /run-tool-stream-with-events`
pub async fn run_tool_stream_with_events(
    State(state): State<AppState>,
    request_id: Option<Extension<RequestId>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let req: ToolRequest = parse_body(&body)?;
    stream(&state, request_id, req.into(), StreamMode::Events)
}

/// `POST /run-file-stream`
pub async fn run_file_stream(
    State(state): State<AppState>,
    request_id: Option<Extension<RequestId>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let req: FileRequest = parse_body(&body)?;
    stream(&state, request_id, req.into(), StreamMode::Raw)
}

/// `POST /run-file-stream-with-events`
pub async fn run_file_stream_with_events(
    State(state): State<AppState>,
    request_id: Option<Extension<RequestId>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let req: FileRequest = parse_body(&body)?;
    stream(&state, request_id, req.into(), StreamMode::Events)
}

/// Start the run and hand its output to a relay task. Failures before the
/// run starts are ordinary error responses; everything after that is
/// reported inside the stream.
fn stream(
    state: &AppState,
    request_id: Option<Extension<RequestId>>,
    run: Run,
    mode: StreamMode,
) -> Result<Response, ApiError> {
    let request_id = request_id
        .as_ref()
        .and_then(|Extension(id)| id.header_value().to_str().ok())
        .unwrap_or_default();
    debug!(request_id, ?run, ?mode, "Streaming run");
    let deadline = state.deadline();
    let started = state
        .engine
        .stream(&run, mode, &deadline)
        .map_err(|e| ApiError::engine("failed to start run", e))?;

    let (writer, rx) = FrameWriter::channel(state.frame_buffer);
    let span = relay_span(request_id, mode);
    tokio::spawn(async move {
        let outcome = relay(&span, writer, started, deadline).await;
        span.in_scope(|| info!(?outcome, "Relay finished"));
    });
    Ok(sse_response(rx))
}

/// Span for a relay task. It outlives the request, so it is a root span
/// carrying the request id itself.
pub fn relay_span(request_id: &str, mode: StreamMode) -> Span {
    info_span!(parent: None, "relay", request_id, ?mode)
}

/// `POST /parse`
pub async fn parse(State(state): State<AppState>, body: Bytes) -> Result<Json<Value>, ApiError> {
    let req: FileRequest = parse_body(&body)?;
    debug!(file = %req.file, "Parsing file");
    let out = state
        .engine
        .parse(&req.file, &state.deadline())
        .await
        .map_err(|e| ApiError::engine("failed to parse file", e))?;
    Ok(Json(json!({ "stdout": out })))
}

/// `POST /fmt`
pub async fn fmt(State(state): State<AppState>, body: Bytes) -> Result<Json<Value>, ApiError> {
    let document: Value = parse_body(&body)?;
    if !document.is_object() {
        return Err(ApiError::BadRequest("expected a document object".into()));
    }
    debug!("Formatting document");
    let out = state
        .engine
        .fmt(&document, &state.deadline())
        .await
        .map_err(|e| ApiError::engine("failed to format document", e))?;
    Ok(Json(json!({ "stdout": out })))
}

/// Fallback for unknown paths.
pub async fn not_found() -> Response {
    (
        axum::http::StatusCode::NOT_FOUND,
        Json(json!({ "error": "not found" })),
    )
        .into_response()
}
