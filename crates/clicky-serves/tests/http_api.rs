#![allow(clippy::unwrap_used)]

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tower::ServiceExt;

use clicky_serves::engine::{
    Engine, EngineError, ExecError, ExitFailure, FinalOutput, Run, Started, StreamMode, Target,
};
use clicky_serves::relay::Deadline;
use clicky_serves::server::{AppState, build_router};

#[derive(Debug)]
struct FakeExit;

impl ExitFailure for FakeExit {
    fn exit_code(&self) -> Option<i32> {
        Some(3)
    }

    fn message(&self) -> String {
        "exit status 3".to_string()
    }
}

const EVENT_LINES: &[&str] = &[
    r#"{"type":"runStart","runID":"r1"}"#,
    r#"{"type":"callConfirm","runID":"c1","tool":"sys.exec"}"#,
    "not json",
    r#"{"type":"callProgress","runID":"c1","content":"hi"}"#,
    r#"{"type":"runFinish","runID":"r1"}"#,
];

/// Scripted engine. An input of `"fail"` makes streamed runs exit with code 3.
struct FakeEngine;

#[async_trait]
impl Engine for FakeEngine {
    async fn version(&self) -> Result<String, EngineError> {
        Ok("gptscript version v0.9.5".to_string())
    }

    async fn list_tools(&self) -> Result<String, EngineError> {
        Ok("sys.echo\nsys.exec\n".to_string())
    }

    async fn list_models(&self) -> Result<Vec<String>, EngineError> {
        Ok(vec!["gpt-4o".to_string(), "gpt-4o-mini".to_string()])
    }

    async fn run(&self, run: &Run, _deadline: &Deadline) -> Result<String, EngineError> {
        match &run.target {
            Target::Tool(tool) => Ok(format!("ran tool: {tool}")),
            Target::File(path) => Ok(format!("ran {path} with {}", run.input)),
        }
    }

    async fn parse(&self, file: &str, _deadline: &Deadline) -> Result<String, EngineError> {
        if file.is_empty() {
            return Err(EngineError::Run {
                source: ExecError::Exited(Box::new(FakeExit)),
                stderr: "no file given".to_string(),
            });
        }
        Ok(json!({ "nodes": [{ "toolNode": { "name": file } }] }).to_string())
    }

    async fn fmt(&self, document: &Value, _deadline: &Deadline) -> Result<String, EngineError> {
        Ok(format!("nodes: {}", document["nodes"]))
    }

    fn stream(
        &self,
        run: &Run,
        mode: StreamMode,
        _deadline: &Deadline,
    ) -> Result<Started, EngineError> {
        if matches!(&run.target, Target::File(path) if path.is_empty()) {
            return Err(EngineError::Spawn {
                bin: "gptscript".to_string(),
                reason: "no such file".to_string(),
            });
        }
        let failing = run.input == "fail";
        let result = move || {
            if failing {
                Err(ExecError::Exited(Box::new(FakeExit)))
            } else {
                Ok(())
            }
        };

        match mode {
            StreamMode::Raw => Ok(Started::RawStreams {
                stdout: Box::pin(Cursor::new(b"line one\nline two\n".to_vec())),
                stderr: Box::pin(Cursor::new(b"careful\n".to_vec())),
                wait: Box::pin(async move { result() }),
            }),
            StreamMode::Events => {
                let (tx, events) = mpsc::channel(EVENT_LINES.len());
                for line in EVENT_LINES {
                    tx.try_send((*line).to_string()).unwrap();
                }
                Ok(Started::EventChannel {
                    events,
                    output: Box::pin(async move {
                        FinalOutput {
                            stdout: "all done".to_string(),
                            stderr: String::new(),
                            result: result(),
                        }
                    }),
                })
            }
        }
    }
}

fn app() -> axum::Router {
    build_router(AppState {
        engine: Arc::new(FakeEngine),
        run_timeout: Duration::from_secs(60),
        frame_buffer: 16,
    })
}

/// Send a request to the app and return (status, headers, body text).
async fn send_request(
    method: Method,
    uri: &str,
    body: &str,
) -> (StatusCode, axum::http::HeaderMap, String) {
    let req = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let resp = app().oneshot(req).await.unwrap();
    let status = resp.status();
    let headers = resp.headers().clone();
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, headers, String::from_utf8_lossy(&body).into_owned())
}

async fn get_json(uri: &str) -> (StatusCode, Value) {
    let (status, _, text) = send_request(Method::GET, uri, "").await;
    (status, serde_json::from_str(&text).unwrap())
}

async fn post_json(uri: &str, body: &str) -> (StatusCode, Value) {
    let (status, _, text) = send_request(Method::POST, uri, body).await;
    (status, serde_json::from_str(&text).unwrap())
}

/// Split an SSE body into its JSON frames, asserting it ends with exactly one
/// terminal marker.
fn sse_frames(body: &str) -> Vec<Value> {
    let chunks: Vec<&str> = body.split_terminator("\n\n").collect();
    assert_eq!(chunks.last(), Some(&"data: DONE"), "body: {body}");
    assert_eq!(chunks.iter().filter(|c| **c == "data: DONE").count(), 1);
    chunks[..chunks.len() - 1]
        .iter()
        .map(|c| serde_json::from_str(c.strip_prefix("data: ").unwrap()).unwrap())
        .collect()
}

#[tokio::test]
async fn healthz_reports_ok() {
    let (status, json) = get_json("/healthz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json, json!({ "status": "ok" }));
}

#[tokio::test]
async fn version_and_listings_wrap_stdout() {
    let (status, json) = get_json("/version").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["stdout"], "gptscript version v0.9.5");

    let (_, json) = get_json("/list-tools").await;
    assert_eq!(json["stdout"], "sys.echo\nsys.exec\n");

    let (_, json) = get_json("/list-models").await;
    assert_eq!(json["stdout"], "gpt-4o\ngpt-4o-mini");
}

#[tokio::test]
async fn responses_carry_request_id() {
    let (_, headers, _) = send_request(Method::GET, "/healthz", "").await;
    let id = headers["x-request-id"].to_str().unwrap();
    assert_eq!(id.len(), 36, "expected a UUID, got {id}");
}

#[tokio::test]
async fn invalid_body_is_bad_request() {
    let (status, json) = post_json("/run-tool", "{not json").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(
        json["error"]
            .as_str()
            .unwrap()
            .starts_with("invalid request body: ")
    );
}

#[tokio::test]
async fn run_tool_returns_output() {
    let (status, json) = post_json("/run-tool", r#"{"content":"echo hello"}"#).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["output"], "ran tool: echo hello");
}

#[tokio::test]
async fn run_file_returns_output() {
    let (status, json) = post_json("/run-file", r#"{"file":"a.gpt","input":"x"}"#).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["output"], "ran a.gpt with x");
}

#[tokio::test]
async fn parse_failure_is_internal_error() {
    let (status, json) = post_json("/parse", r#"{"file":""}"#).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    let err = json["error"].as_str().unwrap();
    assert!(err.starts_with("failed to parse file: "), "{err}");
    assert!(err.contains("no file given"), "{err}");
}

#[tokio::test]
async fn fmt_passes_document_through() {
    let (status, json) = post_json("/fmt", r#"{"nodes":[]}"#).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["stdout"], "nodes: []");

    let (status, _) = post_json("/fmt", "[]").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn raw_stream_relays_cumulative_output() {
    let (status, headers, body) =
        send_request(Method::POST, "/run-tool-stream", r#"{"content":"x"}"#).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["content-type"], "text/event-stream");

    let frames = sse_frames(&body);
    let stdout: Vec<&str> = frames
        .iter()
        .filter_map(|f| f.get("stdout").and_then(Value::as_str))
        .collect();
    assert_eq!(stdout, vec!["line one\n", "line one\nline two\n"]);
    assert!(frames.contains(&json!({ "stderr": "careful\n" })));
    assert!(frames.iter().all(|f| f.get("err").is_none()));
}

#[tokio::test]
async fn raw_stream_failure_reports_exit_before_done() {
    let (_, _, body) = send_request(
        Method::POST,
        "/run-file-stream",
        r#"{"file":"a.gpt","input":"fail"}"#,
    )
    .await;
    let frames = sse_frames(&body);
    let last = frames.last().unwrap();
    assert_eq!(last["code"], 3);
    let err = last["err"].as_str().unwrap();
    assert!(err.contains("exit code of 3"), "{err}");
    assert!(err.contains("careful"), "{err}");
}

#[tokio::test]
async fn event_stream_orders_frames_and_ends_with_output() {
    let (status, _, body) = send_request(
        Method::POST,
        "/run-tool-stream-with-events",
        r#"{"content":"x"}"#,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let frames = sse_frames(&body);
    let kinds: Vec<&str> = frames
        .iter()
        .filter_map(|f| f.get("type").and_then(Value::as_str))
        .collect();
    assert_eq!(
        kinds,
        vec!["runStart", "callConfirm", "callProgress", "runFinish"]
    );
    assert_eq!(frames[1]["tool"], "sys.exec");

    let tail = &frames[frames.len() - 2..];
    assert_eq!(tail[0]["stdout"], "all done");
    assert!(tail[0]["time"].is_string());
    assert_eq!(tail[1]["stderr"], "");
}

#[tokio::test]
async fn event_stream_failure_follows_final_output() {
    let (_, _, body) = send_request(
        Method::POST,
        "/run-file-stream-with-events",
        r#"{"file":"a.gpt","input":"fail"}"#,
    )
    .await;
    let frames = sse_frames(&body);
    let n = frames.len();
    assert_eq!(frames[n - 3]["stdout"], "all done");
    assert_eq!(frames[n - 2]["stderr"], "");
    assert_eq!(frames[n - 1]["code"], 3);
}

#[tokio::test]
async fn stream_that_cannot_start_is_plain_error() {
    let (status, json) = post_json("/run-file-stream", r#"{"file":""}"#).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(
        json["error"]
            .as_str()
            .unwrap()
            .starts_with("failed to start run: ")
    );
}

#[tokio::test]
async fn unknown_path_is_not_found() {
    let (status, json) = get_json("/nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["error"], "not found");
}
