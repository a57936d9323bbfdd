//! Relay orchestration: engine output → ordered SSE frames.
//!
//! Data flow:
//! ```text
//! RawStreams:   stdout ─┐
//!                       ├─ multiplexer tasks ─→ FrameWriter ─→ HTTP body
//!               stderr ─┘            join → wait → classify → DONE
//!
//! EventChannel: NDJSON lines → parse → ConfirmBuffer ─→ FrameWriter
//!               close → final stdout/stderr → classify → DONE
//! ```

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{Instrument, Span, debug, info, warn};

use clicky_core::event;

use crate::engine::{ExecError, FinalOutput, OutputFuture, Started, WaitFuture};

use super::confirm::ConfirmBuffer;
use super::deadline::{Deadline, Outcome};
use super::frame::{FrameError, FrameWriter};
use super::multiplex::{self, STDERR, STDOUT};

/// How long the final output may lag behind an expired deadline.
const FINAL_OUTPUT_GRACE: Duration = Duration::from_secs(5);

/// Final output frame emitted in event mode.
#[derive(Debug, Serialize)]
struct OutputFrame<'a> {
    time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stdout: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stderr: Option<&'a str>,
}

/// Relay a started execution to `writer` until the run has finished, then
/// write the terminal marker. Every log line is recorded inside `span`.
///
/// Always writes exactly one terminal marker (unless the client is already
/// gone) and returns how the run ended.
pub async fn relay(
    span: &Span,
    writer: FrameWriter,
    started: Started,
    deadline: Deadline,
) -> Outcome {
    async move {
        let (result, stderr) = match started {
            Started::RawStreams {
                stdout,
                stderr,
                wait,
            } => relay_raw(span, &writer, stdout, stderr, wait, &deadline).await,
            Started::EventChannel { events, output } => {
                relay_events(&writer, events, output, &deadline).await
            }
        };

        let outcome = Outcome::classify(result, &stderr);
        if let Some(frame) = outcome.failure_frame() {
            info!(err = %frame.err, "Run failed");
            emit_best_effort(&writer, &frame).await;
        }

        match writer.emit_terminal().await {
            Ok(()) => debug!("Wrote DONE frame"),
            Err(e) => debug!(error = %e, "Could not write DONE frame"),
        }
        outcome
    }
    .instrument(span.clone())
    .await
}

/// Streaming → Draining → Classifying.
async fn relay_raw(
    span: &Span,
    writer: &FrameWriter,
    stdout: crate::engine::ByteStream,
    stderr: crate::engine::ByteStream,
    wait: WaitFuture,
    deadline: &Deadline,
) -> (Result<(), ExecError>, String) {
    let out = multiplex::spawn_stream(span, stdout, STDOUT, writer.clone());
    let err = multiplex::spawn_stream(span, stderr, STDERR, writer.clone());

    let (out, err) = tokio::join!(out, err);
    if let Err(e) = out {
        warn!(error = %e, "stdout relay task failed");
    }
    let stderr = err.unwrap_or_else(|e| {
        warn!(error = %e, "stderr relay task failed");
        String::new()
    });
    debug!("Output streams drained");

    (deadline.guard(wait).await, stderr)
}

/// Consuming → ReadingFinalOutput → Classifying.
async fn relay_events(
    writer: &FrameWriter,
    mut events: tokio::sync::mpsc::Receiver<String>,
    output: OutputFuture,
    deadline: &Deadline,
) -> (Result<(), ExecError>, String) {
    let mut buffer = ConfirmBuffer::new();
    let mut written = 0usize;

    debug!("Receiving events");
    while let Some(line) = events.recv().await {
        if line.trim().is_empty() {
            continue;
        }
        let event = match event::parse_line(&line) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, line = %line, "Skipping malformed event");
                continue;
            }
        };
        for released in buffer.push(event) {
            emit_best_effort(writer, &released).await;
            written += 1;
        }
    }

    let dropped = buffer.finish();
    if !dropped.is_empty() {
        warn!(
            count = dropped.len(),
            "Discarding confirm events that never received a follow-up event"
        );
    }
    debug!(written, "Done receiving events");

    let FinalOutput {
        stdout,
        stderr,
        result,
    } = final_output(output, deadline).await;

    let now = Utc::now();
    for frame in [
        OutputFrame {
            time: now,
            stdout: Some(&stdout),
            stderr: None,
        },
        OutputFrame {
            time: now,
            stdout: None,
            stderr: Some(&stderr),
        },
    ] {
        emit_best_effort(writer, &frame).await;
    }

    (result, stderr)
}

/// Await the run's final output. The engine stops the run once the deadline
/// fires, so after that the output only gets [`FINAL_OUTPUT_GRACE`] to show
/// up before it is given up on.
async fn final_output(mut output: OutputFuture, deadline: &Deadline) -> FinalOutput {
    tokio::select! {
        biased;
        out = &mut output => return out,
        () = deadline.expired() => {}
    }
    match tokio::time::timeout(FINAL_OUTPUT_GRACE, output).await {
        Ok(out) => out,
        Err(_) => {
            warn!("Engine did not report final output after the deadline");
            FinalOutput {
                stdout: String::new(),
                stderr: String::new(),
                result: Err(ExecError::DeadlineExceeded),
            }
        }
    }
}

async fn emit_best_effort<T: Serialize + ?Sized>(writer: &FrameWriter, message: &T) {
    match writer.emit(message).await {
        Ok(()) => {}
        Err(FrameError::ClientDisconnected) => debug!("Client gone, frame dropped"),
        Err(e) => warn!(error = %e, "Failed to write frame"),
    }
}
