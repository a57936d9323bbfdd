//! Raw stdout/stderr relay.
//!
//! Each stream is drained by its own task. Clients receive the complete text
//! seen so far on every update rather than a delta, so a client that
//! re-renders from scratch on each frame still shows the full output.

use std::collections::HashMap;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;
use tracing::{Instrument, Span, debug, warn};

use super::frame::{FrameError, FrameWriter};

pub const STDOUT: &str = "stdout";
pub const STDERR: &str = "stderr";

/// Drain `reader` line by line, emitting `{key: accumulated}` after every
/// non-empty line. The accumulated text keeps each line terminated by `\n`.
/// Returns the full accumulated text once the stream closes.
///
/// Emission stops at the first failed write but the stream is still read to
/// the end so the process never blocks on a full pipe.
pub async fn stream_output<R>(reader: R, key: &'static str, writer: FrameWriter) -> String
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut output = String::new();
    let mut line = Vec::new();
    let mut emitting = true;

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(key, error = %e, "Failed to read output stream");
                break;
            }
        }

        let text = String::from_utf8_lossy(&line);
        let text = text.trim_end_matches('\n').trim_end_matches('\r');
        if text.is_empty() {
            continue;
        }
        output.push_str(text);
        output.push('\n');

        if !emitting {
            continue;
        }
        let frame = HashMap::from([(key, output.as_str())]);
        match writer.emit(&frame).await {
            Ok(()) => debug!(key, bytes = output.len(), "Wrote output snapshot"),
            Err(FrameError::ClientDisconnected) => {
                debug!(key, "Client gone, draining without emitting");
                emitting = false;
            }
            Err(e) => warn!(key, error = %e, "Failed to write output snapshot"),
        }
    }

    output
}

/// Spawn [`stream_output`] as an independently scheduled task.
pub fn spawn_stream<R>(
    span: &Span,
    reader: R,
    key: &'static str,
    writer: FrameWriter,
) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(stream_output(reader, key, writer).instrument(span.clone()))
}
