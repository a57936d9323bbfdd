//! Server-sent event framing for relayed output.
//!
//! Every message is one `data: <json>\n\n` frame handed to the HTTP body as
//! soon as it is produced. The stream ends with a single `data: DONE\n\n`.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{HeaderValue, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde::Serialize;
use tokio::sync::{Mutex, mpsc};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

/// Reserved final frame.
pub const DONE_FRAME: &[u8] = b"data: DONE\n\n";

/// Errors from writing a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("client disconnected")]
    ClientDisconnected,

    #[error("failed to serialize frame: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Single logical writer for one response stream.
///
/// Clones share the underlying sender behind a mutex, so concurrent emitters
/// never interleave partial frames. The first failed write latches the
/// writer closed for every clone.
#[derive(Debug, Clone)]
pub struct FrameWriter {
    tx: Arc<Mutex<Option<mpsc::Sender<Bytes>>>>,
}

impl FrameWriter {
    /// Create a writer and the receiving half that feeds the response body.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx: Arc::new(Mutex::new(Some(tx))),
            },
            rx,
        )
    }

    /// Serialize `message` as one frame and deliver it.
    pub async fn emit<T: Serialize + ?Sized>(&self, message: &T) -> Result<(), FrameError> {
        let json = serde_json::to_string(message)?;
        self.write(Bytes::from(format!("data: {json}\n\n"))).await
    }

    /// Write the terminal marker and close the stream. Consumes the writer so
    /// the owner can only do this once.
    #[allow(clippy::significant_drop_tightening)]
    pub async fn emit_terminal(self) -> Result<(), FrameError> {
        let mut guard = self.tx.lock().await;
        let Some(tx) = guard.take() else {
            return Err(FrameError::ClientDisconnected);
        };
        tx.send(Bytes::from_static(DONE_FRAME))
            .await
            .map_err(|_| FrameError::ClientDisconnected)
    }

    #[allow(clippy::significant_drop_tightening)]
    async fn write(&self, frame: Bytes) -> Result<(), FrameError> {
        let mut guard = self.tx.lock().await;
        let Some(tx) = guard.as_ref() else {
            return Err(FrameError::ClientDisconnected);
        };
        if tx.send(frame).await.is_err() {
            *guard = None;
            return Err(FrameError::ClientDisconnected);
        }
        Ok(())
    }
}

/// Build the streaming response for frames arriving on `rx`.
pub fn sse_response(rx: mpsc::Receiver<Bytes>) -> Response {
    let body = ReceiverStream::new(rx).map(Ok::<Bytes, Infallible>);
    (
        [
            (
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/event-stream"),
            ),
            (header::CACHE_CONTROL, HeaderValue::from_static("no-cache")),
            (header::CONNECTION, HeaderValue::from_static("keep-alive")),
        ],
        Body::from_stream(body),
    )
        .into_response()
}
