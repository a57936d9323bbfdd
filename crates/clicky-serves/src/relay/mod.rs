//! Streaming execution relay.
//!
//! Turns a started engine run into one ordered SSE stream:
//! - `frame` (wire framing, terminal marker)
//! - `confirm` (confirm-pairing reorder buffer)
//! - `multiplex` (raw stdout/stderr snapshots)
//! - `deadline` (run ceiling and outcome classification)
//! - `pipeline` (orchestration)

mod confirm;
mod deadline;
mod frame;
mod multiplex;
mod pipeline;

pub use confirm::ConfirmBuffer;
pub use deadline::{DEFAULT_RUN_TIMEOUT, Deadline, FailureFrame, Outcome};
pub use frame::{DONE_FRAME, FrameError, FrameWriter, sse_response};
pub use multiplex::{STDERR, STDOUT, spawn_stream, stream_output};
pub use pipeline::relay;
