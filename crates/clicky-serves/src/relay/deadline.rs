//! Run deadline and outcome classification.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::engine::ExecError;

/// Ceiling for a single run, measured from execution start.
pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(15 * 60);

const TIMEOUT_MESSAGE: &str = "The tool call took too long to complete, aborting";

/// A fixed point in time after which a run is abandoned.
///
/// Clones share one cancellation token: cancelling any clone, or the
/// deadline elapsing, is observed by all of them.
#[derive(Debug, Clone)]
pub struct Deadline {
    expires_at: Instant,
    token: CancellationToken,
}

impl Deadline {
    /// Start a deadline `limit` from now.
    pub fn after(limit: Duration) -> Self {
        Self {
            expires_at: Instant::now() + limit,
            token: CancellationToken::new(),
        }
    }

    #[cfg(test)]
    fn is_expired(&self) -> bool {
        self.token.is_cancelled() || Instant::now() >= self.expires_at
    }

    #[cfg(test)]
    fn cancel(&self) {
        self.token.cancel();
    }

    /// Completes when the deadline elapses or is cancelled.
    pub async fn expired(&self) {
        tokio::select! {
            () = tokio::time::sleep_until(self.expires_at) => self.token.cancel(),
            () = self.token.cancelled() => {}
        }
    }

    /// Run `fut` unless the deadline fires first, in which case the result
    /// is [`ExecError::DeadlineExceeded`]. A result that is already available
    /// wins over a deadline expiring in the same poll.
    pub async fn guard<T, F>(&self, fut: F) -> Result<T, ExecError>
    where
        F: Future<Output = Result<T, ExecError>>,
    {
        tokio::select! {
            biased;
            res = fut => res,
            () = self.expired() => Err(ExecError::DeadlineExceeded),
        }
    }
}

/// How a run ended, derived once after all of its output has been drained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Timeout,
    NonZeroExit { code: i32, message: String },
    TransportFailure { message: String },
}

/// Frame reporting a failed run to the client.
#[derive(Debug, Clone, Serialize)]
pub struct FailureFrame {
    pub time: DateTime<Utc>,
    pub err: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
}

impl Outcome {
    /// Classify the completion result. `stderr` is the run's captured error
    /// output, folded into the message for exit and transport failures.
    pub fn classify(result: Result<(), ExecError>, stderr: &str) -> Self {
        match result {
            Ok(()) => Self::Success,
            Err(ExecError::DeadlineExceeded) => Self::Timeout,
            Err(ExecError::Exited(exit)) => {
                let code = exit.exit_code().unwrap_or(-1);
                Self::NonZeroExit {
                    code,
                    message: format!(
                        "The tool call returned an exit code of {code} with message {:?} and output {stderr:?}",
                        exit.message()
                    ),
                }
            }
            Err(err @ ExecError::Transport(_)) => Self::TransportFailure {
                message: format!("failed to wait: {err}, error output: {stderr}"),
            },
        }
    }

    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// The frame to emit before the terminal marker; `None` on success.
    pub fn failure_frame(&self) -> Option<FailureFrame> {
        let (err, code) = match self {
            Self::Success => return None,
            Self::Timeout => (TIMEOUT_MESSAGE.to_string(), None),
            Self::NonZeroExit { code, message } => (message.clone(), Some(*code)),
            Self::TransportFailure { message } => (message.clone(), None),
        };
        Some(FailureFrame {
            time: Utc::now(),
            err,
            code,
        })
    }
}
