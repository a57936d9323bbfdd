//! Execution engine boundary.
//!
//! The relay never talks to a process directly. It receives a [`Started`]
//! execution from an [`Engine`] and learns how the run ended through
//! [`ExecError`], whose exit details sit behind the [`ExitFailure`]
//! capability so each backend can supply its own introspection.

pub mod gptscript;
mod types;

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;

use crate::relay::Deadline;

pub use gptscript::GptscriptEngine;
pub use types::*;

/// A readable byte stream produced by the engine.
pub type ByteStream = Pin<Box<dyn AsyncRead + Send>>;

/// Resolves once the run has finished, no earlier than its streams closing.
pub type WaitFuture = Pin<Box<dyn Future<Output = Result<(), ExecError>> + Send>>;

/// Resolves to the run's full output once the event channel has closed.
pub type OutputFuture = Pin<Box<dyn Future<Output = FinalOutput> + Send>>;

/// Everything the engine printed plus how the run ended.
#[derive(Debug)]
pub struct FinalOutput {
    pub stdout: String,
    pub stderr: String,
    pub result: Result<(), ExecError>,
}

/// How the caller wants to observe a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    /// Plain stdout/stderr snapshots.
    Raw,
    /// Structured lifecycle events.
    Events,
}

/// A running execution.
pub enum Started {
    RawStreams {
        stdout: ByteStream,
        stderr: ByteStream,
        wait: WaitFuture,
    },
    EventChannel {
        /// NDJSON lines in the order the engine wrote them. Closed when the
        /// run exits.
        events: mpsc::Receiver<String>,
        output: OutputFuture,
    },
}

impl fmt::Debug for Started {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RawStreams { .. } => f.write_str("Started::RawStreams"),
            Self::EventChannel { .. } => f.write_str("Started::EventChannel"),
        }
    }
}

/// Exit details of a run that terminated unsuccessfully.
pub trait ExitFailure: fmt::Debug + Send + Sync {
    /// Exit code, if the run exited normally.
    fn exit_code(&self) -> Option<i32>;
    /// Backend-specific description of the exit.
    fn message(&self) -> String;
}

/// How a run failed once started.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("context deadline exceeded")]
    DeadlineExceeded,

    #[error("{}", .0.message())]
    Exited(Box<dyn ExitFailure>),

    #[error("{0}")]
    Transport(String),
}

/// Errors surfaced before or instead of a streamed response.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("failed to spawn {bin}: {reason}")]
    Spawn { bin: String, reason: String },

    #[error("failed to prepare event stream: {0}")]
    EventPipe(String),

    #[error("{source}: {stderr}")]
    Run {
        #[source]
        source: ExecError,
        stderr: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The external collaborator that actually executes tools.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Engine version string.
    async fn version(&self) -> Result<String, EngineError>;

    /// Human-readable listing of built-in tools.
    async fn list_tools(&self) -> Result<String, EngineError>;

    /// Model identifiers the engine can use.
    async fn list_models(&self) -> Result<Vec<String>, EngineError>;

    /// Execute to completion and return stdout.
    async fn run(&self, run: &Run, deadline: &Deadline) -> Result<String, EngineError>;

    /// Parse a script file into its document form.
    async fn parse(&self, file: &str, deadline: &Deadline) -> Result<String, EngineError>;

    /// Render a document back to script text.
    async fn fmt(&self, document: &serde_json::Value, deadline: &Deadline)
    -> Result<String, EngineError>;

    /// Start a run whose output is relayed while it executes. The engine must
    /// stop the run and report [`ExecError::DeadlineExceeded`] once
    /// `deadline` expires.
    fn stream(
        &self,
        run: &Run,
        mode: StreamMode,
        deadline: &Deadline,
    ) -> Result<Started, EngineError>;
}
