//! `gptscript` subprocess backend.
//!
//! Spawns the CLI per request. Streaming runs hand their stdout/stderr pipes
//! straight to the relay; event runs additionally get a FIFO that the CLI
//! writes NDJSON events to (`--events-stream-to`).

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::relay::Deadline;

use super::{
    Engine, EngineError, ExecError, ExitFailure, FinalOutput, Run, Started, StreamMode,
};

/// Exit status of a `gptscript` process that did not succeed.
#[derive(Debug)]
pub struct ProcessExit {
    status: ExitStatus,
}

impl ExitFailure for ProcessExit {
    fn exit_code(&self) -> Option<i32> {
        self.status.code()
    }

    fn message(&self) -> String {
        self.status.to_string()
    }
}

/// Engine backed by the `gptscript` CLI.
#[derive(Debug, Clone)]
pub struct GptscriptEngine {
    bin: PathBuf,
    event_buffer: usize,
}

impl GptscriptEngine {
    pub fn new(bin: PathBuf, event_buffer: usize) -> Self {
        Self {
            bin,
            event_buffer: event_buffer.max(1),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.bin);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group so a deadline kill also reaches tool processes.
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }

    fn spawn(&self, cmd: &mut Command) -> Result<Child, EngineError> {
        cmd.spawn().map_err(|e| EngineError::Spawn {
            bin: self.bin.display().to_string(),
            reason: e.to_string(),
        })
    }

    /// Run to completion and collect stdout. Non-zero exits carry stderr.
    async fn output(
        &self,
        args: Vec<String>,
        stdin: Option<String>,
        deadline: Option<&Deadline>,
    ) -> Result<String, EngineError> {
        let mut cmd = self.command();
        cmd.args(&args);
        if stdin.is_some() {
            cmd.stdin(Stdio::piped());
        }
        debug!(bin = %self.bin.display(), ?args, "Running gptscript");
        let mut child = self.spawn(&mut cmd)?;
        if let (Some(text), Some(input)) = (stdin, child.stdin.take()) {
            feed_stdin(input, text);
        }

        let collect = async {
            child
                .wait_with_output()
                .await
                .map_err(|e| ExecError::Transport(e.to_string()))
        };
        let result = match deadline {
            Some(deadline) => deadline.guard(collect).await,
            None => collect.await,
        };
        let output = result.map_err(|source| EngineError::Run {
            source,
            stderr: String::new(),
        })?;

        if !output.status.success() {
            return Err(EngineError::Run {
                source: ExecError::Exited(Box::new(ProcessExit {
                    status: output.status,
                })),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl Engine for GptscriptEngine {
    async fn version(&self) -> Result<String, EngineError> {
        self.output(vec!["--version".into()], None, None).await
    }

    async fn list_tools(&self) -> Result<String, EngineError> {
        self.output(vec!["--list-tools".into()], None, None).await
    }

    async fn list_models(&self) -> Result<Vec<String>, EngineError> {
        let out = self.output(vec!["--list-models".into()], None, None).await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    async fn run(&self, run: &Run, deadline: &Deadline) -> Result<String, EngineError> {
        let mut args = run.opts.to_args();
        args.extend(run.target_args());
        self.output(args, run.stdin(), Some(deadline)).await
    }

    async fn parse(&self, file: &str, deadline: &Deadline) -> Result<String, EngineError> {
        self.output(vec!["parse".into(), file.into()], None, Some(deadline))
            .await
    }

    async fn fmt(
        &self,
        document: &serde_json::Value,
        deadline: &Deadline,
    ) -> Result<String, EngineError> {
        let doc = serde_json::to_string(document)
            .map_err(|e| EngineError::Io(std::io::Error::other(e)))?;
        self.output(vec!["fmt".into(), "-".into()], Some(doc), Some(deadline))
            .await
    }

    fn stream(
        &self,
        run: &Run,
        mode: StreamMode,
        deadline: &Deadline,
    ) -> Result<Started, EngineError> {
        let pipe = match mode {
            StreamMode::Events => Some(EventPipe::create()?),
            StreamMode::Raw => None,
        };

        let mut cmd = self.command();
        cmd.args(run.opts.to_args());
        if let Some(pipe) = &pipe {
            cmd.arg(format!("--events-stream-to={}", pipe.path.display()));
        }
        cmd.args(run.target_args());
        let stdin = run.stdin();
        if stdin.is_some() {
            cmd.stdin(Stdio::piped());
        }

        let mut child = self.spawn(&mut cmd)?;
        info!(pid = ?child.id(), ?mode, "Spawned gptscript run");
        if let (Some(text), Some(input)) = (stdin, child.stdin.take()) {
            feed_stdin(input, text);
        }
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Io(std::io::Error::other("stdout not captured")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| EngineError::Io(std::io::Error::other("stderr not captured")))?;

        let exited = CancellationToken::new();
        let done = supervise(child, deadline.clone(), exited.clone());
        let wait = async move {
            done.await
                .unwrap_or_else(|_| Err(ExecError::Transport("process supervisor exited".into())))
        };

        let Some(pipe) = pipe else {
            return Ok(Started::RawStreams {
                stdout: Box::pin(stdout),
                stderr: Box::pin(stderr),
                wait: Box::pin(wait),
            });
        };

        let (tx, events) = mpsc::channel(self.event_buffer);
        let forwarder = tokio::spawn(pipe.forward(tx, exited));
        // Drain both pipes now; the child blocks if nobody reads them while
        // the relay is busy with events.
        let stdout = tokio::spawn(read_all(stdout));
        let stderr = tokio::spawn(read_all(stderr));

        let output = async move {
            let result = wait.await;
            let (stdout, stderr, _) = tokio::join!(stdout, stderr, forwarder);
            FinalOutput {
                stdout: stdout.unwrap_or_default(),
                stderr: stderr.unwrap_or_default(),
                result,
            }
        };
        Ok(Started::EventChannel {
            events,
            output: Box::pin(output),
        })
    }
}

/// Wait for `child`, killing its process group when the deadline fires.
/// `exited` is cancelled once the process is gone.
fn supervise(
    mut child: Child,
    deadline: Deadline,
    exited: CancellationToken,
) -> oneshot::Receiver<Result<(), ExecError>> {
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let result = tokio::select! {
            biased;
            status = child.wait() => match status {
                Ok(status) if status.success() => Ok(()),
                Ok(status) => Err(ExecError::Exited(Box::new(ProcessExit { status }))),
                Err(e) => Err(ExecError::Transport(e.to_string())),
            },
            () = deadline.expired() => {
                warn!(pid = ?child.id(), "Run deadline exceeded, killing process group");
                kill_group(&mut child).await;
                Err(ExecError::DeadlineExceeded)
            }
        };
        debug!(ok = result.is_ok(), "gptscript process finished");
        exited.cancel();
        let _ = tx.send(result);
    });
    rx
}

async fn kill_group(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;
        if let Err(e) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
            warn!(pid, error = %e, "Failed to kill process group");
        }
    }
    if let Err(e) = child.kill().await {
        debug!(error = %e, "Failed to kill process");
    }
}

fn feed_stdin(mut pipe: tokio::process::ChildStdin, text: String) {
    tokio::spawn(async move {
        if let Err(e) = pipe.write_all(text.as_bytes()).await {
            warn!(error = %e, "Failed to write tool to stdin");
        }
        // Dropping the pipe closes stdin so the CLI stops reading.
    });
}

async fn read_all<R: AsyncRead + Unpin>(mut reader: R) -> String {
    let mut buf = Vec::new();
    if let Err(e) = reader.read_to_end(&mut buf).await {
        warn!(error = %e, "Failed to read process output");
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Named pipe the CLI streams events into. The temp dir is removed when the
/// pipe is dropped.
struct EventPipe {
    dir: tempfile::TempDir,
    path: PathBuf,
}

impl EventPipe {
    #[cfg(unix)]
    fn create() -> Result<Self, EngineError> {
        use nix::sys::stat::Mode;

        let dir = tempfile::Builder::new()
            .prefix("clicky-events")
            .tempdir()
            .map_err(|e| EngineError::EventPipe(e.to_string()))?;
        let path = dir.path().join("events.fifo");
        nix::unistd::mkfifo(&path, Mode::S_IRUSR | Mode::S_IWUSR)
            .map_err(|e| EngineError::EventPipe(e.to_string()))?;
        Ok(Self { dir, path })
    }

    #[cfg(not(unix))]
    fn create() -> Result<Self, EngineError> {
        Err(EngineError::EventPipe(
            "event streaming requires named pipes".to_string(),
        ))
    }

    /// Forward each line written to the pipe until the writer closes it.
    async fn forward(self, tx: mpsc::Sender<String>, exited: CancellationToken) {
        // Opening a FIFO for reading blocks until a writer shows up. If the
        // process exits without ever opening it, hold a writer of our own
        // until the open completes so the reader then sees EOF.
        let open = tokio::fs::File::open(self.path.clone());
        tokio::pin!(open);
        let file = tokio::select! {
            biased;
            file = &mut open => file,
            () = exited.cancelled() => {
                let _writer = hold_writer(&self.path);
                open.await
            }
        };
        let file = match file {
            Ok(file) => file,
            Err(e) => {
                warn!(error = %e, "Failed to open event pipe");
                return;
            }
        };

        let mut lines = BufReader::new(file).lines();
        let mut forwarded = 0usize;
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if tx.send(line).await.is_err() {
                        debug!("Event receiver dropped");
                        break;
                    }
                    forwarded += 1;
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Failed to read event pipe");
                    break;
                }
            }
        }
        debug!(forwarded, dir = %self.dir.path().display(), "Event pipe closed");
    }
}

/// Read-write opens of a FIFO never block on Linux.
#[cfg(unix)]
fn hold_writer(path: &Path) -> Option<std::fs::File> {
    use std::os::unix::fs::OpenOptionsExt;

    std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(nix::libc::O_NONBLOCK)
        .open(path)
        .map_err(|e| warn!(error = %e, "Failed to open event pipe writer"))
        .ok()
}

#[cfg(not(unix))]
fn hold_writer(_path: &Path) -> Option<std::fs::File> {
    None
}
