//! Engine subprocess lifecycle.
//!
//! [`TokioProcessRunner`] spawns the engine with piped stdout/stderr and
//! turns its lifecycle into an ordered stream of [`ProcessEvent`]s: every
//! output chunk is delivered before the single `Exit` event. The child is
//! terminated on request (SIGTERM, then SIGKILL after a grace period).

use std::process::Stdio;
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::invocation::Invocation;
use super::TestError;

/// Grace period between SIGTERM and SIGKILL.
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// How long to wait for pipes to drain after the child exited. A grandchild
/// that inherited the pipes can otherwise hold them open indefinitely.
const DRAIN_GRACE: Duration = Duration::from_secs(5);

const READ_BUF_SIZE: usize = 8192;

const EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Stdout(Bytes),
    Stderr(Bytes),
    /// Exit code, `None` if the process was terminated by a signal.
    Exit(Option<i32>),
}

/// Handle to a running engine process.
#[derive(Debug)]
pub struct ProcessHandle {
    events: mpsc::Receiver<ProcessEvent>,
    kill: CancellationToken,
}

impl ProcessHandle {
    /// Wrap an event stream. Cancelling `kill` must make the producer
    /// terminate the process and still finish with an `Exit` event.
    pub fn new(events: mpsc::Receiver<ProcessEvent>, kill: CancellationToken) -> Self {
        Self { events, kill }
    }

    /// Next lifecycle event; `None` once the producer is gone.
    pub async fn next_event(&mut self) -> Option<ProcessEvent> {
        self.events.recv().await
    }

    /// Request termination. Idempotent.
    pub fn kill(&self) {
        self.kill.cancel();
    }
}

// A handle dropped before `Exit` means nobody is listening any more.
impl Drop for ProcessHandle {
    fn drop(&mut self) {
        self.kill.cancel();
    }
}

/// Launches engine processes.
pub trait ProcessRunner: Send + Sync + std::fmt::Debug {
    fn spawn(&self, invocation: &Invocation) -> Result<ProcessHandle, TestError>;
}

/// [`ProcessRunner`] backed by `tokio::process`.
#[derive(Debug, Clone, Default)]
pub struct TokioProcessRunner;

impl ProcessRunner for TokioProcessRunner {
    fn spawn(&self, invocation: &Invocation) -> Result<ProcessHandle, TestError> {
        let mut child = Command::new(&invocation.program)
            .args(&invocation.args)
            .current_dir(&invocation.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TestError::Spawn {
                program: invocation.program.clone(),
                source,
            })?;

        let pid = child.id();
        info!(
            program = %invocation.program,
            cwd = %invocation.cwd.display(),
            pid = ?pid,
            "engine process started"
        );

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let kill = CancellationToken::new();

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(pump(stdout, tx.clone(), ProcessEvent::Stdout)));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(pump(stderr, tx.clone(), ProcessEvent::Stderr)));
        }

        tokio::spawn(supervise(child, readers, tx, kill.clone()));

        Ok(ProcessHandle::new(rx, kill))
    }
}

/// Forward raw chunks from one pipe until EOF.
async fn pump<R>(mut pipe: R, tx: mpsc::Sender<ProcessEvent>, wrap: fn(Bytes) -> ProcessEvent)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        match pipe.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(wrap(Bytes::copy_from_slice(&buf[..n]))).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(error = %e, "error reading engine output");
                break;
            }
        }
    }
}

/// Wait for exit or a kill request, drain both pipes, then emit `Exit`.
async fn supervise(
    mut child: Child,
    mut readers: Vec<JoinHandle<()>>,
    tx: mpsc::Sender<ProcessEvent>,
    kill: CancellationToken,
) {
    let code = tokio::select! {
        biased;

        _ = kill.cancelled() => {
            debug!(pid = ?child.id(), "kill requested, terminating engine process");
            terminate_child(&mut child).await
        }

        status = child.wait() => match status {
            Ok(status) => status.code(),
            Err(e) => {
                warn!(error = %e, "failed to wait for engine process");
                None
            }
        },
    };

    let drained = tokio::time::timeout(DRAIN_GRACE, join_all(readers.iter_mut()))
        .await
        .is_ok();
    if !drained {
        warn!("engine output still open after exit; abandoning the rest");
        for reader in &readers {
            reader.abort();
        }
    }

    info!(exit_code = ?code, "engine process exited");
    let _ = tx.send(ProcessEvent::Exit(code)).await;
}

/// Gracefully terminate a child process.
///
/// Sends SIGTERM first, waits up to [`TERMINATE_GRACE`], then sends SIGKILL
/// if the process is still running. Returns the exit code, if any.
async fn terminate_child(child: &mut Child) -> Option<i32> {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = child.start_kill() {
            warn!(error = %e, "failed to kill child");
        }
    }

    match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
        Ok(Ok(status)) => {
            debug!(exit_code = status.code(), "child exited after SIGTERM");
            status.code()
        }
        Ok(Err(e)) => {
            warn!(error = %e, "error waiting for child after SIGTERM");
            None
        }
        Err(_) => {
            warn!("child did not exit after SIGTERM, sending SIGKILL");
            if let Err(e) = child.kill().await {
                warn!(error = %e, "failed to SIGKILL child");
            }
            None
        }
    }
}
