//! Lifecycle of one interactive interpreter child process.
//!
//! Owns the three pipes: the execution queue writes fragments to stdin, pump
//! tasks forward stdout/stderr chunks into the output router, and a waiter
//! task reports the exit exactly once on a watch channel. The supervisor never
//! restarts the process itself; that policy belongs to the queue.

use std::process::Stdio;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, watch, Mutex};
use tracing::{debug, info, warn};

use crate::config::InterpreterMeta;
use crate::error::ExecError;
use crate::router::{OutputRouter, StreamKind};

/// Lifecycle state of the supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Running,
    Exited { code: Option<i32> },
}

/// Supervises a single interpreter process from spawn to exit.
#[derive(Debug)]
pub struct InterpreterSupervisor {
    language: String,
    stdin: Mutex<ChildStdin>,
    status: watch::Receiver<ProcessStatus>,
    kill: Mutex<Option<oneshot::Sender<()>>>,
}

impl InterpreterSupervisor {
    /// Spawn the interpreter with piped stdio and the configured sandbox
    /// search-path extension, wiring its output streams into `router`.
    pub async fn start(
        language: &str,
        meta: &InterpreterMeta,
        router: OutputRouter,
    ) -> Result<Self, ExecError> {
        debug!(lang = %language, program = %meta.program, "Spawning interpreter");

        let mut command = Command::new(&meta.program);
        command
            .args(&meta.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(sandbox) = &meta.sandbox_path {
            command.env(&sandbox.var, extended_path(&sandbox.var, &sandbox.dir));
        }

        let mut child = command.spawn().map_err(|source| ExecError::Launch {
            program: meta.program.clone(),
            source,
        })?;

        let stdin = take_pipe(child.stdin.take(), &meta.program, "stdin")?;
        let stdout = take_pipe(child.stdout.take(), &meta.program, "stdout")?;
        let stderr = take_pipe(child.stderr.take(), &meta.program, "stderr")?;

        let pumps = [
            tokio::spawn(pump_output(stdout, StreamKind::Stdout, router.clone())),
            tokio::spawn(pump_output(stderr, StreamKind::Stderr, router)),
        ];

        let (status_tx, status_rx) = watch::channel(ProcessStatus::Running);
        let (kill_tx, kill_rx) = oneshot::channel();
        tokio::spawn(supervise_exit(
            child,
            pumps,
            status_tx,
            kill_rx,
            language.to_string(),
        ));

        Ok(Self {
            language: language.to_string(),
            stdin: Mutex::new(stdin),
            status: status_rx,
            kill: Mutex::new(Some(kill_tx)),
        })
    }

    /// Write one code fragment, with a trailing newline, to the
    /// interpreter's stdin.
    ///
    /// Suspends if the pipe buffer is full. Fails with `NotRunning` once the
    /// process has exited (including a write that hits a closed pipe).
    pub async fn write(&self, text: &str) -> Result<(), ExecError> {
        if !self.is_running() {
            return Err(ExecError::NotRunning);
        }

        let mut stdin = self.stdin.lock().await;
        let write = async {
            stdin.write_all(text.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        };
        write.await.map_err(|e| {
            debug!(lang = %self.language, error = %e, "Write to interpreter failed");
            ExecError::NotRunning
        })
    }

    /// Current lifecycle state.
    pub fn status(&self) -> ProcessStatus {
        *self.status.borrow()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.status(), ProcessStatus::Running)
    }

    /// A watch on the process status, for awaiting exit alongside other
    /// events. Fires `Exited` exactly once.
    pub fn exit_watch(&self) -> watch::Receiver<ProcessStatus> {
        self.status.clone()
    }

    /// Kill the process and wait until it has been reaped.
    pub async fn shutdown(&self) {
        if let Some(kill) = self.kill.lock().await.take() {
            let _ = kill.send(());
        }
        let mut status = self.status.clone();
        let _ = status
            .wait_for(|s| matches!(s, ProcessStatus::Exited { .. }))
            .await;
    }
}

/// Resolve once the watched process has exited, with its exit code.
pub async fn wait_exited(mut status: watch::Receiver<ProcessStatus>) -> Option<i32> {
    loop {
        if let ProcessStatus::Exited { code } = *status.borrow_and_update() {
            return code;
        }
        if status.changed().await.is_err() {
            // Waiter task gone without reporting; nothing more will arrive.
            return None;
        }
    }
}

fn take_pipe<T>(pipe: Option<T>, program: &str, name: &str) -> Result<T, ExecError> {
    pipe.ok_or_else(|| ExecError::Launch {
        program: program.to_string(),
        source: std::io::Error::other(format!("{name} pipe not captured")),
    })
}

/// Append the sandbox root to the variable's existing value.
fn extended_path(var: &str, dir: &str) -> String {
    match std::env::var(var) {
        Ok(existing) if !existing.is_empty() => format!("{existing}:{dir}"),
        _ => dir.to_string(),
    }
}

/// Forward raw chunks from one output pipe into the router until EOF.
async fn pump_output<R: AsyncRead + Unpin>(mut reader: R, kind: StreamKind, router: OutputRouter) {
    let mut buf = [0_u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => router.ingest(kind, &buf[..n]).await,
            Err(e) => {
                debug!(stream = ?kind, error = %e, "Interpreter output pipe error");
                break;
            }
        }
    }
}

/// How long to wait for the pump tasks to drain after the process dies.
/// Bounded in case an orphaned grandchild keeps a pipe open.
const PUMP_DRAIN_GRACE: std::time::Duration = std::time::Duration::from_millis(500);

/// Wait for process exit or a kill request, reap, drain the pumps, and
/// publish the exit code.
///
/// `Exited` is published only after the pumps finish (or the grace elapses),
/// so the router has seen the process's final output by the time the queue
/// reacts to the exit.
async fn supervise_exit(
    mut child: Child,
    pumps: [tokio::task::JoinHandle<()>; 2],
    status: watch::Sender<ProcessStatus>,
    kill: oneshot::Receiver<()>,
    language: String,
) {
    let waited = tokio::select! {
        waited = child.wait() => Some(waited),
        _ = kill => None,
    };

    let waited = match waited {
        Some(waited) => waited,
        None => {
            debug!(lang = %language, "Killing interpreter");
            if let Err(e) = child.kill().await {
                warn!(lang = %language, error = %e, "Failed to kill interpreter");
            }
            child.wait().await
        }
    };

    let code = match waited {
        Ok(exit) => exit.code(),
        Err(e) => {
            warn!(lang = %language, error = %e, "Failed waiting for interpreter");
            None
        }
    };

    let drained = tokio::time::timeout(PUMP_DRAIN_GRACE, async {
        for pump in pumps {
            let _ = pump.await;
        }
    })
    .await;
    if drained.is_err() {
        warn!(lang = %language, "Output pipes still open after exit, abandoning drain");
    }

    info!(lang = %language, code = ?code, "Interpreter process exited");
    let _ = status.send(ProcessStatus::Exited { code });
}
