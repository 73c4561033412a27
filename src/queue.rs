//! FIFO serialization of execution requests against one interpreter.
//!
//! The worker task is the only caller of `InterpreterSupervisor::write`: it
//! dispatches exactly one request at a time (attach the correlation, then
//! write the fragment) and resolves the caller when the router completes it.
//! It also owns the restart policy: the interpreter is launched at first
//! dispatch, crashes fail all outstanding work, and consecutive failures are
//! bounded by the configured budget before the language goes out of service.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tracing::{debug, error, trace, warn};

use crate::config::InterpreterMeta;
use crate::error::ExecError;
use crate::router::{Captured, OutputRouter};
use crate::supervisor::{wait_exited, InterpreterSupervisor, ProcessStatus};

/// Correlation tokens are never reused for the lifetime of the daemon.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Output of a completed execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    /// The interpreter exited in the same instant the response completed
    /// (typically the fragment itself ended the session). The next request
    /// gets a fresh process.
    pub exited_during_execution: bool,
}

pub type ExecOutcome = Result<ExecutionResult, ExecError>;

struct Submission {
    source: String,
    reply: oneshot::Sender<ExecOutcome>,
}

/// Handle to one language's execution queue.
#[derive(Clone)]
pub struct ExecutionQueue {
    language: String,
    tx: mpsc::Sender<Submission>,
}

impl ExecutionQueue {
    /// Spawn the worker task for `language`. Dropping every handle closes the
    /// queue; the returned join handle resolves once the worker has drained
    /// and killed its interpreter.
    pub fn spawn(language: String, meta: InterpreterMeta) -> (Self, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(64);
        let worker = Worker {
            language: language.clone(),
            meta,
            supervisor: None,
            fifo: VecDeque::new(),
            failures: 0,
            unavailable: false,
        };
        let handle = tokio::spawn(worker.run(rx));
        (Self { language, tx }, handle)
    }

    /// Submit a fragment and wait for its outcome.
    pub async fn execute(&self, source: String) -> ExecOutcome {
        let (reply, response) = oneshot::channel();
        if self.tx.send(Submission { source, reply }).await.is_err() {
            return Err(self.unavailable());
        }
        response.await.unwrap_or_else(|_| Err(self.unavailable()))
    }

    fn unavailable(&self) -> ExecError {
        ExecError::ServiceUnavailable {
            lang: self.language.clone(),
        }
    }
}

struct QueuedRequest {
    id: u64,
    source: String,
    reply: oneshot::Sender<ExecOutcome>,
}

/// How one dispatched round trip ended.
enum RoundTrip {
    Done(Result<Captured, oneshot::error::RecvError>),
    Crashed(Option<i32>),
    TimedOut,
}

struct Worker {
    language: String,
    meta: InterpreterMeta,
    supervisor: Option<(InterpreterSupervisor, OutputRouter)>,
    fifo: VecDeque<QueuedRequest>,
    failures: u32,
    unavailable: bool,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::Receiver<Submission>) {
        debug!(lang = %self.language, "Execution queue running");
        let mut open = true;
        loop {
            if self.fifo.is_empty() {
                if !open {
                    break;
                }
                match rx.recv().await {
                    Some(sub) => self.admit(sub),
                    None => {
                        open = false;
                        continue;
                    }
                }
            }
            while let Ok(sub) = rx.try_recv() {
                self.admit(sub);
            }

            if let Some(req) = self.fifo.pop_front() {
                if req.reply.is_closed() {
                    debug!(lang = %self.language, request = req.id, "Caller gone before dispatch, skipping");
                    continue;
                }
                open = self.serve(req, &mut rx, open).await;
            }
        }
        self.shutdown().await;
    }

    fn admit(&mut self, sub: Submission) {
        let id = NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed);
        trace!(lang = %self.language, request = id, "Queued");
        self.fifo.push_back(QueuedRequest {
            id,
            source: sub.source,
            reply: sub.reply,
        });
    }

    /// Run one request through dispatch → completion, continuing to accept
    /// submissions while it is in flight. Returns whether the submission
    /// channel is still open.
    async fn serve(
        &mut self,
        req: QueuedRequest,
        rx: &mut mpsc::Receiver<Submission>,
        open: bool,
    ) -> bool {
        if let Err(err) = self.ensure_running().await {
            warn!(lang = %self.language, request = req.id, error = %err, "Rejecting request");
            let _ = req.reply.send(Err(err));
            return open;
        }
        let Some((supervisor, router)) = self.supervisor.take() else {
            let _ = req.reply.send(Err(ExecError::NotRunning));
            return open;
        };

        // Attach before writing so the response's first bytes cannot be missed.
        let mut completion = match router.attach(req.id, self.meta.completion.clone()).await {
            Ok(rx) => rx,
            Err(err) => {
                error!(lang = %self.language, request = req.id, "Correlation still attached at dispatch");
                self.supervisor = Some((supervisor, router));
                let _ = req.reply.send(Err(err));
                return open;
            }
        };

        debug!(lang = %self.language, request = req.id, bytes = req.source.len(), "Dispatched");
        if let Err(_err) = supervisor.write(&req.source).await {
            // The pipe closed under us: an exit observed at dispatch time.
            let partial = router.detach().await.unwrap_or_default();
            let code = exit_code(&supervisor);
            let (stdout, stderr) = partial.into_text();
            let _ = req.reply.send(Err(ExecError::InterpreterCrashed {
                exit_code: code,
                stdout,
                stderr,
            }));
            self.note_failure();
            self.fail_queued_crashed(code);
            return open;
        }

        let deadline = self.meta.request_timeout().map(|d| Instant::now() + d);
        let exit = wait_exited(supervisor.exit_watch());
        tokio::pin!(exit);
        let mut channel_open = open;

        let outcome = loop {
            tokio::select! {
                captured = &mut completion => break RoundTrip::Done(captured),
                code = &mut exit => break RoundTrip::Crashed(code),
                sub = rx.recv(), if channel_open => match sub {
                    Some(sub) => self.admit(sub),
                    None => channel_open = false,
                },
                () = sleep_deadline(deadline), if deadline.is_some() => break RoundTrip::TimedOut,
            }
        };

        match outcome {
            RoundTrip::Done(Ok(captured)) => {
                let exited = !supervisor.is_running();
                let (stdout, stderr) = captured.into_text();
                debug!(lang = %self.language, request = req.id, exited, "Completed");
                let _ = req.reply.send(Ok(ExecutionResult {
                    stdout,
                    stderr,
                    exited_during_execution: exited,
                }));
                self.failures = 0;
                if exited {
                    // The fragment ended the session; queued work was written
                    // against state that no longer exists.
                    self.fail_queued_crashed(exit_code(&supervisor));
                } else {
                    self.supervisor = Some((supervisor, router));
                }
            }
            RoundTrip::Done(Err(_)) => {
                error!(lang = %self.language, request = req.id, "Correlation dropped without completing");
                supervisor.shutdown().await;
                let _ = req.reply.send(Err(ExecError::InterpreterCrashed {
                    exit_code: None,
                    stdout: String::new(),
                    stderr: String::new(),
                }));
                self.note_failure();
                self.fail_queued_crashed(None);
            }
            RoundTrip::Crashed(code) => {
                if let Ok(captured) = completion.try_recv() {
                    // The response completed in the same instant the process
                    // died; report the output and surface the exit.
                    let (stdout, stderr) = captured.into_text();
                    debug!(lang = %self.language, request = req.id, code = ?code, "Completed as the interpreter exited");
                    let _ = req.reply.send(Ok(ExecutionResult {
                        stdout,
                        stderr,
                        exited_during_execution: true,
                    }));
                    self.failures = 0;
                } else {
                    let partial = router.detach().await.unwrap_or_default();
                    let (stdout, stderr) = partial.into_text();
                    warn!(lang = %self.language, request = req.id, code = ?code, "Interpreter exited during execution");
                    let _ = req.reply.send(Err(ExecError::InterpreterCrashed {
                        exit_code: code,
                        stdout,
                        stderr,
                    }));
                    self.note_failure();
                }
                self.fail_queued_crashed(code);
            }
            RoundTrip::TimedOut => {
                warn!(lang = %self.language, request = req.id, "Request timed out, killing interpreter");
                supervisor.shutdown().await;
                let partial = router.detach().await.unwrap_or_default();
                let (stdout, stderr) = partial.into_text();
                let _ = req.reply.send(Err(ExecError::ExecutionTimeout { stdout, stderr }));
                // A deliberate kill, not an interpreter fault; the restart
                // counter is untouched.
                self.fail_queued_crashed(None);
            }
        }

        channel_open
    }

    /// Leave a live interpreter in place, restarting within the budget.
    ///
    /// Bounded: every failed attempt counts toward `restart.max_attempts`,
    /// and exhaustion is terminal for this language.
    async fn ensure_running(&mut self) -> Result<(), ExecError> {
        loop {
            if self.unavailable {
                return Err(ExecError::ServiceUnavailable {
                    lang: self.language.clone(),
                });
            }
            match &self.supervisor {
                Some((sup, _)) if sup.is_running() => return Ok(()),
                Some(_) => {
                    debug!(lang = %self.language, "Interpreter exited while idle");
                    self.supervisor = None;
                    self.note_failure();
                    continue;
                }
                None => {}
            }

            if self.failures > 0 {
                let backoff = self.meta.restart.backoff(self.failures);
                debug!(
                    lang = %self.language,
                    failures = self.failures,
                    backoff = ?backoff,
                    "Backing off before restart"
                );
                sleep(backoff).await;
            }

            match self.start_interpreter().await {
                Ok(pair) => {
                    self.supervisor = Some(pair);
                    return Ok(());
                }
                Err(err) => {
                    warn!(lang = %self.language, error = %err, "Interpreter launch failed");
                    self.note_failure();
                }
            }
        }
    }

    async fn start_interpreter(&self) -> Result<(InterpreterSupervisor, OutputRouter), ExecError> {
        let router = OutputRouter::new();
        let supervisor =
            InterpreterSupervisor::start(&self.language, &self.meta, router.clone()).await?;
        self.settle(&supervisor, &router).await?;
        Ok((supervisor, router))
    }

    /// Absorb the interpreter's startup banner/first prompt under the
    /// completion policy so it cannot contaminate the first request's output.
    async fn settle(
        &self,
        supervisor: &InterpreterSupervisor,
        router: &OutputRouter,
    ) -> Result<(), ExecError> {
        let id = NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed);
        let completion = router.attach(id, self.meta.completion.clone()).await?;

        match timeout(self.meta.ready_timeout(), completion).await {
            Ok(Ok(banner)) => {
                trace!(
                    lang = %self.language,
                    bytes = banner.stdout.len() + banner.stderr.len(),
                    "Interpreter settled"
                );
            }
            Ok(Err(_)) => {}
            Err(_) => {
                router.detach().await;
                warn!(lang = %self.language, "Interpreter did not settle before the ready timeout");
                supervisor.shutdown().await;
                return Err(launch_failed(&self.meta.program, "did not settle in time"));
            }
        }

        if supervisor.is_running() {
            Ok(())
        } else {
            Err(launch_failed(&self.meta.program, "exited during startup"))
        }
    }

    fn note_failure(&mut self) {
        self.failures += 1;
        if self.failures >= self.meta.restart.max_attempts && !self.unavailable {
            self.unavailable = true;
            error!(
                lang = %self.language,
                failures = self.failures,
                "Restart budget exhausted, marking language unavailable"
            );
        }
    }

    fn fail_queued_crashed(&mut self, code: Option<i32>) {
        if self.fifo.is_empty() {
            return;
        }
        warn!(
            lang = %self.language,
            queued = self.fifo.len(),
            "Failing queued requests after interpreter exit"
        );
        for req in self.fifo.drain(..) {
            let _ = req.reply.send(Err(ExecError::InterpreterCrashed {
                exit_code: code,
                stdout: String::new(),
                stderr: String::new(),
            }));
        }
    }

    async fn shutdown(mut self) {
        debug!(lang = %self.language, "Execution queue shutting down");
        for req in self.fifo.drain(..) {
            let _ = req.reply.send(Err(ExecError::ServiceUnavailable {
                lang: self.language.clone(),
            }));
        }
        if let Some((supervisor, _)) = self.supervisor.take() {
            supervisor.shutdown().await;
        }
    }
}

fn exit_code(supervisor: &InterpreterSupervisor) -> Option<i32> {
    match supervisor.status() {
        ProcessStatus::Exited { code } => code,
        ProcessStatus::Running => None,
    }
}

fn launch_failed(program: &str, reason: &str) -> ExecError {
    ExecError::Launch {
        program: program.to_string(),
        source: std::io::Error::other(format!("interpreter {reason}")),
    }
}

async fn sleep_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CompletionPolicy, RestartPolicy};

    fn meta(program: &str, args: &[&str], completion: CompletionPolicy) -> InterpreterMeta {
        InterpreterMeta {
            program: program.to_string(),
            args: args.iter().map(ToString::to_string).collect(),
            sandbox_path: None,
            completion,
            ready_timeout_seconds: 5,
            request_timeout_seconds: None,
            restart: RestartPolicy {
                max_attempts: 3,
                backoff_ms: 50,
            },
        }
    }

    fn cat_meta(quiet_ms: u64) -> InterpreterMeta {
        meta("cat", &[], CompletionPolicy::Idle { quiet_ms })
    }

    fn spawn_queue(language: &str, meta: InterpreterMeta) -> ExecutionQueue {
        let (queue, _worker) = ExecutionQueue::spawn(language.to_string(), meta);
        queue
    }

    #[tokio::test]
    async fn requests_complete_in_order_without_contamination() {
        let queue = spawn_queue("cat", cat_meta(100));

        let (one, two, three) = tokio::join!(
            queue.execute("one".to_string()),
            queue.execute("two".to_string()),
            queue.execute("three".to_string()),
        );

        assert_eq!(one.unwrap().stdout, "one\n");
        assert_eq!(two.unwrap().stdout, "two\n");
        assert_eq!(three.unwrap().stdout, "three\n");
    }

    #[tokio::test]
    async fn crash_fails_dispatched_and_queued_requests() {
        let queue = spawn_queue(
            "sh",
            meta(
                "sh",
                &["-c", "read line; exit 3"],
                CompletionPolicy::Idle { quiet_ms: 100 },
            ),
        );

        let (first, second) = tokio::join!(
            queue.execute("boom".to_string()),
            queue.execute("never runs".to_string()),
        );

        assert!(matches!(
            first.unwrap_err(),
            ExecError::InterpreterCrashed {
                exit_code: Some(3),
                ..
            }
        ));
        assert!(matches!(
            second.unwrap_err(),
            ExecError::InterpreterCrashed { .. }
        ));
    }

    #[tokio::test]
    async fn crash_result_carries_partial_output() {
        let queue = spawn_queue(
            "sh",
            meta(
                "sh",
                &["-c", "read line; echo partial; exit 5"],
                CompletionPolicy::Idle { quiet_ms: 300 },
            ),
        );

        let err = queue.execute("go".to_string()).await.unwrap_err();
        match err {
            ExecError::InterpreterCrashed {
                exit_code, stdout, ..
            } => {
                assert_eq!(exit_code, Some(5));
                assert_eq!(stdout, "partial\n");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn restart_within_budget_recovers() {
        let script = r#"while read l; do if [ "$l" = crash ]; then exit 9; fi; echo "$l"; done"#;
        let queue = spawn_queue(
            "sh",
            meta(
                "sh",
                &["-c", script],
                CompletionPolicy::Idle { quiet_ms: 100 },
            ),
        );

        let crashed = queue.execute("crash".to_string()).await.unwrap_err();
        assert!(matches!(
            crashed,
            ExecError::InterpreterCrashed {
                exit_code: Some(9),
                ..
            }
        ));

        // A fresh process serves the next request.
        let ok = queue.execute("hello".to_string()).await.unwrap();
        assert_eq!(ok.stdout, "hello\n");
        assert!(!ok.exited_during_execution);
    }

    #[tokio::test]
    async fn exhausted_budget_fails_fast_with_unavailable() {
        let mut broken = cat_meta(100);
        broken.program = "/nonexistent/interpreter-binary".to_string();
        broken.restart = RestartPolicy {
            max_attempts: 2,
            backoff_ms: 10,
        };
        let queue = spawn_queue("python", broken);

        let first = queue.execute("1+1".to_string()).await.unwrap_err();
        assert!(matches!(first, ExecError::ServiceUnavailable { .. }));

        let second = queue.execute("1+1".to_string()).await.unwrap_err();
        assert!(matches!(second, ExecError::ServiceUnavailable { .. }));
    }

    #[tokio::test]
    async fn unresponsive_startup_exhausts_budget() {
        let mut quiet = meta(
            "sh",
            &["-c", "sleep 30"],
            CompletionPolicy::Prompt {
                marker: "$ ".to_string(),
            },
        );
        quiet.ready_timeout_seconds = 1;
        quiet.restart = RestartPolicy {
            max_attempts: 1,
            backoff_ms: 10,
        };
        let queue = spawn_queue("sh", quiet);

        let err = queue.execute("anything".to_string()).await.unwrap_err();
        assert!(matches!(err, ExecError::ServiceUnavailable { .. }));
    }

    #[tokio::test]
    async fn request_timeout_kills_the_interpreter() {
        // Prints the prompt once at startup, then hangs on the first request.
        let script = r#"printf "$ "; read l; exec sleep 30"#;
        let mut slow = meta(
            "sh",
            &["-c", script],
            CompletionPolicy::Prompt {
                marker: "$ ".to_string(),
            },
        );
        slow.request_timeout_seconds = Some(1);
        let queue = spawn_queue("sh", slow);

        let err = queue.execute("never answered".to_string()).await.unwrap_err();
        assert!(matches!(err, ExecError::ExecutionTimeout { .. }));

        // The hung process was killed; the next request gets a fresh one.
        let err = queue.execute("still hung".to_string()).await.unwrap_err();
        assert!(matches!(err, ExecError::ExecutionTimeout { .. }));
    }

    #[tokio::test]
    async fn prompt_mode_round_trip() {
        let script = r#"printf "$ "; while read l; do echo "got $l"; printf "$ "; done"#;
        let queue = spawn_queue(
            "sh",
            meta(
                "sh",
                &["-c", script],
                CompletionPolicy::Prompt {
                    marker: "$ ".to_string(),
                },
            ),
        );

        let first = queue.execute("ping".to_string()).await.unwrap();
        assert_eq!(first.stdout, "got ping\n");

        let second = queue.execute("pong".to_string()).await.unwrap();
        assert_eq!(second.stdout, "got pong\n");
    }

    #[tokio::test]
    async fn abandoned_queued_request_is_skipped() {
        let queue = spawn_queue("cat", cat_meta(100));

        let first = queue.execute("first".to_string()).await.unwrap();
        assert_eq!(first.stdout, "first\n");

        // Submit a request whose caller is already gone.
        let (reply, response) = oneshot::channel();
        drop(response);
        queue
            .tx
            .send(Submission {
                source: "abandoned".to_string(),
                reply,
            })
            .await
            .unwrap();

        let third = queue.execute("third".to_string()).await.unwrap();
        assert_eq!(third.stdout, "third\n");
    }

    // Requires a real python on PATH; run with `cargo test -- --ignored`.
    #[tokio::test]
    #[ignore = "requires python on PATH"]
    async fn python_session_round_trips() {
        let queue = spawn_queue(
            "python",
            meta(
                "python",
                &["-u", "-i"],
                CompletionPolicy::Idle { quiet_ms: 200 },
            ),
        );

        let sum = queue.execute("print(1+1)".to_string()).await.unwrap();
        assert!(sum.stdout.contains('2'));

        let div = queue.execute("1/0".to_string()).await.unwrap();
        assert!(div.stderr.contains("ZeroDivisionError"));
        assert!(!div.stdout.contains('2'));
    }
}
