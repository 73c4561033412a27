//! Output-to-request correlation for an unframed interpreter stream.
//!
//! An interactive interpreter writes responses with no message boundaries, so
//! the router holds at most one pending correlation at a time and attributes
//! every arriving chunk to it. Completion is detected either by the
//! interpreter's own prompt or by a configured quiet period with no output.

use std::sync::Arc;

use tokio::sync::{oneshot, Mutex};
use tokio::time::{sleep_until, Duration, Instant};
use tracing::{debug, trace};

use crate::config::CompletionPolicy;
use crate::error::ExecError;

/// Which pipe a chunk arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// Output accumulated for one request, one buffer per pipe.
#[derive(Debug, Default)]
pub struct Captured {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl Captured {
    /// Convert both buffers to text, replacing invalid UTF-8.
    pub fn into_text(self) -> (String, String) {
        (
            String::from_utf8_lossy(&self.stdout).into_owned(),
            String::from_utf8_lossy(&self.stderr).into_owned(),
        )
    }
}

/// The single in-flight correlation: buffers plus the completion channel back
/// to the dispatching queue.
struct Correlation {
    id: u64,
    policy: CompletionPolicy,
    captured: Captured,
    last_activity: Instant,
    done: oneshot::Sender<Captured>,
}

/// One-slot correlation router for a single interpreter process.
///
/// Clones share the slot; the supervisor's pump tasks feed [`ingest`] while
/// the execution queue drives [`attach`]/[`detach`]. Each supervisor
/// generation gets a fresh router so a dying process cannot write into its
/// successor's correlations.
///
/// [`ingest`]: OutputRouter::ingest
/// [`attach`]: OutputRouter::attach
/// [`detach`]: OutputRouter::detach
#[derive(Clone, Default)]
pub struct OutputRouter {
    slot: Arc<Mutex<Option<Correlation>>>,
}

impl OutputRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin accumulating output for request `id` under the given completion
    /// policy. Returns the receiver resolved with the captured output once the
    /// policy declares the response complete.
    ///
    /// Fails with `RouterBusy` if a correlation is already attached; the
    /// caller must serialize dispatch.
    pub async fn attach(
        &self,
        id: u64,
        policy: CompletionPolicy,
    ) -> Result<oneshot::Receiver<Captured>, ExecError> {
        let quiet = policy.quiet_period();
        let mut slot = self.slot.lock().await;
        if slot.is_some() {
            return Err(ExecError::RouterBusy);
        }
        let (done, rx) = oneshot::channel();
        *slot = Some(Correlation {
            id,
            policy,
            captured: Captured::default(),
            last_activity: Instant::now(),
            done,
        });
        drop(slot);

        if let Some(quiet) = quiet {
            tokio::spawn(watch_idle(Arc::clone(&self.slot), id, quiet));
        }
        Ok(rx)
    }

    /// Append a chunk to the pending correlation's buffer for `kind`.
    ///
    /// Chunks arriving with no correlation attached (startup banner
    /// stragglers, output after an idle-timeout completion) are dropped.
    pub async fn ingest(&self, kind: StreamKind, chunk: &[u8]) {
        let mut slot = self.slot.lock().await;
        let Some(active) = slot.as_mut() else {
            debug!(stream = ?kind, bytes = chunk.len(), "Dropping output with no pending request");
            return;
        };

        active.last_activity = Instant::now();
        let id = active.id;
        let buf = match kind {
            StreamKind::Stdout => &mut active.captured.stdout,
            StreamKind::Stderr => &mut active.captured.stderr,
        };
        buf.extend_from_slice(chunk);

        // Prompt detection runs against the accumulated buffer so a marker
        // split across reads still matches.
        let prompt_seen = match &active.policy {
            CompletionPolicy::Prompt { marker } if buf.ends_with(marker.as_bytes()) => {
                let stripped = buf.len() - marker.len();
                buf.truncate(stripped);
                true
            }
            _ => false,
        };

        if prompt_seen {
            trace!(request = id, "Prompt seen, response complete");
            if let Some(correlation) = slot.take() {
                let _ = correlation.done.send(correlation.captured);
            }
        }
    }

    /// Reclaim the pending correlation, returning its partial buffers.
    ///
    /// Used when the interpreter exits or a request times out; the completion
    /// receiver observes the dropped sender.
    pub async fn detach(&self) -> Option<Captured> {
        let mut slot = self.slot.lock().await;
        slot.take().map(|correlation| {
            trace!(request = correlation.id, "Detached correlation");
            correlation.captured
        })
    }

    /// Whether a correlation is currently attached.
    pub async fn is_attached(&self) -> bool {
        self.slot.lock().await.is_some()
    }
}

/// Completes the correlation for `id` once no output has arrived for `quiet`.
///
/// Exits quietly if the correlation completed by prompt or was detached.
async fn watch_idle(slot: Arc<Mutex<Option<Correlation>>>, id: u64, quiet: Duration) {
    loop {
        let deadline = {
            let guard = slot.lock().await;
            match guard.as_ref() {
                Some(active) if active.id == id => active.last_activity + quiet,
                _ => return,
            }
        };

        if Instant::now() >= deadline {
            let correlation = {
                let mut guard = slot.lock().await;
                if guard.as_ref().is_some_and(|active| active.id == id) {
                    guard.take()
                } else {
                    None
                }
            };
            if let Some(correlation) = correlation {
                trace!(request = id, "Quiet period elapsed, response complete");
                let _ = correlation.done.send(correlation.captured);
            }
            return;
        }

        sleep_until(deadline).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    fn idle(quiet_ms: u64) -> CompletionPolicy {
        CompletionPolicy::Idle { quiet_ms }
    }

    fn prompt(marker: &str) -> CompletionPolicy {
        CompletionPolicy::Prompt {
            marker: marker.to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn idle_completion_after_quiet_period() {
        let router = OutputRouter::new();
        let rx = router.attach(1, idle(200)).await.unwrap();

        router.ingest(StreamKind::Stdout, b"2\n").await;

        let captured = rx.await.unwrap();
        assert_eq!(captured.stdout, b"2\n");
        assert!(captured.stderr.is_empty());
        assert!(!router.is_attached().await);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_request_completes_empty() {
        let router = OutputRouter::new();
        let rx = router.attach(1, idle(200)).await.unwrap();

        let captured = rx.await.unwrap();
        assert!(captured.stdout.is_empty());
        assert!(captured.stderr.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn close_bursts_form_one_response() {
        let router = OutputRouter::new();
        let rx = router.attach(1, idle(200)).await.unwrap();

        router.ingest(StreamKind::Stdout, b"first").await;
        advance(Duration::from_millis(50)).await;
        router.ingest(StreamKind::Stdout, b"second").await;

        let captured = rx.await.unwrap();
        assert_eq!(captured.stdout, b"firstsecond");
    }

    #[tokio::test(start_paused = true)]
    async fn late_burst_is_not_part_of_the_response() {
        let router = OutputRouter::new();
        let rx = router.attach(1, idle(200)).await.unwrap();

        router.ingest(StreamKind::Stdout, b"first").await;
        advance(Duration::from_millis(250)).await;

        let captured = rx.await.unwrap();
        assert_eq!(captured.stdout, b"first");

        // The second burst finds no correlation and is dropped.
        router.ingest(StreamKind::Stdout, b"second").await;
        assert!(!router.is_attached().await);
    }

    #[tokio::test(start_paused = true)]
    async fn stderr_and_stdout_are_kept_separate() {
        let router = OutputRouter::new();
        let rx = router.attach(1, idle(100)).await.unwrap();

        router.ingest(StreamKind::Stdout, b"out").await;
        router.ingest(StreamKind::Stderr, b"err").await;

        let (stdout, stderr) = rx.await.unwrap().into_text();
        assert_eq!(stdout, "out");
        assert_eq!(stderr, "err");
    }

    #[tokio::test]
    async fn second_attach_is_rejected() {
        let router = OutputRouter::new();
        let _rx = router.attach(1, prompt(">>> ")).await.unwrap();

        let err = router.attach(2, prompt(">>> ")).await.unwrap_err();
        assert!(matches!(err, ExecError::RouterBusy));
    }

    #[tokio::test]
    async fn prompt_completes_and_is_stripped() {
        let router = OutputRouter::new();
        let rx = router.attach(1, prompt(">>> ")).await.unwrap();

        router.ingest(StreamKind::Stdout, b"2\n>>> ").await;

        let captured = rx.await.unwrap();
        assert_eq!(captured.stdout, b"2\n");
        assert!(!router.is_attached().await);
    }

    #[tokio::test]
    async fn prompt_split_across_chunks_still_matches() {
        let router = OutputRouter::new();
        let rx = router.attach(1, prompt(">>> ")).await.unwrap();

        router.ingest(StreamKind::Stdout, b"2\n>>").await;
        router.ingest(StreamKind::Stdout, b"> ").await;

        let captured = rx.await.unwrap();
        assert_eq!(captured.stdout, b"2\n");
    }

    #[tokio::test]
    async fn prompt_on_stderr_completes() {
        // Python's interactive prompt goes to stderr.
        let router = OutputRouter::new();
        let rx = router.attach(1, prompt(">>> ")).await.unwrap();

        router.ingest(StreamKind::Stdout, b"2\n").await;
        router.ingest(StreamKind::Stderr, b">>> ").await;

        let (stdout, stderr) = rx.await.unwrap().into_text();
        assert_eq!(stdout, "2\n");
        assert_eq!(stderr, "");
    }

    #[tokio::test]
    async fn detach_returns_partial_output() {
        let router = OutputRouter::new();
        let rx = router.attach(1, prompt(">>> ")).await.unwrap();

        router.ingest(StreamKind::Stdout, b"partial").await;
        router.ingest(StreamKind::Stderr, b"boom").await;

        let captured = router.detach().await.unwrap();
        assert_eq!(captured.stdout, b"partial");
        assert_eq!(captured.stderr, b"boom");
        assert!(!router.is_attached().await);

        // The completion channel observes the dropped sender.
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn unattributed_output_is_dropped() {
        let router = OutputRouter::new();
        router.ingest(StreamKind::Stdout, b"banner noise").await;

        let rx = router.attach(1, prompt("$ ")).await.unwrap();
        router.ingest(StreamKind::Stdout, b"real$ ").await;

        let captured = rx.await.unwrap();
        assert_eq!(captured.stdout, b"real");
    }
}
