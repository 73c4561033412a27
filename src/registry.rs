//! One execution queue per configured language, spawned on first use.
//!
//! The registry is the daemon's root object: the gateway resolves each
//! request's language here and the returned queue serializes it against the
//! long-lived interpreter. Queues are never torn down between requests; a
//! language stays warm until the daemon shuts down or its restart budget
//! runs out.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::ExecError;
use crate::queue::{ExecOutcome, ExecutionQueue};

/// Runs one source fragment against the named language's interpreter.
///
/// The gateway is written against this seam so connection handling can be
/// tested without spawning real interpreter processes.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, lang: &str, source: &str) -> ExecOutcome;
}

/// How long `shutdown` waits for a worker to drain before abandoning it.
const WORKER_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

struct QueueEntry {
    queue: ExecutionQueue,
    worker: JoinHandle<()>,
}

/// Lazily spawns and hands out the per-language execution queues.
pub struct InterpreterRegistry {
    config: Config,
    /// `None` once `shutdown` has run; late callers get `ServiceUnavailable`.
    queues: RwLock<Option<HashMap<String, QueueEntry>>>,
}

impl InterpreterRegistry {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            queues: RwLock::new(Some(HashMap::new())),
        }
    }

    /// The languages this registry can serve, sorted for stable logs.
    pub fn languages(&self) -> Vec<String> {
        let mut langs: Vec<String> = self.config.interpreters.keys().cloned().collect();
        langs.sort();
        langs
    }

    /// Get the queue for `lang`, spawning its worker on first use.
    async fn queue_for(&self, lang: &str) -> Result<ExecutionQueue, ExecError> {
        let Some(meta) = self.config.interpreters.get(lang) else {
            return Err(ExecError::UnknownLanguage {
                lang: lang.to_string(),
            });
        };

        // Fast path: read lock
        {
            let queues = self.queues.read().await;
            match queues.as_ref() {
                Some(map) => {
                    if let Some(entry) = map.get(lang) {
                        return Ok(entry.queue.clone());
                    }
                }
                None => return Err(closed(lang)),
            }
        }

        // Slow path: create under the write lock, re-checking for a racing
        // creator.
        let mut queues = self.queues.write().await;
        let Some(map) = queues.as_mut() else {
            return Err(closed(lang));
        };
        if let Some(entry) = map.get(lang) {
            return Ok(entry.queue.clone());
        }

        info!(lang = %lang, program = %meta.program, "Starting execution queue");
        let (queue, worker) = ExecutionQueue::spawn(lang.to_string(), meta.clone());
        map.insert(
            lang.to_string(),
            QueueEntry {
                queue: queue.clone(),
                worker,
            },
        );
        Ok(queue)
    }

    /// Stop every worker and kill its interpreter, leaving the registry
    /// closed.
    ///
    /// A request already in flight finishes within the grace period; queued
    /// work and anything submitted afterwards fails with
    /// `ServiceUnavailable`.
    pub async fn shutdown(&self) {
        let entries: Vec<(String, QueueEntry)> = {
            let mut queues = self.queues.write().await;
            match queues.take() {
                Some(map) => map.into_iter().collect(),
                None => return,
            }
        };

        for (lang, entry) in entries {
            info!(lang = %lang, "Stopping execution queue");
            drop(entry.queue);
            let mut worker = entry.worker;
            if timeout(WORKER_SHUTDOWN_GRACE, &mut worker).await.is_err() {
                warn!(lang = %lang, "Worker did not drain in time, aborting it");
                worker.abort();
            }
        }
    }
}

#[async_trait]
impl Executor for InterpreterRegistry {
    async fn execute(&self, lang: &str, source: &str) -> ExecOutcome {
        let queue = self.queue_for(lang).await?;
        queue.execute(source.to_string()).await
    }
}

fn closed(lang: &str) -> ExecError {
    ExecError::ServiceUnavailable {
        lang: lang.to_string(),
    }
}
