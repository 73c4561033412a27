//! Failure kinds for the execution tier.
//!
//! Process-level failures are handled next to the interpreter and translated
//! into per-request errors; nothing here crosses the RPC boundary as an
//! unhandled fault.

use thiserror::Error;

/// Everything that can go wrong between enqueue and completion.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The interpreter binary could not be spawned.
    #[error("failed to launch {program}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// A write was attempted against a process that is not running.
    #[error("interpreter is not running")]
    NotRunning,

    /// A second correlation was attached while one was still active.
    /// Indicates a serialization bug in the caller, not a user condition.
    #[error("output router already has an active correlation")]
    RouterBusy,

    /// The interpreter exited while this request was outstanding. Carries
    /// whatever output was captured before the exit.
    #[error("interpreter exited during execution")]
    InterpreterCrashed {
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    /// The restart budget for this language is exhausted; requests fail fast
    /// until the daemon is restarted.
    #[error("interpreter for {lang:?} is unavailable")]
    ServiceUnavailable { lang: String },

    /// The configured per-request execution time elapsed. The interpreter was
    /// killed, since the fragment may still have been running inside it.
    #[error("execution timed out")]
    ExecutionTimeout { stdout: String, stderr: String },

    /// No interpreter is configured under the requested language name.
    #[error("unknown language {lang:?}")]
    UnknownLanguage { lang: String },
}

impl ExecError {
    /// Output captured before the failure, where the kind carries any.
    pub fn partial_output(&self) -> (&str, &str) {
        match self {
            Self::InterpreterCrashed { stdout, stderr, .. }
            | Self::ExecutionTimeout { stdout, stderr } => (stdout, stderr),
            _ => ("", ""),
        }
    }
}
