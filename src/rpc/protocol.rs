//! Gateway protocol message types.
//!
//! Length-prefixed JSON protocol between the web tier and the daemon.
//! Messages are framed as: [4-byte BE length][JSON payload]

use serde::{Deserialize, Serialize};

use crate::error::ExecError;
use crate::queue::ExecOutcome;

/// Request sent from the web tier to the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayRequest {
    /// Run a source fragment in the named language's interpreter.
    Execute { id: u64, lang: String, data: String },
    /// Health check.
    Ping,
}

/// Response sent from the gateway to the web tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayResponse {
    /// The gateway accepts requests on this connection (sent once on
    /// connect).
    Ready,
    /// Execution finished. The output is exactly what the interpreter wrote
    /// for this fragment, nothing from its neighbours.
    Result {
        id: u64,
        stdout: String,
        stderr: String,
        exited_during_execution: bool,
    },
    /// Execution failed. The output fields carry whatever was captured
    /// before the failure.
    Error {
        id: u64,
        kind: ErrorKind,
        message: String,
        stdout: String,
        stderr: String,
    },
    /// Pong response to health check.
    Pong,
}

/// Wire tag classifying a failed execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnknownLanguage,
    InterpreterCrashed,
    ServiceUnavailable,
    ExecutionTimeout,
    /// A daemon-side fault the caller cannot act on.
    Internal,
}

impl From<&ExecError> for ErrorKind {
    fn from(err: &ExecError) -> Self {
        match err {
            ExecError::UnknownLanguage { .. } => Self::UnknownLanguage,
            ExecError::InterpreterCrashed { .. } => Self::InterpreterCrashed,
            ExecError::ServiceUnavailable { .. } => Self::ServiceUnavailable,
            ExecError::ExecutionTimeout { .. } => Self::ExecutionTimeout,
            ExecError::Launch { .. } | ExecError::NotRunning | ExecError::RouterBusy => {
                Self::Internal
            }
        }
    }
}

impl GatewayResponse {
    /// The reply frame for one finished execution.
    pub fn from_outcome(id: u64, outcome: ExecOutcome) -> Self {
        match outcome {
            Ok(result) => Self::Result {
                id,
                stdout: result.stdout,
                stderr: result.stderr,
                exited_during_execution: result.exited_during_execution,
            },
            Err(err) => {
                let (stdout, stderr) = err.partial_output();
                let (stdout, stderr) = (stdout.to_string(), stderr.to_string());
                Self::Error {
                    id,
                    kind: ErrorKind::from(&err),
                    message: err.to_string(),
                    stdout,
                    stderr,
                }
            }
        }
    }
}
