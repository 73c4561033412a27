//! Interpreter and gateway configuration.
//!
//! Sources, in precedence order: a JSON file passed via `--config`, inline
//! JSON in the `INTERP_RPC_CONFIG` environment variable, and compiled-in
//! presets for `python` and `octave`.
//!
//! A sandboxed deployment points the interpreter at a sandbox wrapper and
//! extends its module search path into the sandbox root:
//!
//! ```json
//! {
//!   "interpreters": {
//!     "python": {
//!       "program": "python",
//!       "args": ["-u", "-i", "/usr/local/bin/pypy_interact.py",
//!                "/opt/pypy-sandbox/pypy/goal/pypy-c -u -i"],
//!       "sandbox_path": { "var": "PYTHONPATH", "dir": "/opt/pypy-sandbox/" }
//!     }
//!   }
//! }
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, info};

/// Environment variable holding inline JSON configuration.
pub const CONFIG_ENV_VAR: &str = "INTERP_RPC_CONFIG";

/// Top-level configuration for the daemon.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Available interpreters, keyed by language name.
    pub interpreters: HashMap<String, InterpreterMeta>,

    /// RPC gateway settings.
    #[serde(default)]
    pub gateway: GatewayConfig,
}

/// RPC gateway settings.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Address the gateway listens on.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

/// Launch and lifecycle settings for a single interpreter.
#[derive(Debug, Clone, Deserialize)]
pub struct InterpreterMeta {
    /// Interpreter binary name or path.
    pub program: String,

    /// Arguments selecting quiet/interactive mode.
    #[serde(default)]
    pub args: Vec<String>,

    /// Environment variable extended with the sandbox root at spawn time.
    #[serde(default)]
    pub sandbox_path: Option<SandboxPath>,

    /// How the end of a response is detected on the output streams.
    #[serde(default)]
    pub completion: CompletionPolicy,

    /// Maximum time to wait for the interpreter to settle after spawn
    /// (banner/first prompt drained) before the launch counts as failed.
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_seconds: u64,

    /// Optional cap on a single request's execution time. When it elapses the
    /// request fails and the interpreter is killed, since a fragment may still
    /// be running inside it.
    #[serde(default)]
    pub request_timeout_seconds: Option<u64>,

    /// Restart budget applied by the execution queue after crashes.
    #[serde(default)]
    pub restart: RestartPolicy,
}

impl InterpreterMeta {
    pub const fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_seconds)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_seconds.map(Duration::from_secs)
    }
}

/// A search-path extension confining the interpreter to a sandbox root.
///
/// The directory is appended to the variable's existing value (path-separator
/// joined) rather than replacing it.
#[derive(Debug, Clone, Deserialize)]
pub struct SandboxPath {
    /// Variable name, e.g. `PYTHONPATH`.
    pub var: String,

    /// Sandbox root directory appended to the variable.
    pub dir: String,
}

/// End-of-response detection policy.
///
/// Interactive interpreters emit no message boundaries, so completion is
/// inferred either from the interpreter's own prompt or from a quiet period
/// with no output.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum CompletionPolicy {
    /// No output for `quiet_ms` means the response is complete. A burst
    /// followed by silence longer than the quiet period is taken as the whole
    /// response even if the interpreter writes again later.
    Idle {
        #[serde(default = "default_quiet_ms")]
        quiet_ms: u64,
    },

    /// The interpreter writes `marker` (its prompt) when ready for the next
    /// fragment. Matched against the tail of either stream and stripped from
    /// the captured output.
    Prompt { marker: String },
}

impl CompletionPolicy {
    pub const fn quiet_period(&self) -> Option<Duration> {
        match self {
            Self::Idle { quiet_ms } => Some(Duration::from_millis(*quiet_ms)),
            Self::Prompt { .. } => None,
        }
    }
}

impl Default for CompletionPolicy {
    fn default() -> Self {
        Self::Idle {
            quiet_ms: default_quiet_ms(),
        }
    }
}

/// Restart budget for a crashed interpreter.
///
/// Consecutive failures (crash while serving, failed launch) count against
/// `max_attempts`; a completed request resets the count. Once exhausted the
/// language is marked unavailable and stays that way.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RestartPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base backoff before a restart attempt, scaled by the failure count.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

impl RestartPolicy {
    pub fn backoff(&self, failures: u32) -> Duration {
        Duration::from_millis(self.backoff_ms.saturating_mul(u64::from(failures)))
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

impl Config {
    /// Load configuration from the highest-precedence available source.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            let config: Self = serde_json::from_str(&text)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?;
            info!(path = %path.display(), "Loaded configuration from file");
            return Ok(config);
        }

        if let Ok(json) = std::env::var(CONFIG_ENV_VAR) {
            let config: Self = serde_json::from_str(&json)
                .with_context(|| format!("Failed to parse {CONFIG_ENV_VAR}"))?;
            info!("Loaded configuration from {CONFIG_ENV_VAR}");
            return Ok(config);
        }

        debug!("No configuration source found, using compiled presets");
        Ok(Self::presets())
    }

    /// Compiled-in interpreter presets: plain interactive `python` and
    /// `octave` on `$PATH`, idle-timeout completion, default gateway address.
    pub fn presets() -> Self {
        let mut interpreters = HashMap::new();
        interpreters.insert(
            "python".to_string(),
            InterpreterMeta {
                program: "python".to_string(),
                args: vec!["-u".to_string(), "-i".to_string()],
                sandbox_path: None,
                completion: CompletionPolicy::default(),
                ready_timeout_seconds: default_ready_timeout(),
                request_timeout_seconds: None,
                restart: RestartPolicy::default(),
            },
        );
        interpreters.insert(
            "octave".to_string(),
            InterpreterMeta {
                program: "octave".to_string(),
                args: vec!["-q".to_string(), "-i".to_string(), "-W".to_string()],
                sandbox_path: None,
                completion: CompletionPolicy::default(),
                ready_timeout_seconds: default_ready_timeout(),
                request_timeout_seconds: None,
                restart: RestartPolicy::default(),
            },
        );

        Self {
            interpreters,
            gateway: GatewayConfig::default(),
        }
    }

    /// Create a config from a JSON string (for testing).
    #[cfg(test)]
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Failed to parse JSON")?;
        Ok(config)
    }
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8085))
}

const fn default_quiet_ms() -> u64 {
    200
}

const fn default_ready_timeout() -> u64 {
    10
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_backoff_ms() -> u64 {
    250
}
