//! Error taxonomy for the bridge.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Coarse classification of a [`BridgeError`], used by callers to pick a
/// recovery policy (fix config, retry start, restart the bridge, wait and
/// retry, or report the engine's answer).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad paths or settings; nothing was spawned.
    Configuration,
    /// The child was spawned but never completed the ready handshake.
    Startup,
    /// Writing, reading or parsing failed, or the child is gone.
    Transport,
    /// The engine answered `ok: false`.
    Protocol,
    /// No response arrived within the deadline.
    Timeout,
}

/// Errors produced by the bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// A required directory or file does not exist.
    #[error("{what} not found: {}", .path.display())]
    MissingPath { what: &'static str, path: PathBuf },

    /// A configuration value could not be parsed.
    #[error("invalid value for {key}: {value:?} ({reason})")]
    InvalidConfig {
        key: &'static str,
        value: String,
        reason: String,
    },

    /// The interpreter could not be launched.
    #[error("failed to spawn bridge subprocess '{executable}': {source}")]
    Spawn {
        executable: String,
        #[source]
        source: std::io::Error,
    },

    /// A piped standard stream was not available after spawn.
    #[error("failed to capture subprocess {0}")]
    MissingPipe(&'static str),

    /// The child closed stdout before writing its ready line.
    #[error("bridge subprocess did not produce any output")]
    NoOutput,

    /// The child wrote nothing within the startup timeout.
    #[error("bridge subprocess did not produce any output within {}s", .timeout.as_secs_f64())]
    StartupTimeout { timeout: Duration },

    /// The first line was not JSON.
    #[error("bridge ready message was not valid JSON: {line:?}")]
    InvalidReady {
        line: String,
        #[source]
        source: serde_json::Error,
    },

    /// The first line was JSON but not a truthy `ready`.
    #[error("unexpected ready message: {0}")]
    UnexpectedReady(String),

    /// The child has exited (or was never installed).
    #[error("subprocess is not running")]
    NotRunning,

    /// The request could not be serialized.
    #[error("failed to encode request for command '{command}': {source}")]
    Encode {
        command: String,
        #[source]
        source: serde_json::Error,
    },

    /// Writing the request line to the child's stdin failed.
    #[error("failed to write to bridge: {0}")]
    Write(#[source] std::io::Error),

    /// An earlier request was cancelled part-way through its write, so the
    /// child's stdin no longer starts on a line boundary.
    #[error("an earlier request was only partly written; the bridge must be restarted")]
    PartialWrite,

    /// Stdout reached end-of-stream while a response was pending.
    #[error("bridge subprocess exited while command '{command}' was pending")]
    ChildExited { command: String },

    /// The response line was not JSON.
    #[error("invalid JSON response: {line:?}")]
    InvalidResponse {
        line: String,
        #[source]
        source: serde_json::Error,
    },

    /// The response line was JSON but not an object.
    #[error("response is not a JSON object: {line:?}")]
    NotAnEnvelope { line: String },

    /// The response carried a `result` that is not an object.
    #[error("command '{command}' returned a non-object result: {found}")]
    UnexpectedResult { command: String, found: String },

    /// The engine answered `ok: false`; the message is passed through verbatim.
    #[error("{0}")]
    Remote(String),

    /// No response within the deadline. The request is now orphaned.
    #[error("command '{command}' timed out after {}s", .timeout.as_secs_f64())]
    Timeout { command: String, timeout: Duration },
}

impl BridgeError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingPath { .. } | Self::InvalidConfig { .. } => ErrorKind::Configuration,
            Self::Spawn { .. }
            | Self::MissingPipe(_)
            | Self::NoOutput
            | Self::StartupTimeout { .. }
            | Self::InvalidReady { .. }
            | Self::UnexpectedReady(_) => ErrorKind::Startup,
            Self::NotRunning
            | Self::Encode { .. }
            | Self::Write(_)
            | Self::PartialWrite
            | Self::ChildExited { .. }
            | Self::InvalidResponse { .. }
            | Self::NotAnEnvelope { .. }
            | Self::UnexpectedResult { .. } => ErrorKind::Transport,
            Self::Remote(_) => ErrorKind::Protocol,
            Self::Timeout { .. } => ErrorKind::Timeout,
        }
    }

    /// True for the timeout kind.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// True when the error means the child can no longer serve requests.
    pub(crate) fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::NotRunning | Self::Write(_) | Self::PartialWrite | Self::ChildExited { .. }
        )
    }
}
