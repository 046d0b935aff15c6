//! Error taxonomy shared by the server and the caller side.

use thiserror::Error;

use crate::protocol::EventKind;
use crate::run::RunState;

/// Failure to turn an envelope into its wire representation.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The payload could not be serialized to JSON.
    #[error("failed to encode {kind} envelope: {source}")]
    Encoding {
        kind: EventKind,
        #[source]
        source: serde_json::Error,
    },
}

/// Failure to reconstruct an envelope from the line stream.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The `data:` line was not valid JSON for the announced kind.
    #[error("malformed `{kind}` data: {source}")]
    MalformedData {
        kind: EventKind,
        #[source]
        source: serde_json::Error,
    },

    /// A terminated envelope lacked its `event:` or `data:` line.
    #[error("envelope is missing its `{0}:` line")]
    MissingField(&'static str),

    /// The `event:` line named a kind outside the protocol.
    #[error("unknown event kind `{0}`")]
    UnknownKind(String),

    /// A complete line was not valid UTF-8.
    #[error("stream contained invalid UTF-8")]
    InvalidUtf8,

    /// The stream ended before the envelope terminator.
    #[error("stream ended mid-envelope ({pending_lines} unterminated line(s))")]
    Truncated { pending_lines: usize },

    /// The underlying byte stream failed.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Errors raised by the run lifecycle.
#[derive(Debug, Error)]
pub enum RunError {
    /// A history operation referenced a run that has no log.
    #[error("unknown run `{0}`")]
    UnknownRun(String),

    /// The continuation target is not known to the registry.
    #[error("run `{0}` not found")]
    NotFound(String),

    /// The run is not in a state that accepts the operation.
    #[error("run `{run_id}` is {state}")]
    InvalidState { run_id: String, state: RunState },

    /// An agent turn failed; the run is permanently failed.
    #[error("agent `{agent}` failed in run `{run_id}`: {message}")]
    AgentFailure {
        run_id: String,
        agent: String,
        message: String,
    },

    /// An envelope could not be encoded; the run is permanently failed.
    #[error(transparent)]
    Encoding(#[from] CodecError),

    /// The agent selector is not registered.
    #[error("unrecognized agent `{0}`")]
    UnknownAgent(String),

    /// The request was structurally invalid.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A thread with the requested id already exists.
    #[error("thread `{0}` already exists")]
    ThreadExists(String),
}

impl RunError {
    /// Stable machine-readable code used in error bodies and envelopes.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownRun(_) => "unknown_run",
            Self::NotFound(_) => "not_found",
            Self::InvalidState { .. } => "invalid_state",
            Self::AgentFailure { .. } => "agent_failure",
            Self::Encoding(_) => "encoding_error",
            Self::UnknownAgent(_) => "unknown_agent",
            Self::InvalidInput(_) => "invalid_input",
            Self::ThreadExists(_) => "thread_exists",
        }
    }
}
