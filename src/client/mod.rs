//! Caller side of the run protocol.
//!
//! - [`Client`]: HTTP client for the run API
//! - [`ResumeOrchestrator`]: follows a run across interrupts, asking a
//!   [`HumanInput`] for every answer
//! - [`RunTransport`]: what the orchestrator drives, either a remote server
//!   through [`Client`] or an in-process [`RunController`](crate::run::RunController)

mod error;
mod http;
mod orchestrator;

pub use error::{ClientError, Result};
pub use http::{Client, RunsApi, ThreadsApi};
pub use orchestrator::{
    ClientOutcome, DEFAULT_MAX_REJECTIONS, HumanInput, OutcomeStatus, Prompt, ResumeOrchestrator,
    RunTransport, StdinHuman,
};

use futures::stream::BoxStream;

use crate::error::DecodeError;
use crate::protocol::Envelope;

/// Decoded envelopes of one stream segment.
pub type EnvelopeStream = BoxStream<'static, std::result::Result<Envelope, DecodeError>>;
