//! Run lifecycle: the state machine, suspension policies, and the controller
//! that drives agents through them.

mod controller;
mod policy;
mod state;

pub use controller::{IfExists, RunController, RunStream, StartRequest};
pub use policy::{AnswerPolicy, DEFAULT_QUESTION, PromptPolicy};
pub use state::{PendingQuestion, Run, RunSnapshot, RunState};
