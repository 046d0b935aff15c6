//! Event-stream protocol.
//!
//! A run talks to its caller through a totally ordered stream of
//! [`Envelope`]s. On the wire each envelope is:
//!
//! ```text
//! event: interrupt
//! data: {"run_id":"…","question":"…","emitted_at":"…"}
//!
//! ```
//!
//! - [`encode`] turns an envelope into that frame (pure, fallible).
//! - [`LineDecoder`] reassembles envelopes from arbitrarily chunked bytes.
//!
//! # Example
//!
//! ```rust
//! use hitl_relay::protocol::{Envelope, LineDecoder, encode};
//!
//! let frame = encode(&Envelope::interrupt("run-1", "Approve?")).unwrap();
//! let mut decoder = LineDecoder::new();
//! let decoded = decoder.push(frame.as_bytes());
//! assert_eq!(decoded[0].as_ref().unwrap().run_id(), "run-1");
//! ```

mod codec;
mod decoder;
mod envelope;

pub use codec::{encode, encode_frame, error_frame};
pub use decoder::{LineDecoder, TRUNCATED_CODE, decode_stream};
pub use envelope::{
    Envelope, ErrorData, EventKind, InterruptData, UpdateData, UpdateStatus,
};
