//! Envelope encoder.
//!
//! Every envelope becomes exactly three lines: `event: <kind>`, `data: <json>`
//! and a blank terminator. JSON never contains a raw newline, so the data
//! always fits on one line.

use chrono::{SecondsFormat, Utc};
use serde::Serialize;

use super::envelope::{Envelope, EventKind};
use crate::error::CodecError;

/// Encode one envelope into its wire frame.
pub fn encode(envelope: &Envelope) -> Result<String, CodecError> {
    match envelope {
        Envelope::Update(data) => encode_frame(EventKind::Update, data),
        Envelope::Interrupt(data) => encode_frame(EventKind::Interrupt, data),
        Envelope::Error(data) => encode_frame(EventKind::Error, data),
    }
}

/// Encode an arbitrary serializable body under `kind`.
pub fn encode_frame<T>(kind: EventKind, data: &T) -> Result<String, CodecError>
where
    T: Serialize + ?Sized,
{
    let json =
        serde_json::to_string(data).map_err(|source| CodecError::Encoding { kind, source })?;
    Ok(format!("event: {kind}\ndata: {json}\n\n"))
}

/// Build an `error` frame without going through fallible serialization.
///
/// Used when encoding the real envelope failed and the stream still has to
/// tell the consumer that the run is over.
#[must_use]
pub fn error_frame(run_id: &str, message: &str, code: &str) -> String {
    let data = serde_json::json!({
        "run_id": run_id,
        "message": message,
        "code": code,
        "emitted_at": Utc::now().to_rfc3339_opts(SecondsFormat::AutoSi, true),
    });
    format!("event: {}\ndata: {data}\n\n", EventKind::Error)
}
