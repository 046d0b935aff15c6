//! Incremental line-event decoder.
//!
//! Bytes may arrive split anywhere, including inside a multi-byte character.
//! Complete lines are accumulated until a blank line terminates the envelope.
//! One decoder serves exactly one stream.

use std::mem;

use futures::{Stream, StreamExt};

use super::envelope::{Envelope, EventKind};
use crate::error::DecodeError;

/// Code attached to the synthetic envelope emitted for a truncated stream.
pub const TRUNCATED_CODE: &str = "truncated_stream";

/// Stateful decoder for a single event stream.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buf: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
    pending_lines: usize,
    last_run_id: String,
}

impl LineDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes and collect every envelope they complete.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<Envelope, DecodeError>> {
        // Only the appended bytes can hold a new terminator.
        let mut scan_from = self.buf.len();
        self.buf.extend_from_slice(chunk);
        let mut buf = mem::take(&mut self.buf);
        let mut out = Vec::new();
        let mut consumed = 0;

        while let Some(len) = buf[scan_from..].iter().position(|b| *b == b'\n') {
            let end = scan_from + len;
            match std::str::from_utf8(&buf[consumed..end]) {
                Ok(line) => {
                    if let Some(decoded) = self.push_line(line.trim_end_matches('\r')) {
                        out.push(decoded);
                    }
                }
                Err(_) => {
                    self.reset();
                    out.push(Err(DecodeError::InvalidUtf8));
                }
            }
            consumed = end + 1;
            scan_from = consumed;
        }

        buf.drain(..consumed);
        self.buf = buf;
        out
    }

    /// Feed one complete line (without its terminator).
    ///
    /// Returns an envelope when `line` is the blank terminator of a
    /// non-empty accumulation.
    pub fn push_line(&mut self, line: &str) -> Option<Result<Envelope, DecodeError>> {
        if line.is_empty() {
            return (self.pending_lines > 0).then(|| self.flush());
        }

        // Comments double as keep-alives.
        if line.starts_with(':') {
            return None;
        }

        let Some((key, value)) = line.split_once(':') else {
            tracing::trace!(line, "ignoring stray line");
            return None;
        };
        let value = value.strip_prefix(' ').unwrap_or(value);

        match key {
            "event" => {
                self.event = Some(value.to_string());
                self.pending_lines += 1;
            }
            "data" => {
                self.data.push(value.to_string());
                self.pending_lines += 1;
            }
            _ => tracing::trace!(key, "ignoring unknown field"),
        }
        None
    }

    /// Close the session.
    ///
    /// A stream that stopped mid-envelope, or inside an undecodable line,
    /// yields a synthetic `error` envelope instead of dropping what was
    /// accumulated.
    pub fn finish(&mut self) -> Option<Envelope> {
        if !self.buf.is_empty() {
            let rest = mem::take(&mut self.buf);
            match std::str::from_utf8(&rest) {
                Ok(line) => {
                    let line = line.trim_end_matches('\r');
                    if !line.is_empty() {
                        // A non-blank line can only accumulate, never complete.
                        let _ = self.push_line(line);
                    }
                }
                Err(_) => self.pending_lines += 1,
            }
        }

        if self.pending_lines == 0 {
            return None;
        }

        let err = DecodeError::Truncated {
            pending_lines: self.pending_lines,
        };
        self.reset();
        Some(Envelope::error(
            self.last_run_id.clone(),
            err.to_string(),
            Some(TRUNCATED_CODE),
        ))
    }

    fn flush(&mut self) -> Result<Envelope, DecodeError> {
        let event = self.event.take();
        let data = mem::take(&mut self.data);
        self.pending_lines = 0;

        let kind: EventKind = event.ok_or(DecodeError::MissingField("event"))?.parse()?;
        if data.is_empty() {
            return Err(DecodeError::MissingField("data"));
        }
        let data = data.join("\n");

        let malformed = |source| DecodeError::MalformedData { kind, source };
        let envelope = match kind {
            EventKind::Update => Envelope::Update(serde_json::from_str(&data).map_err(malformed)?),
            EventKind::Interrupt => {
                Envelope::Interrupt(serde_json::from_str(&data).map_err(malformed)?)
            }
            EventKind::Error => Envelope::Error(serde_json::from_str(&data).map_err(malformed)?),
        };

        if !envelope.run_id().is_empty() {
            self.last_run_id = envelope.run_id().to_string();
        }
        Ok(envelope)
    }

    fn reset(&mut self) {
        self.event = None;
        self.data.clear();
        self.pending_lines = 0;
    }
}

/// Decode a byte stream into envelopes, lazily and in order.
pub fn decode_stream<S, B, E>(bytes: S) -> impl Stream<Item = Result<Envelope, DecodeError>> + Send
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    async_stream::stream! {
        let mut decoder = LineDecoder::new();
        futures::pin_mut!(bytes);

        while let Some(chunk) = bytes.next().await {
            match chunk {
                Ok(chunk) => {
                    for decoded in decoder.push(chunk.as_ref()) {
                        yield decoded;
                    }
                }
                Err(e) => {
                    yield Err(DecodeError::Transport(e.to_string()));
                    return;
                }
            }
        }

        if let Some(envelope) = decoder.finish() {
            yield Ok(envelope);
        }
    }
}
