//! Wire-level unit of communication.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::conversation::Message;
use crate::error::DecodeError;

/// Discriminator carried on the `event:` line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// Incremental output.
    Update,
    /// The run suspended and waits for a human answer.
    Interrupt,
    /// The run failed, or the stream could not be decoded.
    Error,
}

impl EventKind {
    /// Wire name of the kind.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Update => "update",
            Self::Interrupt => "interrupt",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "update" => Ok(Self::Update),
            "interrupt" => Ok(Self::Interrupt),
            "error" => Ok(Self::Error),
            other => Err(DecodeError::UnknownKind(other.to_string())),
        }
    }
}

/// Progress marker carried by `update` envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateStatus {
    /// More output may follow.
    Running,
    /// The run reached a termination condition; this is the last envelope.
    Completed,
}

/// Data of an `update` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateData {
    #[serde(default)]
    pub run_id: String,
    pub messages: Vec<Message>,
    #[serde(default = "default_status")]
    pub status: UpdateStatus,
    #[serde(default = "Utc::now")]
    pub emitted_at: DateTime<Utc>,
}

fn default_status() -> UpdateStatus {
    UpdateStatus::Running
}

/// Data of an `interrupt` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterruptData {
    /// Run identifier to echo back on continuation.
    #[serde(default)]
    pub run_id: String,
    /// Text shown to the human.
    pub question: String,
    /// Acceptable answers when the question is constrained.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub choices: Vec<String>,
    /// The answer that was rejected, present on re-prompts only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejected_answer: Option<String>,
    #[serde(default = "Utc::now")]
    pub emitted_at: DateTime<Utc>,
}

/// Data of an `error` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorData {
    #[serde(default)]
    pub run_id: String,
    /// Human-readable failure description.
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default = "Utc::now")]
    pub emitted_at: DateTime<Utc>,
}

/// One typed, timestamped unit on the event stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Update(UpdateData),
    Interrupt(InterruptData),
    Error(ErrorData),
}

impl Envelope {
    /// An `update` carrying newly appended messages.
    #[must_use]
    pub fn update(run_id: impl Into<String>, messages: Vec<Message>, status: UpdateStatus) -> Self {
        Self::Update(UpdateData {
            run_id: run_id.into(),
            messages,
            status,
            emitted_at: Utc::now(),
        })
    }

    /// An `interrupt` asking the human `question`.
    #[must_use]
    pub fn interrupt(run_id: impl Into<String>, question: impl Into<String>) -> Self {
        Self::Interrupt(InterruptData {
            run_id: run_id.into(),
            question: question.into(),
            choices: Vec::new(),
            rejected_answer: None,
            emitted_at: Utc::now(),
        })
    }

    /// An `error` describing a failure.
    #[must_use]
    pub fn error(
        run_id: impl Into<String>,
        message: impl Into<String>,
        code: Option<&str>,
    ) -> Self {
        Self::Error(ErrorData {
            run_id: run_id.into(),
            message: message.into(),
            code: code.map(ToString::to_string),
            emitted_at: Utc::now(),
        })
    }

    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Update(_) => EventKind::Update,
            Self::Interrupt(_) => EventKind::Interrupt,
            Self::Error(_) => EventKind::Error,
        }
    }

    #[must_use]
    pub fn run_id(&self) -> &str {
        match self {
            Self::Update(d) => &d.run_id,
            Self::Interrupt(d) => &d.run_id,
            Self::Error(d) => &d.run_id,
        }
    }

    #[must_use]
    pub fn emitted_at(&self) -> DateTime<Utc> {
        match self {
            Self::Update(d) => d.emitted_at,
            Self::Interrupt(d) => d.emitted_at,
            Self::Error(d) => d.emitted_at,
        }
    }

    /// Whether no further envelope follows on this stream.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Update(d) => d.status == UpdateStatus::Completed,
            Self::Interrupt(_) | Self::Error(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_parses_only_protocol_names() {
        assert_eq!("interrupt".parse::<EventKind>().unwrap(), EventKind::Interrupt);
        assert!(matches!(
            "messages".parse::<EventKind>(),
            Err(DecodeError::UnknownKind(k)) if k == "messages"
        ));
    }

    #[test]
    fn interrupt_data_matches_wire_shape() {
        let Envelope::Interrupt(data) = Envelope::interrupt("r-1", "Approve?") else {
            unreachable!()
        };
        let json = serde_json::to_value(&data).unwrap();
        assert_eq!(json["run_id"], "r-1");
        assert_eq!(json["question"], "Approve?");
        assert!(json.get("choices").is_none());
        assert!(json.get("rejected_answer").is_none());
    }

    #[test]
    fn terminal_envelopes() {
        assert!(!Envelope::update("r", vec![], UpdateStatus::Running).is_terminal());
        assert!(Envelope::update("r", vec![], UpdateStatus::Completed).is_terminal());
        assert!(Envelope::interrupt("r", "q").is_terminal());
        assert!(Envelope::error("r", "boom", None).is_terminal());
    }
}
