use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::manifest::BurnState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    Command,
    Status,
    Acknowledgement,
    Data,
}

impl fmt::Display for SignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SignalType::Command => "command",
            SignalType::Status => "status",
            SignalType::Acknowledgement => "acknowledgement",
            SignalType::Data => "data",
        };
        f.write_str(name)
    }
}

/// `Outbound` envelopes are emitted by the executor, `Inbound` ones by the initiator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Outbound,
    Inbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandAction {
    Cancel,
}

/// Signal body, tagged by its type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalPayload {
    Command {
        action: CommandAction,
        job_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<String>,
    },
    Status {
        job_id: String,
        state: BurnState,
        progress: u8,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<String>,
    },
    Acknowledgement {
        job_id: String,
        /// What is being acknowledged, e.g. `"cancel"`.
        of: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<String>,
    },
    Data {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        job_id: Option<String>,
        body: serde_json::Value,
    },
}

impl SignalPayload {
    pub fn cancel(job_id: impl Into<String>) -> Self {
        SignalPayload::Command {
            action: CommandAction::Cancel,
            job_id: job_id.into(),
            source: None,
        }
    }

    pub fn signal_type(&self) -> SignalType {
        match self {
            SignalPayload::Command { .. } => SignalType::Command,
            SignalPayload::Status { .. } => SignalType::Status,
            SignalPayload::Acknowledgement { .. } => SignalType::Acknowledgement,
            SignalPayload::Data { .. } => SignalType::Data,
        }
    }

    pub fn job_id(&self) -> Option<&str> {
        match self {
            SignalPayload::Command { job_id, .. }
            | SignalPayload::Status { job_id, .. }
            | SignalPayload::Acknowledgement { job_id, .. } => Some(job_id),
            SignalPayload::Data { job_id, .. } => job_id.as_deref(),
        }
    }

    /// Source identifier embedded in the payload itself, if any.
    pub fn source(&self) -> Option<&str> {
        match self {
            SignalPayload::Command { source, .. }
            | SignalPayload::Status { source, .. }
            | SignalPayload::Acknowledgement { source, .. } => source.as_deref(),
            SignalPayload::Data { body, .. } => body.get("source").and_then(|v| v.as_str()),
        }
    }

    /// `Some(job_id)` when this is a cancel command.
    pub fn cancel_target(&self) -> Option<&str> {
        match self {
            SignalPayload::Command {
                action: CommandAction::Cancel,
                job_id,
                ..
            } => Some(job_id),
            _ => None,
        }
    }
}

/// One unit of inter-agent communication relayed through the store.
///
/// Never mutated after creation; `digest` covers the canonical form of `payload`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Random per-envelope id, used to spot duplicates.
    pub nonce: String,
    pub direction: Direction,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub payload: SignalPayload,
    pub digest: String,
}

impl Envelope {
    pub fn signal_type(&self) -> SignalType {
        self.payload.signal_type()
    }

    /// The declared source, falling back to one embedded in the payload.
    pub fn declared_source(&self) -> Option<&str> {
        self.source.as_deref().or_else(|| self.payload.source())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn payload_is_tagged_by_type() {
        let payload = SignalPayload::cancel("j1");
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(
            value,
            json!({"type": "command", "action": "cancel", "job_id": "j1"})
        );
        assert_eq!(payload.signal_type(), SignalType::Command);
        assert_eq!(payload.cancel_target(), Some("j1"));
    }

    #[test]
    fn embedded_source_from_data_body() {
        let payload = SignalPayload::Data {
            job_id: None,
            body: json!({"source": "burn-executor", "free_space_mb": 4200}),
        };
        assert_eq!(payload.source(), Some("burn-executor"));
        assert_eq!(payload.job_id(), None);
        assert_eq!(payload.cancel_target(), None);
    }

    #[test]
    fn status_payload_parses() {
        let payload: SignalPayload = serde_json::from_value(json!({
            "type": "status",
            "job_id": "j1",
            "state": "burning",
            "progress": 50
        }))
        .unwrap();
        assert_eq!(payload.signal_type(), SignalType::Status);
        assert_eq!(payload.job_id(), Some("j1"));
    }
}
