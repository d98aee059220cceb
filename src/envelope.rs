//! Task envelope and the single decode step for queue payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::DecodeError;

/// Task kinds the router knows how to handle.
///
/// The wire names are shared with the producer side and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    NotifyTicketCreated,
    ProcessOverdueTickets,
    GenerateReport,
    ClearCache,
}

impl TaskKind {
    pub const ALL: [TaskKind; 4] = [
        TaskKind::NotifyTicketCreated,
        TaskKind::ProcessOverdueTickets,
        TaskKind::GenerateReport,
        TaskKind::ClearCache,
    ];

    /// Wire name of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::NotifyTicketCreated => "notify_ticket_created",
            TaskKind::ProcessOverdueTickets => "process_overdue_tickets",
            TaskKind::GenerateReport => "generate_report",
            TaskKind::ClearCache => "clear_cache",
        }
    }

    /// Look up a kind by wire name. Unknown names yield `None`.
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded queue entry.
///
/// Unknown top-level keys in the wire form are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    /// Selects the handler.
    pub kind: String,
    /// Handler arguments.
    #[serde(default)]
    pub fields: Map<String, Value>,
    /// When the producer enqueued the task, if it said so.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enqueued_at: Option<DateTime<Utc>>,
}

impl TaskEnvelope {
    /// Create an envelope with no fields, stamped with the current time.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            fields: Map::new(),
            enqueued_at: Some(Utc::now()),
        }
    }

    /// Add a field.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// The recognized kind, if any.
    pub fn task_kind(&self) -> Option<TaskKind> {
        TaskKind::parse(&self.kind)
    }

    /// A field as text. Numbers are rendered in their JSON form.
    pub fn field_text(&self, name: &str) -> Option<String> {
        match self.fields.get(name)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// A raw field value.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Serialize the envelope to its wire form.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Decode a queue payload into an envelope.
///
/// The payload is either an already-decoded structure or a JSON-encoded
/// string; anything else is a [`DecodeError`] carrying the payload text.
pub fn decode_payload(payload: &Value) -> Result<TaskEnvelope, DecodeError> {
    match payload {
        Value::String(text) => serde_json::from_str::<TaskEnvelope>(text)
            .map_err(|e| DecodeError::new(e.to_string(), text.clone())),
        Value::Object(_) => TaskEnvelope::deserialize(payload)
            .map_err(|e| DecodeError::new(e.to_string(), payload.to_string())),
        other => Err(DecodeError::new(
            format!("expected an object or a JSON string, got {}", value_type(other)),
            other.to_string(),
        )),
    }
}

/// Decode a raw text payload.
pub fn decode_text(text: &str) -> Result<TaskEnvelope, DecodeError> {
    decode_payload(&Value::String(text.to_string()))
}

fn value_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
