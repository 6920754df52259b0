//! Trajectory record types.
//!
//! One record per event, self-contained and append-only. Records
//! round-trip through `to_record`/`from_record`; readers ignore fields
//! they do not recognize, so new producers stay compatible with old
//! consumers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single trajectory event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TrajectoryRecord {
    /// Emitted once when a completion starts.
    Metadata {
        timestamp: DateTime<Utc>,
        data: serde_json::Value,
    },
    /// Emitted once per LM turn.
    Iteration {
        timestamp: DateTime<Utc>,
        data: serde_json::Value,
    },
    /// Emitted when a completion finishes.
    Done {
        timestamp: DateTime<Utc>,
        data: serde_json::Value,
    },
    /// Emitted when a completion fails.
    Error {
        timestamp: DateTime<Utc>,
        message: String,
    },
}

impl TrajectoryRecord {
    /// Build a metadata record from any serializable payload.
    pub fn metadata<T: Serialize>(data: &T) -> Self {
        Self::Metadata {
            timestamp: Utc::now(),
            data: to_value(data),
        }
    }

    /// Build an iteration record from any serializable payload.
    pub fn iteration<T: Serialize>(data: &T) -> Self {
        Self::Iteration {
            timestamp: Utc::now(),
            data: to_value(data),
        }
    }

    /// Build a done record from any serializable payload.
    pub fn done<T: Serialize>(data: &T) -> Self {
        Self::Done {
            timestamp: Utc::now(),
            data: to_value(data),
        }
    }

    /// Build an error record.
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            timestamp: Utc::now(),
            message: message.into(),
        }
    }

    /// Serialize to one JSONL line (no trailing newline).
    pub fn to_record(&self) -> String {
        serde_json::to_string(self).expect("trajectory records are always serializable")
    }

    /// Parse a record from one JSONL line. Unknown fields are ignored.
    pub fn from_record(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }

    /// The event name as it appears on the wire.
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Metadata { .. } => "metadata",
            Self::Iteration { .. } => "iteration",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
        }
    }
}

fn to_value<T: Serialize>(data: &T) -> serde_json::Value {
    serde_json::to_value(data).unwrap_or(serde_json::Value::Null)
}
