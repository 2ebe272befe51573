use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Row-level operation carried by a change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

impl ChangeOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOp::Insert => "INSERT",
            ChangeOp::Update => "UPDATE",
            ChangeOp::Delete => "DELETE",
        }
    }
}

/// One raw change-data-capture notification, in the exact shape the upstream
/// protocol puts on the wire.
///
/// Inserts carry `new`, deletes carry `old`, updates carry both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEnvelope {
    #[serde(rename = "eventType")]
    pub event_type: ChangeOp,
    pub new: Option<Value>,
    pub old: Option<Value>,
    pub table: String,
    pub schema: String,
    pub commit_timestamp: DateTime<Utc>,
}

impl ChangeEnvelope {
    pub fn insert(table: &str, row: Value) -> Self {
        Self {
            event_type: ChangeOp::Insert,
            new: Some(row),
            old: None,
            table: table.to_string(),
            schema: "public".to_string(),
            commit_timestamp: Utc::now(),
        }
    }

    pub fn update(table: &str, row: Value, old: Value) -> Self {
        Self {
            event_type: ChangeOp::Update,
            new: Some(row),
            old: Some(old),
            table: table.to_string(),
            schema: "public".to_string(),
            commit_timestamp: Utc::now(),
        }
    }

    pub fn delete(table: &str, old: Value) -> Self {
        Self {
            event_type: ChangeOp::Delete,
            new: None,
            old: Some(old),
            table: table.to_string(),
            schema: "public".to_string(),
            commit_timestamp: Utc::now(),
        }
    }

    /// The row this change is about: the new image when present, otherwise
    /// the old image (deletes).
    pub fn row(&self) -> Option<&Value> {
        self.new.as_ref().or(self.old.as_ref())
    }

    /// Parse one line of the wire protocol.
    pub fn from_line(line: &str) -> Result<Self> {
        serde_json::from_str(line.trim())
            .map_err(|err| anyhow!("malformed change envelope: {err}"))
    }

    /// Encode as one line of the wire protocol (no trailing newline).
    pub fn to_line(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|err| anyhow!("failed to encode envelope: {err}"))
    }
}
