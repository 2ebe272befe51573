// ABOUTME: Shared event model for the realtime sync engine
// ABOUTME: Closed domain/priority/kind enums plus the normalized event shape

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use change_hub::envelope::ChangeOp;

/// Entity domain a change belongs to. Closed set: adding a domain is a
/// compile-time-checked change everywhere it is consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Lead,
    Conversation,
    Message,
    Activity,
    Contact,
    Notification,
    Stage,
}

impl Domain {
    /// Map a watched table name to its domain. Unknown tables map to `None`
    /// and are dropped by the normalizer.
    pub fn from_table(table: &str) -> Option<Self> {
        match table {
            "leads" => Some(Domain::Lead),
            "conversations" => Some(Domain::Conversation),
            "messages" => Some(Domain::Message),
            "activities" => Some(Domain::Activity),
            "contacts" => Some(Domain::Contact),
            "notifications" => Some(Domain::Notification),
            "pipeline_stages" => Some(Domain::Stage),
            _ => None,
        }
    }

    /// Fixed ingestion priority per domain. Chat traffic is latency-sensitive,
    /// reference data is not.
    pub fn priority(self) -> Priority {
        match self {
            Domain::Notification => Priority::Critical,
            Domain::Message | Domain::Conversation => Priority::High,
            Domain::Lead | Domain::Activity | Domain::Contact => Priority::Normal,
            Domain::Stage => Priority::Low,
        }
    }

    /// Column holding the entity identity.
    pub fn primary_key(self) -> &'static str {
        match self {
            Domain::Lead
            | Domain::Conversation
            | Domain::Message
            | Domain::Activity
            | Domain::Contact
            | Domain::Notification
            | Domain::Stage => "id",
        }
    }

    /// Column used as the grouping hint for downstream consumers, when the
    /// domain has a natural parent.
    pub fn batch_key_column(self) -> Option<&'static str> {
        match self {
            Domain::Message => Some("conversation_id"),
            Domain::Activity => Some("lead_id"),
            Domain::Lead => Some("pipeline_id"),
            Domain::Conversation | Domain::Contact | Domain::Notification | Domain::Stage => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Domain::Lead => "lead",
            Domain::Conversation => "conversation",
            Domain::Message => "message",
            Domain::Activity => "activity",
            Domain::Contact => "contact",
            Domain::Notification => "notification",
            Domain::Stage => "stage",
        }
    }
}

/// Flush priority. Higher weight sorts earlier in the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    Normal,
    Low,
}

impl Priority {
    pub fn weight(self) -> u8 {
        match self {
            Priority::Critical => 4,
            Priority::High => 3,
            Priority::Normal => 2,
            Priority::Low => 1,
        }
    }
}

/// What happened to the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Insert,
    Update,
    Delete,
}

impl From<ChangeOp> for EventKind {
    fn from(op: ChangeOp) -> Self {
        match op {
            ChangeOp::Insert => EventKind::Insert,
            ChangeOp::Update => EventKind::Update,
            ChangeOp::Delete => EventKind::Delete,
        }
    }
}

/// Identity of a buffered entity: at most one buffered event exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityKey {
    pub domain: Domain,
    pub id: String,
}

/// A change notification after normalization: typed, domain-tagged, and
/// carrying everything the buffer and store need.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedEvent {
    pub id: String,
    pub domain: Domain,
    pub kind: EventKind,
    pub priority: Priority,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
    pub old_data: Option<Value>,
    pub table: String,
    pub batch_key: Option<String>,
}

impl NormalizedEvent {
    pub fn key(&self) -> EntityKey {
        EntityKey {
            domain: self.domain,
            id: self.id.clone(),
        }
    }

    pub fn is_delete(&self) -> bool {
        self.kind == EventKind::Delete
    }
}
