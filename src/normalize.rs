// ABOUTME: Normalization of raw change envelopes into typed events
// ABOUTME: Fail-soft: anything unrecognized becomes None, never an error

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use change_hub::envelope::ChangeEnvelope;

use crate::event::{Domain, EventKind, NormalizedEvent};

/// Turn a raw change envelope into a normalized event.
///
/// Returns `None` when the table is unrecognized or the row image carries no
/// identifying key. Callers treat `None` as "drop and log a warning".
pub fn normalize(envelope: &ChangeEnvelope) -> Option<NormalizedEvent> {
    let domain = Domain::from_table(&envelope.table)?;
    let kind = EventKind::from(envelope.event_type);
    let row = envelope.row()?;
    let id = field_as_string(row, domain.primary_key())?;
    let batch_key = domain
        .batch_key_column()
        .and_then(|column| field_as_string(row, column));

    Some(NormalizedEvent {
        id,
        domain,
        kind,
        priority: domain.priority(),
        timestamp: envelope.commit_timestamp,
        data: row.clone(),
        old_data: match kind {
            EventKind::Update => envelope.old.clone(),
            EventKind::Insert | EventKind::Delete => None,
        },
        table: envelope.table.clone(),
        batch_key,
    })
}

/// Read a field as an identifier string. Numeric keys are stringified so both
/// uuid and serial primary keys normalize the same way.
fn field_as_string(row: &Value, field: &str) -> Option<String> {
    match row.get(field)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Canonical lead shape used by consumers needing strict typing.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LeadRecord {
    pub id: String,
    pub pipeline_id: String,
    pub stage_id: Option<String>,
    pub title: String,
    pub value_cents: Option<i64>,
    pub owner_id: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ConversationRecord {
    pub id: String,
    pub contact_id: String,
    pub last_message_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub unread_count: u32,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub body: String,
    pub sent_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ActivityRecord {
    pub id: String,
    pub lead_id: String,
    pub activity_type: String,
    pub note: Option<String>,
    pub due_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ContactRecord {
    pub id: String,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NotificationRecord {
    pub id: String,
    pub recipient_id: String,
    pub body: String,
    #[serde(default)]
    pub read: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StageRecord {
    pub id: String,
    pub pipeline_id: String,
    pub name: String,
    pub position: i32,
}

/// A strictly-validated row, one variant per domain.
#[derive(Debug, Clone, PartialEq)]
pub enum DomainRecord {
    Lead(LeadRecord),
    Conversation(ConversationRecord),
    Message(MessageRecord),
    Activity(ActivityRecord),
    Contact(ContactRecord),
    Notification(NotificationRecord),
    Stage(StageRecord),
}

/// Strictly decode a raw row into its canonical per-domain shape.
///
/// Independent of the best-effort pipeline above: `None` on any missing
/// required field, for consumers that need typing guarantees.
pub fn validate(domain: Domain, row: &Value) -> Option<DomainRecord> {
    match domain {
        Domain::Lead => decode(row).map(DomainRecord::Lead),
        Domain::Conversation => decode(row).map(DomainRecord::Conversation),
        Domain::Message => decode(row).map(DomainRecord::Message),
        Domain::Activity => decode(row).map(DomainRecord::Activity),
        Domain::Contact => decode(row).map(DomainRecord::Contact),
        Domain::Notification => decode(row).map(DomainRecord::Notification),
        Domain::Stage => decode(row).map(DomainRecord::Stage),
    }
}

fn decode<T: DeserializeOwned>(row: &Value) -> Option<T> {
    serde_json::from_value(row.clone()).ok()
}
