#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use change_hub::envelope::ChangeEnvelope;
use chrono::{Duration as ChronoDuration, Utc};
use realtime_sync::event::{Domain, EventKind, NormalizedEvent, Priority};
use realtime_sync::transport::{
    ChannelEvent, ChannelHandle, ChannelSink, ChannelSpec, ChannelStatus, Transport,
};
use serde_json::{json, Value};

struct ScriptedChannel {
    table: String,
    sink: ChannelSink,
    open: Arc<AtomicBool>,
}

/// Transport test double: records every opened channel and lets the test
/// drive subscription results and change deliveries by hand.
#[derive(Default)]
pub struct ScriptedTransport {
    channels: Mutex<Vec<ScriptedChannel>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Total channels ever opened for a table, including torn-down ones.
    pub fn open_count(&self, table: &str) -> usize {
        self.channels
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.table == table)
            .count()
    }

    /// Channels currently live for a table.
    pub fn live_count(&self, table: &str) -> usize {
        self.channels
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.table == table && c.open.load(Ordering::SeqCst))
            .count()
    }

    fn live_sinks(&self, table: &str) -> Vec<ChannelSink> {
        self.channels
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.table == table && c.open.load(Ordering::SeqCst))
            .map(|c| Arc::clone(&c.sink))
            .collect()
    }

    fn all_live_sinks(&self) -> Vec<ChannelSink> {
        self.channels
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.open.load(Ordering::SeqCst))
            .map(|c| Arc::clone(&c.sink))
            .collect()
    }

    /// Acknowledge the live channel(s) for a table.
    pub fn ack(&self, table: &str) {
        for sink in self.live_sinks(table) {
            (*sink)(ChannelEvent::Status(ChannelStatus::Subscribed));
        }
    }

    pub fn ack_all(&self) {
        for sink in self.all_live_sinks() {
            (*sink)(ChannelEvent::Status(ChannelStatus::Subscribed));
        }
    }

    pub fn fail(&self, table: &str, message: &str) {
        for sink in self.live_sinks(table) {
            (*sink)(ChannelEvent::Status(ChannelStatus::Error(
                message.to_string(),
            )));
        }
    }

    pub fn close_channel(&self, table: &str) {
        for sink in self.live_sinks(table) {
            (*sink)(ChannelEvent::Status(ChannelStatus::Closed));
        }
    }

    /// Deliver one raw change to the live channel(s) for its table.
    pub fn emit(&self, envelope: &ChangeEnvelope) {
        for sink in self.live_sinks(&envelope.table) {
            (*sink)(ChannelEvent::Change(envelope.clone()));
        }
    }
}

struct ScriptedHandle {
    open: Arc<AtomicBool>,
}

impl ChannelHandle for ScriptedHandle {
    fn close(self: Box<Self>) {
        self.open.store(false, Ordering::SeqCst);
    }
}

impl Transport for ScriptedTransport {
    fn open_channel(&self, spec: ChannelSpec, sink: ChannelSink) -> Box<dyn ChannelHandle> {
        let open = Arc::new(AtomicBool::new(true));
        self.channels.lock().unwrap().push(ScriptedChannel {
            table: spec.table,
            sink,
            open: Arc::clone(&open),
        });
        Box::new(ScriptedHandle { open })
    }
}

/// Let spawned timer and ack tasks run on the current-thread test runtime.
pub async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

pub fn message_insert(id: &str, conversation: &str) -> ChangeEnvelope {
    ChangeEnvelope::insert(
        "messages",
        json!({"id": id, "conversation_id": conversation, "sender_id": "u1", "body": "hi"}),
    )
}

pub fn lead_row(id: &str) -> Value {
    json!({"id": id, "pipeline_id": "p1", "title": "deal"})
}

/// Envelope with a commit timestamp offset from now, for merge-order tests.
pub fn envelope_at(table: &str, mut envelope: ChangeEnvelope, offset_ms: i64) -> ChangeEnvelope {
    envelope.table = table.to_string();
    envelope.commit_timestamp = Utc::now() + ChronoDuration::milliseconds(offset_ms);
    envelope
}

pub fn norm_event(
    domain: Domain,
    id: &str,
    kind: EventKind,
    priority: Priority,
    offset_ms: i64,
) -> NormalizedEvent {
    NormalizedEvent {
        id: id.to_string(),
        domain,
        kind,
        priority,
        timestamp: Utc::now() + ChronoDuration::milliseconds(offset_ms),
        data: json!({"id": id}),
        old_data: None,
        table: "leads".to_string(),
        batch_key: None,
    }
}
