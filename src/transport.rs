// ABOUTME: Transport abstraction for the change stream
// ABOUTME: Channels are fire-and-forget; results arrive through the sink callback

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use change_hub::envelope::ChangeEnvelope;
use change_hub::hub::{ChangeHub, SubscriberId};

/// One logical subscription: a table plus an optional row filter in the
/// `column=eq.value` form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
    pub table: String,
    pub filter: Option<String>,
}

impl ChannelSpec {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            filter: None,
        }
    }

    pub fn with_filter(table: impl Into<String>, filter: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            filter: Some(filter.into()),
        }
    }
}

/// Lifecycle signal for one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    Subscribed,
    Error(String),
    Closed,
    TimedOut,
}

/// What a transport delivers through the sink.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Status(ChannelStatus),
    Change(ChangeEnvelope),
}

pub type ChannelSink = Arc<dyn Fn(ChannelEvent) + Send + Sync>;

/// Handle for tearing one channel down.
pub trait ChannelHandle: Send {
    fn close(self: Box<Self>);
}

/// Black-box publish/subscribe transport keyed by table name.
///
/// `open_channel` must not block: subscription results are delivered through
/// the sink as [`ChannelStatus`] values, never awaited by the caller.
pub trait Transport: Send + Sync + 'static {
    fn open_channel(&self, spec: ChannelSpec, sink: ChannelSink) -> Box<dyn ChannelHandle>;
}

/// Evaluate a `column=eq.value` filter against a row image. An unparseable
/// filter matches nothing rather than everything.
pub fn filter_matches(filter: &str, row: &Value) -> bool {
    let Some((column, rest)) = filter.split_once('=') else {
        return false;
    };
    let Some(expected) = rest.strip_prefix("eq.") else {
        return false;
    };
    match row.get(column) {
        Some(Value::String(s)) => s == expected,
        Some(Value::Number(n)) => n.to_string() == expected,
        Some(Value::Bool(b)) => b.to_string() == expected,
        _ => false,
    }
}

/// In-process transport over a [`ChangeHub`]. Used by tests and embeddings
/// that run the change source in the same process as the engine.
pub struct HubTransport {
    hub: ChangeHub,
}

impl HubTransport {
    pub fn new(hub: ChangeHub) -> Self {
        Self { hub }
    }
}

struct HubChannel {
    hub: ChangeHub,
    subscriber: SubscriberId,
}

impl ChannelHandle for HubChannel {
    fn close(self: Box<Self>) {
        self.hub.unsubscribe(self.subscriber);
    }
}

impl Transport for HubTransport {
    fn open_channel(&self, spec: ChannelSpec, sink: ChannelSink) -> Box<dyn ChannelHandle> {
        let change_sink = Arc::clone(&sink);
        let filter = spec.filter.clone();
        let subscriber = self.hub.subscribe(&spec.table, move |envelope| {
            if let Some(filter) = &filter {
                let matched = envelope.row().is_some_and(|row| filter_matches(filter, row));
                if !matched {
                    return;
                }
            }
            (*change_sink)(ChannelEvent::Change(envelope.clone()));
        });

        // Acknowledge from a task so the caller has registered the channel
        // before the status lands.
        tokio::spawn(async move {
            (*sink)(ChannelEvent::Status(ChannelStatus::Subscribed));
        });

        Box::new(HubChannel {
            hub: self.hub.clone(),
            subscriber,
        })
    }
}

/// TCP line-protocol transport against a change-hub server. One connection
/// per channel; reconnection is the connection manager's job, not ours.
pub struct TcpTransport {
    source: String,
}

impl TcpTransport {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }
}

struct TcpChannel {
    task: JoinHandle<()>,
}

impl ChannelHandle for TcpChannel {
    fn close(self: Box<Self>) {
        self.task.abort();
    }
}

impl Transport for TcpTransport {
    fn open_channel(&self, spec: ChannelSpec, sink: ChannelSink) -> Box<dyn ChannelHandle> {
        let source = self.source.clone();
        let task = tokio::spawn(async move {
            if let Err(err) = run_tcp_channel(&source, &spec, &sink).await {
                (*sink)(ChannelEvent::Status(ChannelStatus::Error(err.to_string())));
            }
        });
        Box::new(TcpChannel { task })
    }
}

async fn run_tcp_channel(
    source: &str,
    spec: &ChannelSpec,
    sink: &ChannelSink,
) -> anyhow::Result<()> {
    let stream = TcpStream::connect(source).await?;
    let (read_half, mut write_half) = stream.into_split();

    let request = json!({ "tables": [spec.table] }).to_string();
    write_half.write_all(format!("{request}\n").as_bytes()).await?;
    (**sink)(ChannelEvent::Status(ChannelStatus::Subscribed));
    debug!(table = %spec.table, source, "channel subscribed");

    let mut lines = BufReader::new(read_half).lines();
    while let Some(line) = lines.next_line().await? {
        let envelope = match ChangeEnvelope::from_line(&line) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(table = %spec.table, error = %err, "skipping malformed change line");
                continue;
            }
        };
        if envelope.table != spec.table {
            continue;
        }
        if let Some(filter) = &spec.filter {
            let matched = envelope.row().is_some_and(|row| filter_matches(filter, row));
            if !matched {
                continue;
            }
        }
        (**sink)(ChannelEvent::Change(envelope));
    }

    debug!(table = %spec.table, "change stream closed by server");
    (**sink)(ChannelEvent::Status(ChannelStatus::Closed));
    Ok(())
}
