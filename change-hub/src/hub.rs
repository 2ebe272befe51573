use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use uuid::Uuid;

use crate::envelope::ChangeEnvelope;

type Sink = Arc<dyn Fn(&ChangeEnvelope) + Send + Sync>;

/// Identifier handed back by [`ChangeHub::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(Uuid);

struct Subscriber {
    id: SubscriberId,
    sink: Sink,
}

#[derive(Default)]
struct HubInner {
    by_table: HashMap<String, Vec<Subscriber>>,
    catch_all: Vec<Subscriber>,
}

/// In-process publish/subscribe hub keyed by table name.
///
/// Publishing fans a change out to every subscriber of that table plus every
/// catch-all subscriber. Sinks are invoked synchronously on the publishing
/// task, outside the hub lock.
#[derive(Clone, Default)]
pub struct ChangeHub {
    inner: Arc<Mutex<HubInner>>,
}

impl ChangeHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> std::sync::MutexGuard<'_, HubInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribe to changes for one table.
    pub fn subscribe<F>(&self, table: &str, sink: F) -> SubscriberId
    where
        F: Fn(&ChangeEnvelope) + Send + Sync + 'static,
    {
        let id = SubscriberId(Uuid::new_v4());
        self.inner()
            .by_table
            .entry(table.to_string())
            .or_default()
            .push(Subscriber {
                id,
                sink: Arc::new(sink),
            });
        id
    }

    /// Subscribe to changes for every table.
    pub fn subscribe_all<F>(&self, sink: F) -> SubscriberId
    where
        F: Fn(&ChangeEnvelope) + Send + Sync + 'static,
    {
        let id = SubscriberId(Uuid::new_v4());
        self.inner().catch_all.push(Subscriber {
            id,
            sink: Arc::new(sink),
        });
        id
    }

    /// Remove a subscriber. Returns false when the id is unknown.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut inner = self.inner();
        let mut removed = false;
        for subscribers in inner.by_table.values_mut() {
            let before = subscribers.len();
            subscribers.retain(|s| s.id != id);
            removed |= subscribers.len() != before;
        }
        let before = inner.catch_all.len();
        inner.catch_all.retain(|s| s.id != id);
        removed | (inner.catch_all.len() != before)
    }

    /// Deliver one change to every matching subscriber. Returns the number of
    /// sinks invoked.
    pub fn publish(&self, envelope: &ChangeEnvelope) -> usize {
        let sinks: Vec<Sink> = {
            let inner = self.inner();
            let mut sinks = Vec::new();
            if let Some(subscribers) = inner.by_table.get(&envelope.table) {
                sinks.extend(subscribers.iter().map(|s| Arc::clone(&s.sink)));
            }
            sinks.extend(inner.catch_all.iter().map(|s| Arc::clone(&s.sink)));
            sinks
        };
        let delivered = sinks.len();
        for sink in sinks {
            (*sink)(envelope);
        }
        delivered
    }

    pub fn subscriber_count(&self, table: &str) -> usize {
        let inner = self.inner();
        inner.by_table.get(table).map_or(0, Vec::len) + inner.catch_all.len()
    }
}
