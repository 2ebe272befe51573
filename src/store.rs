// ABOUTME: Store contract consumed by the sync engine, plus an in-memory sink
// ABOUTME: MemoryStore backs the CLI and the test suites

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use serde_json::Value;

use crate::connection::ConnectionState;
use crate::event::{Domain, EventKind, NormalizedEvent};

/// The reactive store the engine feeds. Batches arrive merged and are applied
/// as a single unit; there are no per-event success semantics.
pub trait SyncStore: Send + Sync + 'static {
    fn apply_batch(&self, events: Vec<NormalizedEvent>) -> Result<()>;
    fn set_connection_state(&self, state: ConnectionState);
    fn increment_reconnect_attempts(&self);
    fn reset_reconnect_attempts(&self);
    fn set_client_active(&self, active: bool);
    /// Drop all synced data and counters back to the initial shape.
    fn reset(&self);
}

/// Counters exposed by [`MemoryStore`] for logging and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub batches_applied: u64,
    pub events_applied: u64,
    pub rows_deleted: u64,
    pub records_held: usize,
}

struct MemoryStoreInner {
    records: HashMap<Domain, HashMap<String, Value>>,
    connection_state: ConnectionState,
    reconnect_attempts: u32,
    client_active: bool,
    batches_applied: u64,
    events_applied: u64,
    rows_deleted: u64,
}

impl MemoryStoreInner {
    fn initial() -> Self {
        Self {
            records: HashMap::new(),
            connection_state: ConnectionState::Disconnected,
            reconnect_attempts: 0,
            client_active: true,
            batches_applied: 0,
            events_applied: 0,
            rows_deleted: 0,
        }
    }
}

/// In-memory reference implementation of [`SyncStore`]: a per-domain map of
/// entity id to latest row image.
pub struct MemoryStore {
    inner: Mutex<MemoryStoreInner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemoryStoreInner::initial()),
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn inner(&self) -> MutexGuard<'_, MemoryStoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record(&self, domain: Domain, id: &str) -> Option<Value> {
        self.inner()
            .records
            .get(&domain)
            .and_then(|rows| rows.get(id))
            .cloned()
    }

    pub fn len(&self, domain: Domain) -> usize {
        self.inner().records.get(&domain).map_or(0, HashMap::len)
    }

    pub fn is_empty(&self) -> bool {
        self.inner().records.values().all(HashMap::is_empty)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner().connection_state
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.inner().reconnect_attempts
    }

    pub fn client_active(&self) -> bool {
        self.inner().client_active
    }

    pub fn stats(&self) -> StoreStats {
        let inner = self.inner();
        StoreStats {
            batches_applied: inner.batches_applied,
            events_applied: inner.events_applied,
            rows_deleted: inner.rows_deleted,
            records_held: inner.records.values().map(HashMap::len).sum(),
        }
    }
}

impl SyncStore for MemoryStore {
    fn apply_batch(&self, events: Vec<NormalizedEvent>) -> Result<()> {
        let mut guard = self.inner();
        let inner = &mut *guard;
        inner.batches_applied += 1;
        inner.events_applied += events.len() as u64;
        for event in events {
            let rows = inner.records.entry(event.domain).or_default();
            match event.kind {
                EventKind::Insert | EventKind::Update => {
                    rows.insert(event.id, event.data);
                }
                EventKind::Delete => {
                    if rows.remove(&event.id).is_some() {
                        inner.rows_deleted += 1;
                    }
                }
            }
        }
        Ok(())
    }

    fn set_connection_state(&self, state: ConnectionState) {
        self.inner().connection_state = state;
    }

    fn increment_reconnect_attempts(&self) {
        self.inner().reconnect_attempts += 1;
    }

    fn reset_reconnect_attempts(&self) {
        self.inner().reconnect_attempts = 0;
    }

    fn set_client_active(&self, active: bool) {
        self.inner().client_active = active;
    }

    fn reset(&self) {
        *self.inner() = MemoryStoreInner::initial();
    }
}
