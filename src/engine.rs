// ABOUTME: Sync engine: wires manager, normalizer, buffer, and store together
// ABOUTME: Owns lifecycle, client-activity policy, and the merge-on-flush pass

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use change_hub::envelope::ChangeEnvelope;

use crate::buffer::{BufferConfig, EventBuffer};
use crate::config::TableSubscription;
use crate::connection::{ConnectionManager, ConnectionState, ListenerId};
use crate::event::{Domain, NormalizedEvent};
use crate::normalize::normalize;
use crate::store::SyncStore;
use crate::transport::{ChannelSpec, Transport};

/// Collapse a batch to one event per `(domain, id)`.
///
/// Last write wins: the event with the greatest timestamp survives, later
/// arrival breaking ties. The stream is commit-ordered, so an event that
/// follows a delete for the same key is a genuine re-creation of the row.
/// First-arrival order of surviving keys is preserved.
pub fn merge_events(events: Vec<NormalizedEvent>) -> Vec<NormalizedEvent> {
    let mut positions: HashMap<(Domain, String), usize> = HashMap::new();
    let mut merged: Vec<NormalizedEvent> = Vec::with_capacity(events.len());
    for event in events {
        let key = (event.domain, event.id.clone());
        match positions.get(&key) {
            Some(&index) => {
                if event.timestamp >= merged[index].timestamp {
                    merged[index] = event;
                }
            }
            None => {
                positions.insert(key, merged.len());
                merged.push(event);
            }
        }
    }
    merged
}

/// Tuning for the engine itself, distinct from buffer tuning.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub tables: Vec<TableSubscription>,
    pub buffer: BufferConfig,
    pub max_pending_updates: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tables: crate::config::default_watched_tables(),
            buffer: BufferConfig::default(),
            max_pending_updates: 1_000,
        }
    }
}

struct EngineState {
    initialized: bool,
    client_active: bool,
    pending: VecDeque<NormalizedEvent>,
    stale: bool,
    event_listener: Option<ListenerId>,
    state_listener: Option<ListenerId>,
}

struct EngineShared {
    manager: ConnectionManager,
    buffer: EventBuffer,
    store: Arc<dyn SyncStore>,
    config: EngineConfig,
    state: Mutex<EngineState>,
}

enum Route {
    Buffer(NormalizedEvent),
    Queued,
    DroppedStale,
}

/// The one component with lifecycle state. Wires connection manager →
/// normalizer → buffer → store and owns the client-activity policy.
///
/// Cheap to clone; clones share the same underlying engine.
#[derive(Clone)]
pub struct SyncEngine {
    shared: Arc<EngineShared>,
}

impl SyncEngine {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<dyn SyncStore>,
        config: EngineConfig,
    ) -> Self {
        let manager = ConnectionManager::new(transport);
        let flush_store = Arc::clone(&store);
        let buffer = EventBuffer::new(config.buffer.clone(), move |batch| {
            flush_store.apply_batch(merge_events(batch))
        });
        Self {
            shared: Arc::new(EngineShared {
                manager,
                buffer,
                store,
                config,
                state: Mutex::new(EngineState {
                    initialized: false,
                    client_active: true,
                    pending: VecDeque::new(),
                    stale: false,
                    event_listener: None,
                    state_listener: None,
                }),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.shared.manager
    }

    pub fn buffer(&self) -> &EventBuffer {
        &self.shared.buffer
    }

    /// Start the engine: register listeners and subscribe every watched
    /// table. Idempotent; a second call is a no-op.
    pub fn initialize(&self) {
        {
            let mut state = self.state();
            if state.initialized {
                debug!("sync engine already initialized");
                return;
            }
            state.initialized = true;
        }

        let engine = self.clone();
        let state_listener = self
            .shared
            .manager
            .on_state_change(move |state| engine.handle_state_change(state));
        let engine = self.clone();
        let event_listener = self
            .shared
            .manager
            .on_event(move |envelope| engine.handle_raw_event(envelope));
        {
            let mut state = self.state();
            state.state_listener = Some(state_listener);
            state.event_listener = Some(event_listener);
        }

        self.shared.manager.subscribe_all(&self.watched_specs());
        info!(tables = self.shared.config.tables.len(), "sync engine initialized");
    }

    fn watched_specs(&self) -> Vec<ChannelSpec> {
        self.shared
            .config
            .tables
            .iter()
            .map(TableSubscription::channel_spec)
            .collect()
    }

    /// Client visibility changed. On activation: resume the buffer, drain the
    /// pending queue into the store exactly once, and re-evaluate connection
    /// health. On deactivation: pause the buffer; ingestion keeps flowing
    /// into the pending queue.
    pub fn set_client_active(&self, active: bool) {
        self.shared.store.set_client_active(active);
        if active {
            let (drained, stale) = {
                let mut state = self.state();
                state.client_active = true;
                let drained: Vec<NormalizedEvent> = state.pending.drain(..).collect();
                let stale = std::mem::take(&mut state.stale);
                (drained, stale)
            };
            self.shared.buffer.resume();
            if !drained.is_empty() {
                debug!(events = drained.len(), "draining updates queued while inactive");
                if let Err(err) = self.shared.store.apply_batch(merge_events(drained)) {
                    warn!(error = %err, "failed to apply queued updates");
                }
            }
            if stale {
                info!("pending queue overflowed while inactive; forcing resync");
                self.reconnect();
            } else if matches!(
                self.shared.manager.connection_state(),
                ConnectionState::Disconnected | ConnectionState::Error
            ) {
                self.shared.manager.reconnect();
            }
        } else {
            self.state().client_active = false;
            self.shared.buffer.pause();
        }
    }

    /// Force a full reconnect and re-subscribe every watched table.
    pub fn reconnect(&self) {
        self.shared.manager.reconnect();
        self.shared.manager.subscribe_all(&self.watched_specs());
    }

    /// Tear everything down and reset the store to its initial shape.
    pub fn destroy(&self) {
        let (event_listener, state_listener) = {
            let mut state = self.state();
            if !state.initialized {
                return;
            }
            state.initialized = false;
            state.pending.clear();
            state.stale = false;
            (state.event_listener.take(), state.state_listener.take())
        };
        if let Some(id) = event_listener {
            self.shared.manager.off_event(id);
        }
        if let Some(id) = state_listener {
            self.shared.manager.off_state_change(id);
        }
        self.shared.buffer.destroy();
        self.shared.manager.destroy();
        self.shared.store.reset();
        info!("sync engine destroyed");
    }

    pub fn is_active(&self) -> bool {
        self.state().initialized
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared.manager.connection_state()
    }

    pub fn pending_len(&self) -> usize {
        self.state().pending.len()
    }

    fn handle_state_change(&self, state: ConnectionState) {
        self.shared.store.set_connection_state(state);
        match state {
            ConnectionState::Connected => self.shared.store.reset_reconnect_attempts(),
            ConnectionState::Reconnecting => self.shared.store.increment_reconnect_attempts(),
            ConnectionState::Connecting
            | ConnectionState::Disconnected
            | ConnectionState::Error => {}
        }
    }

    fn handle_raw_event(&self, envelope: &ChangeEnvelope) {
        let Some(event) = normalize(envelope) else {
            warn!(table = %envelope.table, "dropping unrecognized change payload");
            return;
        };

        let route = {
            let mut state = self.state();
            if state.client_active {
                Route::Buffer(event)
            } else if state.pending.len() >= self.shared.config.max_pending_updates {
                state.stale = true;
                Route::DroppedStale
            } else {
                state.pending.push_back(event);
                Route::Queued
            }
        };
        match route {
            Route::Buffer(event) => self.shared.buffer.add(event),
            Route::Queued => {}
            Route::DroppedStale => {
                debug!("pending queue full; event dropped, view marked stale");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventKind, Priority};
    use chrono::{Duration as ChronoDuration, Utc};
    use serde_json::json;

    fn event(domain: Domain, id: &str, kind: EventKind, offset_ms: i64) -> NormalizedEvent {
        NormalizedEvent {
            id: id.to_string(),
            domain,
            kind,
            priority: Priority::Normal,
            timestamp: Utc::now() + ChronoDuration::milliseconds(offset_ms),
            data: json!({"id": id}),
            old_data: None,
            table: "leads".to_string(),
            batch_key: None,
        }
    }

    #[test]
    fn merge_keeps_latest_write_per_key() {
        let merged = merge_events(vec![
            event(Domain::Lead, "l1", EventKind::Insert, 0),
            event(Domain::Lead, "l1", EventKind::Update, 10),
            event(Domain::Lead, "l2", EventKind::Insert, 5),
        ]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].id, "l1");
        assert_eq!(merged[0].kind, EventKind::Update);
        assert_eq!(merged[1].id, "l2");
    }

    #[test]
    fn merge_collapses_update_then_delete_to_the_delete() {
        let merged = merge_events(vec![
            event(Domain::Lead, "l1", EventKind::Update, 0),
            event(Domain::Lead, "l1", EventKind::Delete, 10),
        ]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].kind, EventKind::Delete);
    }

    #[test]
    fn merge_lets_a_recreation_supersede_a_delete() {
        let merged = merge_events(vec![
            event(Domain::Lead, "l1", EventKind::Delete, 0),
            event(Domain::Lead, "l1", EventKind::Insert, 10),
        ]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].kind, EventKind::Insert);
    }

    #[test]
    fn merge_breaks_timestamp_ties_by_arrival_order() {
        let first = event(Domain::Lead, "l1", EventKind::Update, 0);
        let mut second = event(Domain::Lead, "l1", EventKind::Delete, 0);
        second.timestamp = first.timestamp;
        let merged = merge_events(vec![first, second]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].kind, EventKind::Delete);
    }

    #[test]
    fn merge_preserves_key_order_of_first_arrival() {
        let merged = merge_events(vec![
            event(Domain::Message, "m1", EventKind::Insert, 0),
            event(Domain::Lead, "l1", EventKind::Insert, 1),
            event(Domain::Message, "m1", EventKind::Update, 2),
        ]);
        assert_eq!(merged[0].domain, Domain::Message);
        assert_eq!(merged[1].domain, Domain::Lead);
    }
}
