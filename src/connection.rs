// ABOUTME: Connection manager: one channel per watched table, one aggregate state
// ABOUTME: Owns the reconnect timer and the exponential backoff ladder

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use change_hub::envelope::ChangeEnvelope;

use crate::transport::{
    ChannelEvent, ChannelHandle, ChannelSink, ChannelSpec, ChannelStatus, Transport,
};

/// Aggregate connection state, one value per manager instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
            ConnectionState::Error => write!(f, "error"),
        }
    }
}

/// Fixed backoff ladder; the last rung repeats until a channel acknowledges.
const RECONNECT_DELAYS: [Duration; 6] = [
    Duration::from_millis(1_000),
    Duration::from_millis(2_000),
    Duration::from_millis(4_000),
    Duration::from_millis(8_000),
    Duration::from_millis(16_000),
    Duration::from_millis(30_000),
];

/// Delay before reconnect attempt number `attempt` (zero-based).
pub fn reconnect_delay(attempt: u32) -> Duration {
    let index = (attempt as usize).min(RECONNECT_DELAYS.len() - 1);
    RECONNECT_DELAYS[index]
}

/// Token returned by listener registration, used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type EventCallback = dyn Fn(&ChangeEnvelope) + Send + Sync;
type StateCallback = dyn Fn(ConnectionState) + Send + Sync;

struct Channel {
    spec: ChannelSpec,
    handle: Option<Box<dyn ChannelHandle>>,
    generation: u64,
    joined: bool,
}

struct ManagerState {
    connection: ConnectionState,
    channels: HashMap<String, Channel>,
    event_listeners: HashMap<ListenerId, Arc<EventCallback>>,
    state_listeners: HashMap<ListenerId, Arc<StateCallback>>,
    next_listener: u64,
    next_generation: u64,
    attempts: u32,
    reconnect_timer: Option<JoinHandle<()>>,
    destroyed: bool,
}

struct ManagerShared {
    transport: Arc<dyn Transport>,
    state: Mutex<ManagerState>,
}

/// Maintains one subscription channel per watched table and a single
/// aggregate [`ConnectionState`], hiding reconnection from everyone above.
///
/// Cheap to clone; clones share the same underlying manager.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<ManagerShared>,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            shared: Arc::new(ManagerShared {
                transport,
                state: Mutex::new(ManagerState {
                    connection: ConnectionState::Connecting,
                    channels: HashMap::new(),
                    event_listeners: HashMap::new(),
                    state_listeners: HashMap::new(),
                    next_listener: 0,
                    next_generation: 0,
                    attempts: 0,
                    reconnect_timer: None,
                    destroyed: false,
                }),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, ManagerState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state().connection
    }

    pub fn subscribed_tables(&self) -> Vec<String> {
        self.state().channels.keys().cloned().collect()
    }

    /// Tables whose channels have acknowledged their subscription.
    pub fn joined_tables(&self) -> Vec<String> {
        self.state()
            .channels
            .iter()
            .filter(|(_, channel)| channel.joined)
            .map(|(table, _)| table.clone())
            .collect()
    }

    /// Subscribe to a table's change feed. Idempotent: a second call for an
    /// already-subscribed table is a no-op.
    pub fn subscribe(&self, table: &str, filter: Option<&str>) {
        let spec = match filter {
            Some(filter) => ChannelSpec::with_filter(table, filter),
            None => ChannelSpec::new(table),
        };
        self.open_channel(spec);
    }

    pub fn subscribe_all(&self, specs: &[ChannelSpec]) {
        for spec in specs {
            self.open_channel(spec.clone());
        }
    }

    /// Drop a table's channel. When it was the last one, the manager reports
    /// `disconnected` (a normal close, so no reconnect is scheduled).
    pub fn unsubscribe(&self, table: &str) {
        let (handle, remaining) = {
            let mut state = self.state();
            let handle = state.channels.remove(table).and_then(|mut c| c.handle.take());
            (handle, state.channels.len())
        };
        if let Some(handle) = handle {
            handle.close();
            debug!(table, "channel unsubscribed");
        }
        if remaining == 0 {
            self.transition(ConnectionState::Disconnected);
        }
    }

    pub fn unsubscribe_all(&self) {
        let handles: Vec<_> = {
            let mut state = self.state();
            state
                .channels
                .drain()
                .filter_map(|(_, mut channel)| channel.handle.take())
                .collect()
        };
        for handle in handles {
            handle.close();
        }
        self.transition(ConnectionState::Disconnected);
    }

    /// Register a raw-event listener. Fan-out is multi-listener; the returned
    /// id unregisters.
    pub fn on_event<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&ChangeEnvelope) + Send + Sync + 'static,
    {
        let mut state = self.state();
        let id = ListenerId(state.next_listener);
        state.next_listener += 1;
        state.event_listeners.insert(id, Arc::new(callback));
        id
    }

    pub fn off_event(&self, id: ListenerId) {
        self.state().event_listeners.remove(&id);
    }

    /// Register a connection-state listener. The current state is delivered
    /// synchronously before this returns.
    pub fn on_state_change<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        let callback: Arc<StateCallback> = Arc::new(callback);
        let (id, current) = {
            let mut state = self.state();
            let id = ListenerId(state.next_listener);
            state.next_listener += 1;
            state.state_listeners.insert(id, Arc::clone(&callback));
            (id, state.connection)
        };
        (*callback)(current);
        id
    }

    pub fn off_state_change(&self, id: ListenerId) {
        self.state().state_listeners.remove(&id);
    }

    /// Drop every channel and re-subscribe from scratch.
    pub fn reconnect(&self) {
        let (specs, handles) = {
            let mut state = self.state();
            if state.destroyed {
                return;
            }
            if let Some(timer) = state.reconnect_timer.take() {
                timer.abort();
            }
            let mut specs = Vec::new();
            let mut handles = Vec::new();
            for (_, mut channel) in state.channels.drain() {
                if let Some(handle) = channel.handle.take() {
                    handles.push(handle);
                }
                specs.push(channel.spec);
            }
            (specs, handles)
        };
        for handle in handles {
            handle.close();
        }
        info!(channels = specs.len(), "reconnecting all channels");
        self.transition(ConnectionState::Reconnecting);
        self.transition(ConnectionState::Connecting);
        for spec in specs {
            self.open_channel(spec);
        }
    }

    /// Network came back: retry immediately regardless of current state.
    pub fn network_online(&self) {
        info!("network online signal; forcing reconnect");
        self.reconnect();
    }

    /// Network went away: report disconnected and disarm any pending retry.
    /// Retrying with no network would only burn the backoff ladder.
    pub fn network_offline(&self) {
        {
            let mut state = self.state();
            if let Some(timer) = state.reconnect_timer.take() {
                timer.abort();
            }
        }
        info!("network offline signal; suspending reconnects");
        self.transition(ConnectionState::Disconnected);
    }

    /// Tear everything down synchronously: timers, channels, listeners.
    pub fn destroy(&self) {
        let handles: Vec<_> = {
            let mut state = self.state();
            state.destroyed = true;
            if let Some(timer) = state.reconnect_timer.take() {
                timer.abort();
            }
            state.event_listeners.clear();
            state.state_listeners.clear();
            state.connection = ConnectionState::Disconnected;
            state
                .channels
                .drain()
                .filter_map(|(_, mut channel)| channel.handle.take())
                .collect()
        };
        for handle in handles {
            handle.close();
        }
    }

    fn open_channel(&self, spec: ChannelSpec) {
        let (generation, needs_connecting) = {
            let mut state = self.state();
            if state.destroyed || state.channels.contains_key(&spec.table) {
                return;
            }
            let generation = state.next_generation;
            state.next_generation += 1;
            // Reserve the slot before calling the transport so a synchronous
            // sink delivery finds the channel registered.
            state.channels.insert(
                spec.table.clone(),
                Channel {
                    spec: spec.clone(),
                    handle: None,
                    generation,
                    joined: false,
                },
            );
            let needs_connecting = matches!(
                state.connection,
                ConnectionState::Disconnected | ConnectionState::Reconnecting
            );
            (generation, needs_connecting)
        };
        if needs_connecting {
            self.transition(ConnectionState::Connecting);
        }

        let manager = self.clone();
        let table = spec.table.clone();
        let sink: ChannelSink = Arc::new(move |event| {
            manager.handle_channel_event(&table, generation, event);
        });
        let handle = self.shared.transport.open_channel(spec.clone(), sink);

        let stale = {
            let mut state = self.state();
            match state.channels.get_mut(&spec.table) {
                Some(channel) if channel.generation == generation => {
                    channel.handle = Some(handle);
                    None
                }
                // The channel was dropped or replaced while the transport was
                // opening it; the new handle is already stale.
                _ => Some(handle),
            }
        };
        if let Some(handle) = stale {
            handle.close();
        }
    }

    fn handle_channel_event(&self, table: &str, generation: u64, event: ChannelEvent) {
        match event {
            ChannelEvent::Status(status) => self.handle_status(table, generation, status),
            ChannelEvent::Change(envelope) => {
                let listeners: Vec<Arc<EventCallback>> = {
                    let state = self.state();
                    let current = state.channels.get(table);
                    if !current.is_some_and(|c| c.generation == generation) {
                        return;
                    }
                    state.event_listeners.values().cloned().collect()
                };
                for listener in listeners {
                    (*listener)(&envelope);
                }
            }
        }
    }

    fn handle_status(&self, table: &str, generation: u64, status: ChannelStatus) {
        {
            let state = self.state();
            let current = state.channels.get(table);
            if !current.is_some_and(|c| c.generation == generation) {
                // Stale event from a channel torn down by reconnect/unsubscribe.
                return;
            }
        }
        match status {
            ChannelStatus::Subscribed => {
                let transition = {
                    let mut state = self.state();
                    if let Some(channel) = state.channels.get_mut(table) {
                        channel.joined = true;
                    }
                    state.attempts = 0;
                    if let Some(timer) = state.reconnect_timer.take() {
                        timer.abort();
                    }
                    matches!(
                        state.connection,
                        ConnectionState::Connecting | ConnectionState::Reconnecting
                    )
                };
                debug!(table, "channel subscribed");
                if transition {
                    self.transition(ConnectionState::Connected);
                }
            }
            ChannelStatus::Error(message) => {
                warn!(table, error = %message, "channel error");
                self.transition(ConnectionState::Error);
                self.schedule_reconnect();
            }
            ChannelStatus::TimedOut => {
                warn!(table, "channel timed out");
                self.transition(ConnectionState::Error);
                self.schedule_reconnect();
            }
            ChannelStatus::Closed => {
                warn!(table, "channel closed unexpectedly");
                self.transition(ConnectionState::Disconnected);
                self.schedule_reconnect();
            }
        }
    }

    fn transition(&self, next: ConnectionState) {
        let listeners: Vec<Arc<StateCallback>> = {
            let mut state = self.state();
            if state.destroyed || state.connection == next {
                return;
            }
            state.connection = next;
            state.state_listeners.values().cloned().collect()
        };
        debug!(state = %next, "connection state changed");
        for listener in listeners {
            (*listener)(next);
        }
    }

    /// Arm the reconnect timer. A no-op while one is already armed, so burst
    /// errors across channels collapse into a single retry.
    fn schedule_reconnect(&self) {
        let delay = {
            let mut state = self.state();
            if state.destroyed || state.reconnect_timer.is_some() {
                return;
            }
            let delay = reconnect_delay(state.attempts);
            state.attempts += 1;
            let manager = self.clone();
            state.reconnect_timer = Some(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                manager.reconnect_timer_fired();
            }));
            delay
        };
        info!(delay_ms = delay.as_millis() as u64, "reconnect scheduled");
    }

    fn reconnect_timer_fired(&self) {
        self.state().reconnect_timer = None;
        self.reconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_ladder_is_fixed_and_capped() {
        assert_eq!(reconnect_delay(0), Duration::from_millis(1_000));
        assert_eq!(reconnect_delay(1), Duration::from_millis(2_000));
        assert_eq!(reconnect_delay(2), Duration::from_millis(4_000));
        assert_eq!(reconnect_delay(3), Duration::from_millis(8_000));
        assert_eq!(reconnect_delay(4), Duration::from_millis(16_000));
        assert_eq!(reconnect_delay(5), Duration::from_millis(30_000));
        assert_eq!(reconnect_delay(40), Duration::from_millis(30_000));
    }

    #[test]
    fn state_display_matches_wire_names() {
        assert_eq!(ConnectionState::Connecting.to_string(), "connecting");
        assert_eq!(ConnectionState::Reconnecting.to_string(), "reconnecting");
        assert_eq!(ConnectionState::Error.to_string(), "error");
    }
}
