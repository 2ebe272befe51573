// ABOUTME: Event buffer: coalesces the normalized stream into bounded batches
// ABOUTME: Dedup per entity, stable priority ordering, debounced flush scheduling

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error};

use crate::event::{NormalizedEvent, Priority};

/// Flush tuning, immutable per buffer instance.
#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// Floor on time between flushes.
    pub min_batch_interval: Duration,
    /// Ceiling on how long a non-critical event may wait.
    pub max_batch_interval: Duration,
    /// Max events handed to one flush.
    pub max_batch_size: usize,
    /// Whether a critical event bypasses scheduling entirely.
    pub priority_flush: bool,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            min_batch_interval: Duration::from_millis(50),
            max_batch_interval: Duration::from_millis(1_000),
            max_batch_size: 50,
            priority_flush: true,
        }
    }
}

/// Deferred-flush delay: shrinks as time since the last flush grows, so
/// worst-case end-to-end latency stays bounded by `max_batch_interval`
/// while bursts inside `min_batch_interval` still coalesce.
fn flush_delay(config: &BufferConfig, since_last_flush: Duration) -> Duration {
    config
        .max_batch_interval
        .saturating_sub(since_last_flush)
        .clamp(config.min_batch_interval, config.max_batch_interval)
}

pub type FlushCallback = dyn Fn(Vec<NormalizedEvent>) -> Result<()> + Send + Sync;

struct BufferState {
    events: Vec<NormalizedEvent>,
    timer: Option<JoinHandle<()>>,
    flushing: bool,
    paused: bool,
    destroyed: bool,
    last_flush: Instant,
}

struct BufferShared {
    config: BufferConfig,
    on_flush: Box<FlushCallback>,
    state: Mutex<BufferState>,
}

enum AddOutcome {
    FlushNow,
    FlushSoon(Duration),
    Defer(Duration),
    Accumulate,
}

/// Coalesces a high-frequency stream of normalized events into bounded,
/// priority-ordered batches.
///
/// Cheap to clone; clones share the same underlying buffer.
#[derive(Clone)]
pub struct EventBuffer {
    shared: Arc<BufferShared>,
}

impl EventBuffer {
    pub fn new<F>(config: BufferConfig, on_flush: F) -> Self
    where
        F: Fn(Vec<NormalizedEvent>) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            shared: Arc::new(BufferShared {
                config,
                on_flush: Box::new(on_flush),
                state: Mutex::new(BufferState {
                    events: Vec::new(),
                    timer: None,
                    flushing: false,
                    paused: false,
                    destroyed: false,
                    last_flush: Instant::now(),
                }),
            }),
        }
    }

    pub fn config(&self) -> &BufferConfig {
        &self.shared.config
    }

    fn state(&self) -> MutexGuard<'_, BufferState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Add one event. Replaces any buffered event for the same `(domain, id)`
    /// (latest write wins), re-sorts by descending priority weight (stable,
    /// so equal priorities keep arrival order), then either flushes or
    /// (re)schedules a deferred flush.
    pub fn add(&self, event: NormalizedEvent) {
        let config = &self.shared.config;
        let outcome = {
            let mut state = self.state();
            if state.destroyed {
                return;
            }
            let key = event.key();
            state.events.retain(|existing| existing.key() != key);
            let urgent = config.priority_flush && event.priority == Priority::Critical;
            state.events.push(event);
            state
                .events
                .sort_by(|a, b| b.priority.weight().cmp(&a.priority.weight()));

            if state.paused {
                AddOutcome::Accumulate
            } else if urgent {
                AddOutcome::FlushNow
            } else if state.events.len() >= config.max_batch_size {
                // Capacity flushes still honor the floor between flushes.
                let since = state.last_flush.elapsed();
                if since >= config.min_batch_interval {
                    AddOutcome::FlushNow
                } else {
                    AddOutcome::FlushSoon(config.min_batch_interval - since)
                }
            } else {
                AddOutcome::Defer(flush_delay(config, state.last_flush.elapsed()))
            }
        };

        match outcome {
            AddOutcome::FlushNow => self.flush(),
            AddOutcome::FlushSoon(delay) | AddOutcome::Defer(delay) => self.schedule(delay),
            AddOutcome::Accumulate => {}
        }
    }

    pub fn add_batch(&self, events: Vec<NormalizedEvent>) {
        for event in events {
            self.add(event);
        }
    }

    /// Hand up to `max_batch_size` events from the front of the buffer to the
    /// flush callback. Guarded against re-entry: a flush triggered from
    /// inside the callback chain is a no-op. Callback errors are logged and
    /// swallowed; the guard is released on every path so scheduling resumes.
    pub fn flush(&self) {
        let batch = {
            let mut state = self.state();
            if state.flushing || state.destroyed || state.events.is_empty() {
                return;
            }
            state.flushing = true;
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            let take = state.events.len().min(self.shared.config.max_batch_size);
            state.events.drain(..take).collect::<Vec<_>>()
        };

        debug!(events = batch.len(), "flushing event batch");
        if let Err(err) = (self.shared.on_flush)(batch) {
            error!(error = %err, "flush callback failed; batch dropped");
        }

        let residue = {
            let mut state = self.state();
            state.flushing = false;
            state.last_flush = Instant::now();
            !state.events.is_empty() && !state.paused && !state.destroyed
        };
        if residue {
            self.schedule(self.shared.config.min_batch_interval);
        }
    }

    /// Cancel any scheduled flush without discarding buffered events. Events
    /// keep accumulating through `add` while paused.
    pub fn pause(&self) {
        let mut state = self.state();
        state.paused = true;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
    }

    /// Resume flushing; flushes immediately when anything is pending.
    pub fn resume(&self) {
        let pending = {
            let mut state = self.state();
            state.paused = false;
            !state.events.is_empty()
        };
        if pending {
            self.flush();
        }
    }

    pub fn size(&self) -> usize {
        self.state().events.len()
    }

    pub fn pending(&self) -> Vec<NormalizedEvent> {
        self.state().events.clone()
    }

    pub fn clear(&self) {
        let mut state = self.state();
        state.events.clear();
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
    }

    pub fn destroy(&self) {
        let mut state = self.state();
        state.destroyed = true;
        state.events.clear();
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
    }

    /// Arm the deferred-flush timer, replacing any armed one. Never more than
    /// one outstanding timer.
    fn schedule(&self, delay: Duration) {
        let mut state = self.state();
        if state.destroyed || state.paused {
            return;
        }
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        let buffer = self.clone();
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            buffer.timer_fired();
        }));
    }

    fn timer_fired(&self) {
        self.state().timer = None;
        self.flush();
    }
}
