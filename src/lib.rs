//! Client-side realtime synchronization engine.
//!
//! Ingests a change-data-capture stream of row-level notifications,
//! normalizes them into typed events, coalesces them into bounded batches,
//! and applies them to a reactive store — tolerating network interruption,
//! client backgrounding, and bursty traffic.
//!
//! Data flows one way: raw envelope → normalized event → buffered → merged
//! batch → store. Control flows the other way for lifecycle calls and
//! scheduling. See [`engine::SyncEngine`] for the public lifecycle API.

pub mod buffer;
pub mod config;
pub mod connection;
pub mod engine;
pub mod event;
pub mod normalize;
pub mod store;
pub mod transport;

pub use buffer::{BufferConfig, EventBuffer};
pub use config::SyncConfig;
pub use connection::{ConnectionManager, ConnectionState};
pub use engine::{merge_events, EngineConfig, SyncEngine};
pub use event::{Domain, EventKind, NormalizedEvent, Priority};
pub use normalize::normalize;
pub use store::{MemoryStore, SyncStore};
pub use transport::{ChannelSpec, HubTransport, TcpTransport, Transport};
