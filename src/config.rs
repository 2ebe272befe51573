// ABOUTME: Engine configuration: watched tables, buffer tuning, pending cap
// ABOUTME: Loaded from TOML with CLI overrides layered on top

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::buffer::BufferConfig;
use crate::transport::ChannelSpec;

/// One watched table, optionally narrowed by a `column=eq.value` filter.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TableSubscription {
    pub name: String,
    pub filter: Option<String>,
}

impl TableSubscription {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            filter: None,
        }
    }

    pub fn channel_spec(&self) -> ChannelSpec {
        ChannelSpec {
            table: self.name.clone(),
            filter: self.filter.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BufferSettings {
    pub min_batch_interval_ms: u64,
    pub max_batch_interval_ms: u64,
    pub max_batch_size: usize,
    pub priority_flush: bool,
}

impl Default for BufferSettings {
    fn default() -> Self {
        Self {
            min_batch_interval_ms: 50,
            max_batch_interval_ms: 1_000,
            max_batch_size: 50,
            priority_flush: true,
        }
    }
}

impl BufferSettings {
    pub fn to_buffer_config(&self) -> BufferConfig {
        BufferConfig {
            min_batch_interval: Duration::from_millis(self.min_batch_interval_ms),
            max_batch_interval: Duration::from_millis(self.max_batch_interval_ms),
            max_batch_size: self.max_batch_size,
            priority_flush: self.priority_flush,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Cap on events queued while the client is inactive. Overflow marks the
    /// local view stale and forces a resync on the next activation.
    pub max_pending_updates: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_pending_updates: 1_000,
        }
    }
}

/// Full engine configuration as read from `config.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SyncConfig {
    /// Change-stream endpoint (`host:port`).
    pub source: Option<String>,
    #[serde(default)]
    pub buffer: BufferSettings,
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub tables: Vec<TableSubscription>,
}

impl SyncConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;
        let config: SyncConfig = toml::from_str(&contents)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;
        Ok(config)
    }

    /// Default config path under the user's home directory.
    pub fn default_path() -> Result<PathBuf> {
        let home = dirs::home_dir().context("unable to determine home directory")?;
        Ok(home.join(".realtime-sync/config.toml"))
    }

    /// Configured tables, falling back to the full watched set.
    pub fn tables_or_default(&self) -> Vec<TableSubscription> {
        if self.tables.is_empty() {
            default_watched_tables()
        } else {
            self.tables.clone()
        }
    }
}

/// The fixed table list the application watches when the config names none.
pub fn default_watched_tables() -> Vec<TableSubscription> {
    [
        "leads",
        "conversations",
        "messages",
        "activities",
        "contacts",
        "notifications",
        "pipeline_stages",
    ]
    .into_iter()
    .map(TableSubscription::new)
    .collect()
}
