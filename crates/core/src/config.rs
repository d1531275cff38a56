//! Component configuration via `memport.toml`
//!
//! Every component takes a plain options struct with serde defaults, so
//! a test fixture can be configured in code or from a TOML file. Options
//! that cannot be serialised (custom orderings, id minters, invalidators)
//! are set on the component builders instead.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Conventional config file name
pub const CONFIG_FILE_NAME: &str = "memport.toml";

/// Event log options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventLogOptions {
    /// Capture a filtered stack trace for events that record one
    #[serde(default = "default_true")]
    pub capture_traces: bool,
}

impl Default for EventLogOptions {
    fn default() -> Self {
        Self {
            capture_traces: true,
        }
    }
}

impl EventLogOptions {
    /// Toggle trace capture
    pub fn with_capture_traces(mut self, capture: bool) -> Self {
        self.capture_traces = capture;
        self
    }
}

/// Repository options, shared by the event-log and direct repositories
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryOptions {
    /// Namespace override; defaults to the entity's type name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Fail creates without an id instead of minting one (direct repository)
    #[serde(default)]
    pub expect_id: bool,
    /// Compact the event log after every append (event-log repository)
    #[serde(default)]
    pub compress_event_log: bool,
}

impl RepositoryOptions {
    /// Set the namespace
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Require callers to supply ids
    pub fn with_expect_id(mut self, expect_id: bool) -> Self {
        self.expect_id = expect_id;
        self
    }

    /// Compact the event log after each append
    pub fn with_compress_event_log(mut self, compress: bool) -> Self {
        self.compress_event_log = compress;
        self
    }
}

/// Queue options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueOptions {
    /// Deliver newest messages first
    #[serde(default)]
    pub lifo: bool,
    /// Subscribers only see messages published after they subscribed
    #[serde(default)]
    pub volatile: bool,
    /// Publish waits until every published message is consumed
    #[serde(default)]
    pub blocking: bool,
    /// Upper bound on how long an idle poll sleeps, in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            lifo: false,
            volatile: false,
            blocking: false,
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl QueueOptions {
    /// LIFO delivery
    pub fn with_lifo(mut self, lifo: bool) -> Self {
        self.lifo = lifo;
        self
    }

    /// Volatile subscriptions
    pub fn with_volatile(mut self, volatile: bool) -> Self {
        self.volatile = volatile;
        self
    }

    /// Blocking publish
    pub fn with_blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }

    /// Idle poll interval
    pub fn with_poll_interval_ms(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms.max(1);
        self
    }
}

/// Cache options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheOptions {
    /// Re-run a query in the background after serving it from cache
    #[serde(default)]
    pub refresh_behind: bool,
    /// Background refresh worker threads
    #[serde(default = "default_refresh_workers")]
    pub refresh_workers: usize,
    /// Pending refresh jobs accepted before new ones are dropped
    #[serde(default = "default_max_pending_refreshes")]
    pub max_pending_refreshes: usize,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            refresh_behind: false,
            refresh_workers: default_refresh_workers(),
            max_pending_refreshes: default_max_pending_refreshes(),
        }
    }
}

impl CacheOptions {
    /// Toggle refresh-behind
    pub fn with_refresh_behind(mut self, enabled: bool) -> Self {
        self.refresh_behind = enabled;
        self
    }

    /// Number of refresh workers
    pub fn with_refresh_workers(mut self, workers: usize) -> Self {
        self.refresh_workers = workers.max(1);
        self
    }
}

fn default_true() -> bool {
    true
}

fn default_poll_interval_ms() -> u64 {
    5
}

fn default_refresh_workers() -> usize {
    1
}

fn default_max_pending_refreshes() -> usize {
    1024
}

/// All component options, as read from `memport.toml`
///
/// # Example
///
/// ```toml
/// [event_log]
/// capture_traces = false
///
/// [queue]
/// lifo = true
/// blocking = false
///
/// [cache]
/// refresh_behind = true
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemportConfig {
    /// Event log section
    #[serde(default)]
    pub event_log: EventLogOptions,
    /// Repository section
    #[serde(default)]
    pub repository: RepositoryOptions,
    /// Queue section
    #[serde(default)]
    pub queue: QueueOptions,
    /// Cache section
    #[serde(default)]
    pub cache: CacheOptions,
}

impl MemportConfig {
    /// Parse from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(e.to_string()))
    }

    /// Read and parse a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!(
                "failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml_str(&content)
    }

    /// Serialise to TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// The default config file content with comments
    pub fn default_toml() -> &'static str {
        r#"# memport configuration

[event_log]
# Capture a filtered stack trace on repository events
capture_traces = true

[repository]
# Fail creates without an id instead of minting one
expect_id = false
# Compact the event log after every append
compress_event_log = false

[queue]
lifo = false
volatile = false
blocking = false
poll_interval_ms = 5

[cache]
refresh_behind = false
refresh_workers = 1
max_pending_refreshes = 1024
"#
    }
}
