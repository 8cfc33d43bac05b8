//! Client, stream and server configuration.
//!
//! Durations are stored as integer milliseconds so that configs load from
//! plain JSON files; accessors return [`Duration`]s.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::SUPPORTED_VERSIONS;

/// What the stream does after a failed connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReconnectPolicy {
    /// Always schedule the next attempt with exponential backoff.
    #[default]
    Backoff,
    /// After a `network_online` signal triggers an attempt that fails, stay
    /// offline until `reconnect()` is called explicitly.
    HoldAfterOnlineSignal,
}

/// Connection stream timing and retry behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Give up on a connect attempt after this long
    pub connect_timeout_ms: u64,
    /// Treat the transport as dead when no frame arrives for this long
    pub transport_idle_timeout_ms: u64,
    /// Backoff base for retries past `retry_min_count`
    pub retry_base_timeout_ms: u64,
    /// Backoff growth factor
    pub retry_exponent: f64,
    /// Upper bound on the backoff delay
    pub retry_max_timeout_ms: u64,
    /// Delay for the first `retry_min_count` retries
    pub retry_min_timeout_ms: u64,
    pub retry_min_count: u32,
    /// Total random spread applied to the backoff delay (0.5 → ±25%)
    pub retry_fuzz: f64,
    pub reconnect_policy: ReconnectPolicy,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            transport_idle_timeout_ms: 100_000,
            retry_base_timeout_ms: 1_000,
            retry_exponent: 2.2,
            retry_max_timeout_ms: 5 * 60 * 1_000,
            retry_min_timeout_ms: 10,
            retry_min_count: 2,
            retry_fuzz: 0.5,
            reconnect_policy: ReconnectPolicy::Backoff,
        }
    }
}

impl StreamConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn transport_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.transport_idle_timeout_ms)
    }
}

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server URL (`ws://`, `wss://`, `http://` or `https://`)
    pub url: String,
    /// Protocol versions offered, most preferred first
    pub supported_versions: Vec<String>,
    /// Send a ping after this long without inbound traffic (0 disables)
    pub heartbeat_interval_ms: u64,
    /// Declare the connection lost when a ping goes unanswered this long
    pub heartbeat_timeout_ms: u64,
    /// Answer server pings
    pub respond_to_pings: bool,
    /// Coalesce bursts of added/changed/removed for this long (0 applies
    /// every write immediately)
    pub buffered_writes_interval_ms: u64,
    /// Never hold buffered writes longer than this
    pub buffered_writes_max_age_ms: u64,
    /// Capacity of the channel carrying transport events to the
    /// connection task
    pub event_capacity: usize,
    pub stream: StreamConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:3000/websocket".to_string(),
            supported_versions: SUPPORTED_VERSIONS.iter().map(|v| v.to_string()).collect(),
            heartbeat_interval_ms: 45_000,
            heartbeat_timeout_ms: 15_000,
            respond_to_pings: true,
            buffered_writes_interval_ms: 5,
            buffered_writes_max_age_ms: 500,
            event_capacity: 256,
            stream: StreamConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn buffered_writes_interval(&self) -> Duration {
        Duration::from_millis(self.buffered_writes_interval_ms)
    }

    pub fn buffered_writes_max_age(&self) -> Duration {
        Duration::from_millis(self.buffered_writes_max_age_ms)
    }
}

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Path prefix under which sockets are accepted
    pub path_prefix: String,
    /// Protocol versions accepted, most preferred first
    pub supported_versions: Vec<String>,
    /// Heartbeat interval in milliseconds (0 disables)
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    /// Change feed channel capacity
    pub broadcast_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3000".to_string(),
            path_prefix: "/sockjs".to_string(),
            supported_versions: SUPPORTED_VERSIONS.iter().map(|v| v.to_string()).collect(),
            heartbeat_interval_ms: 15_000,
            heartbeat_timeout_ms: 15_000,
            broadcast_capacity: 1024,
        }
    }
}

impl ServerConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }
}
