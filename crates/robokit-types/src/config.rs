//! Configuration surface consumed from external launchers.
//!
//! The core never reads configuration files itself; whatever supervises the
//! process deserialises these structs (TOML, YAML, env) and passes them in.
//! Every field has a serde default so partial configuration files work, and
//! [`RealtimeConfig::validate`] is the single place where missing credentials
//! are rejected before a connection is ever attempted.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::RobotError;

// ─────────────────────────────────────────────────────────────────────────────
// Realtime connection
// ─────────────────────────────────────────────────────────────────────────────

/// Settings for the streaming WebSocket session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// WebSocket endpoint, e.g. `wss://api.example.com/v1/realtime`.
    pub url: String,
    /// API key or short-lived ephemeral token attached during the handshake.
    pub api_key: String,
    /// Consecutive connection failures tolerated before giving up for good.
    pub max_reconnect_attempts: u32,
    /// First reconnect delay; doubles on every further attempt.
    pub reconnect_base_delay_s: f64,
    /// Upper bound on the reconnect delay.
    pub reconnect_max_delay_s: f64,
    /// Time allowed for TCP connect plus WebSocket handshake.
    pub connection_timeout_s: f64,
    /// Hard cap on how long `send_sync` blocks the calling thread.
    pub send_timeout_s: f64,
    /// Capacity of the outbound queue used while the socket is down.
    pub outbound_queue_capacity: usize,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            api_key: String::new(),
            max_reconnect_attempts: 5,
            reconnect_base_delay_s: 1.0,
            reconnect_max_delay_s: 16.0,
            connection_timeout_s: 10.0,
            send_timeout_s: 5.0,
            outbound_queue_capacity: 64,
        }
    }
}

impl RealtimeConfig {
    /// Fail fast on configuration that could only ever produce a broken
    /// session.  Called by the connection manager's constructor, so a missing
    /// credential is a programmer/deployment error surfaced immediately, not
    /// a reconnect loop at runtime.
    pub fn validate(&self) -> Result<(), RobotError> {
        if self.url.trim().is_empty() {
            return Err(RobotError::Config("realtime url is not set".to_string()));
        }
        if self.api_key.trim().is_empty() {
            return Err(RobotError::Config("realtime api_key is not set".to_string()));
        }
        if self.reconnect_base_delay_s <= 0.0 {
            return Err(RobotError::Config(
                "reconnect_base_delay_s must be positive".to_string(),
            ));
        }
        if self.reconnect_max_delay_s < self.reconnect_base_delay_s {
            return Err(RobotError::Config(
                "reconnect_max_delay_s must be >= reconnect_base_delay_s".to_string(),
            ));
        }
        if self.outbound_queue_capacity == 0 {
            return Err(RobotError::Config(
                "outbound_queue_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_secs_f64(self.reconnect_base_delay_s)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_secs_f64(self.reconnect_max_delay_s)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.connection_timeout_s)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.send_timeout_s)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Node runtime
// ─────────────────────────────────────────────────────────────────────────────

/// Per-node runtime settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Interval between heartbeat publications.
    pub heartbeat_interval_s: f64,
    /// Upper bound on how long the run loop sleeps between iterations; the
    /// stop flag is observed at least this often.
    pub poll_interval_ms: u64,
    /// How long `join` waits for `cleanup` before abandoning the thread.
    pub cleanup_timeout_s: f64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_s: 1.0,
            poll_interval_ms: 50,
            cleanup_timeout_s: 5.0,
        }
    }
}

impl NodeConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs_f64(self.heartbeat_interval_s)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn cleanup_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.cleanup_timeout_s)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Supervisor
// ─────────────────────────────────────────────────────────────────────────────

/// Settings for the node supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// First restart delay; doubles with every restart of the same node.
    pub restart_base_delay_s: f64,
    /// Upper bound on the restart delay.
    pub restart_max_delay_s: f64,
    /// A node silent for longer than this is a restart candidate.
    pub heartbeat_timeout_s: f64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            restart_base_delay_s: 0.5,
            restart_max_delay_s: 30.0,
            heartbeat_timeout_s: 3.0,
        }
    }
}

impl SupervisorConfig {
    pub fn restart_base_delay(&self) -> Duration {
        Duration::from_secs_f64(self.restart_base_delay_s)
    }

    pub fn restart_max_delay(&self) -> Duration {
        Duration::from_secs_f64(self.restart_max_delay_s)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.heartbeat_timeout_s)
    }
}
