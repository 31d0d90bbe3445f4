//! Client configuration.
//!
//! All intervals are plain millisecond fields so configs can round-trip
//! through JSON untouched; accessors hand out [`Duration`]s. Defaults match
//! the production collaboration endpoint.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Path of the collaboration socket, relative to the application origin.
pub const SOCKET_PATH: &str = "/ws";

/// Transport and connection tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CollabConfig {
    /// Origin of the collaboration endpoint, e.g. `ws://127.0.0.1:8080`.
    /// [`SOCKET_PATH`] is appended to build the socket URL.
    pub base_url: String,
    /// How long a connect attempt may wait for a liveness signal.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Outgoing heartbeat cadence; also advertised to the peer.
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,
    /// Delay before the single retry of a failed subscribe.
    #[serde(default = "default_subscribe_retry_ms")]
    pub subscribe_retry_ms: u64,
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
}

fn default_connect_timeout_ms() -> u64 {
    30_000
}

fn default_heartbeat_ms() -> u64 {
    10_000
}

fn default_subscribe_retry_ms() -> u64 {
    2_000
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            base_url: "ws://127.0.0.1:8080".to_string(),
            connect_timeout_ms: default_connect_timeout_ms(),
            heartbeat_ms: default_heartbeat_ms(),
            subscribe_retry_ms: default_subscribe_retry_ms(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl CollabConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    /// Full URL of the collaboration socket.
    pub fn socket_url(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), SOCKET_PATH)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    pub fn subscribe_retry_delay(&self) -> Duration {
        Duration::from_millis(self.subscribe_retry_ms)
    }
}

/// Exponential backoff policy for reconnect scheduling.
///
/// The delay before attempt `n` (zero-based) is
/// `min(base_delay_ms * 2^n, max_delay_ms)`. After `max_attempts` failed
/// attempts the manager stays Disconnected until an explicit connect.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectPolicy {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_max_attempts() -> u32 {
    5
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl ReconnectPolicy {
    /// Short delays and few attempts, for tests and flaky local setups.
    pub fn aggressive() -> Self {
        Self {
            base_delay_ms: 50,
            max_delay_ms: 400,
            max_attempts: 3,
        }
    }

    /// Whether another reconnect attempt may be scheduled.
    pub fn can_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Backoff delay before the given zero-based attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let ms = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(ms)
    }

    /// Delays for every attempt the policy allows, mostly for logging.
    pub fn delay_schedule(&self) -> Vec<Duration> {
        (0..self.max_attempts).map(|n| self.delay_for(n)).collect()
    }
}

/// Timing knobs of the collaborative session controller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionTuning {
    /// Quiet window before a burst of local edits produces one send.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Cadence at which typing=true is resent while the user keeps typing.
    #[serde(default = "default_typing_heartbeat_ms")]
    pub typing_heartbeat_ms: u64,
    /// Silence after the last edit that ends the typing state.
    #[serde(default = "default_typing_inactivity_ms")]
    pub typing_inactivity_ms: u64,
    /// Cadence of the probe that resends the current typing status.
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,
}

fn default_debounce_ms() -> u64 {
    500
}

fn default_typing_heartbeat_ms() -> u64 {
    2_000
}

fn default_typing_inactivity_ms() -> u64 {
    3_000
}

fn default_probe_interval_ms() -> u64 {
    5_000
}

impl Default for SessionTuning {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            typing_heartbeat_ms: default_typing_heartbeat_ms(),
            typing_inactivity_ms: default_typing_inactivity_ms(),
            probe_interval_ms: default_probe_interval_ms(),
        }
    }
}

impl SessionTuning {
    /// Tight intervals, for tests and demos.
    pub fn rapid() -> Self {
        Self {
            debounce_ms: 50,
            typing_heartbeat_ms: 200,
            typing_inactivity_ms: 300,
            probe_interval_ms: 500,
        }
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn typing_heartbeat(&self) -> Duration {
        Duration::from_millis(self.typing_heartbeat_ms)
    }

    pub fn typing_inactivity(&self) -> Duration {
        Duration::from_millis(self.typing_inactivity_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }
}
