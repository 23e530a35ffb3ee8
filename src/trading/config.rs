//! Engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::session::{RetryPolicy, SessionConfig};

/// Timeouts, reconnect policy, and channel sizing for the mirroring engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How long an account has to answer the authorize request
    pub auth_timeout_ms: u64,

    /// Per-follower order send timeout; expiry records the order as failed
    pub send_timeout_ms: u64,

    /// Budget for draining in-flight orders and closing sessions on stop
    pub shutdown_timeout_ms: u64,

    /// First reconnect delay before doubling
    pub reconnect_base_delay_ms: u64,

    /// Upper bound on the reconnect delay
    pub reconnect_max_delay_ms: u64,

    /// Failed reconnects tolerated before an account is abandoned
    pub max_reconnect_attempts: u32,

    /// Audit stream buffer per subscriber
    pub event_capacity: usize,

    /// Capacity of the internal command and session event channels
    pub channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            auth_timeout_ms: 10_000,         // 10s
            send_timeout_ms: 5_000,          // 5s
            shutdown_timeout_ms: 5_000,      // 5s
            reconnect_base_delay_ms: 500,    // 0.5s, 1s, 2s, ...
            reconnect_max_delay_ms: 30_000,  // capped at 30s
            max_reconnect_attempts: 8,
            event_capacity: 1024,
            channel_capacity: 256,
        }
    }
}

impl EngineConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base: Duration::from_millis(self.reconnect_base_delay_ms),
            max: Duration::from_millis(self.reconnect_max_delay_ms.max(self.reconnect_base_delay_ms)),
            max_attempts: self.max_reconnect_attempts,
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            auth_timeout: Duration::from_millis(self.auth_timeout_ms),
            command_capacity: self.channel_capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: EngineConfig = serde_json::from_str(r#"{"send_timeout_ms": 250}"#).unwrap();
        assert_eq!(config.send_timeout(), Duration::from_millis(250));
        assert_eq!(config.auth_timeout_ms, EngineConfig::default().auth_timeout_ms);
    }

    #[test]
    fn test_max_delay_never_below_base() {
        let config = EngineConfig {
            reconnect_base_delay_ms: 2_000,
            reconnect_max_delay_ms: 100,
            ..EngineConfig::default()
        };
        let policy = config.retry_policy();
        assert_eq!(policy.max, Duration::from_secs(2));
    }
}
