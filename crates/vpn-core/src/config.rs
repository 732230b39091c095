//! Process-level tunables, read once at [`crate::engine::VpnEngine::start`]
//! and threaded down to the components that need them. Every field has a
//! default matching the numbers called out in the core's contract.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Connection-tracker entry idle eviction threshold (`T_idle`).
    pub tracker_idle_timeout: Duration,
    /// Connection-tracker soft size cap before eviction runs.
    pub tracker_soft_cap: usize,
    /// Per-slot outbound queue depth (`N`).
    pub tunnel_queue_depth: usize,
    /// `connect()` timeout (`T_connect`).
    pub connect_timeout: Duration,
    /// Reconnect backoff ladder, in order, capped at the last entry.
    pub reconnect_backoff: Vec<Duration>,
    /// Shared inbound channel depth drained by the engine's inbound loop.
    pub inbound_channel_depth: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tracker_idle_timeout: Duration::from_secs(5 * 60),
            tracker_soft_cap: 1024,
            tunnel_queue_depth: 256,
            connect_timeout: Duration::from_secs(30),
            reconnect_backoff: vec![
                Duration::from_millis(500),
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
            ],
            inbound_channel_depth: 1024,
        }
    }
}

impl Config {
    /// Backoff delay for the given zero-indexed reconnect attempt, capped
    /// at the ladder's last entry once attempts run past its length.
    pub fn backoff_for_attempt(&self, attempt: usize) -> Duration {
        self.reconnect_backoff
            .get(attempt)
            .copied()
            .unwrap_or_else(|| {
                *self
                    .reconnect_backoff
                    .last()
                    .expect("reconnect_backoff must not be empty")
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let cfg = Config::default();
        assert_eq!(cfg.tracker_idle_timeout, Duration::from_secs(300));
        assert_eq!(cfg.tracker_soft_cap, 1024);
        assert_eq!(cfg.tunnel_queue_depth, 256);
        assert_eq!(cfg.connect_timeout, Duration::from_secs(30));
    }

    #[test]
    fn backoff_caps_at_last_entry() {
        let cfg = Config::default();
        assert_eq!(cfg.backoff_for_attempt(0), Duration::from_millis(500));
        assert_eq!(cfg.backoff_for_attempt(4), Duration::from_secs(8));
        assert_eq!(cfg.backoff_for_attempt(5), Duration::from_secs(8));
        assert_eq!(cfg.backoff_for_attempt(100), Duration::from_secs(8));
    }
}
