//! Runtime limits (normative defaults).
//!
//! Values are intentionally explicit about their units to avoid confusion.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Largest encoded packet a broker or client will accept.
    pub max_packet_bytes: usize,
    /// Inbound queue depth per client before sends are refused.
    pub mailbox_max_packets: usize,
    /// Broker monitor wait per loop iteration.
    pub broker_tick_ms: u64,
    /// VM monitor wait per loop iteration.
    pub vm_tick_ms: u64,
    /// How long a client waits for the broker's connect ack.
    pub connect_timeout_ms: u64,
    /// Ticks a stopping VM spends draining outstanding subscription acks.
    pub drain_retry_limit: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_packet_bytes: 16 * 1024 * 1024,
            mailbox_max_packets: 128,
            broker_tick_ms: 100,
            vm_tick_ms: 100,
            connect_timeout_ms: 1_000,
            drain_retry_limit: 3,
        }
    }
}

impl Limits {
    pub fn broker_tick(&self) -> Duration {
        Duration::from_millis(self.broker_tick_ms)
    }

    pub fn vm_tick(&self) -> Duration {
        Duration::from_millis(self.vm_tick_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_serde() {
        let limits = Limits::default();
        let json = serde_json::to_string(&limits).expect("serialize");
        let back: Limits = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(limits, back);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let parsed: Limits = serde_json::from_str(r#"{"vm_tick_ms": 5}"#).expect("parse");
        assert_eq!(parsed.vm_tick_ms, 5);
        assert_eq!(parsed.mailbox_max_packets, Limits::default().mailbox_max_packets);
    }
}
