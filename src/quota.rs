//! Per-principal resource limits

use std::time::Duration;

/// Resource caps enforced on a session, attached to its `Principal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    /// How long an idle (disconnected, persistent) session may survive.
    pub max_idle_session_ttl: Duration,
    /// Largest single packet the session may receive.
    pub max_packet_size: u32,
    /// Size of the packet-identifier pool — the cap on concurrent in-flight
    /// outbound QoS 1/2 messages.
    pub max_packet_identifiers: u16,
    pub max_queue_size_qos0: usize,
    pub max_queue_size_qos1: usize,
    pub max_queue_size_qos2: usize,
}

impl Default for Quota {
    fn default() -> Self {
        Self {
            max_idle_session_ttl: Duration::from_secs(3600),
            max_packet_size: 256 * 1024,
            max_packet_identifiers: 64,
            max_queue_size_qos0: 1000,
            max_queue_size_qos1: 1000,
            max_queue_size_qos2: 1000,
        }
    }
}
