//! Broker statistics counters.
//!
//! Updated on the hot paths, read by logging and by whatever front-end
//! wants to expose them. The engine is single-threaded so plain integers
//! suffice.

/// Counters the engine maintains as it runs.
#[derive(Debug, Default)]
pub struct BrokerMetrics {
    /// All MQTT packets received from clients.
    pub msgs_received: u64,
    /// All MQTT packets handed to client write buffers.
    pub msgs_sent: u64,
    /// PUBLISH packets received.
    pub pub_msgs_received: u64,
    /// PUBLISH packets queued toward subscribers.
    pub pub_msgs_sent: u64,
    /// Messages dropped at queue admission.
    pub pub_msgs_dropped: u64,
    /// Currently connected clients.
    pub clients_connected: u64,
    /// Sessions removed by session-expiry.
    pub clients_expired: u64,
    /// Messages currently held by the store.
    pub store_count: u64,
    /// Payload bytes currently held by the store.
    pub store_bytes: u64,
}

impl BrokerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn message_dropped(&mut self) {
        self.pub_msgs_dropped += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_dropped() {
        let mut m = BrokerMetrics::new();
        m.message_dropped();
        m.message_dropped();
        assert_eq!(m.pub_msgs_dropped, 2);
    }
}
