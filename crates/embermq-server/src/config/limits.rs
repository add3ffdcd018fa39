//! Queueing and flow-control limits.

use serde::Deserialize;

pub const DEFAULT_MAX_PACKET_SIZE: u32 = 1024 * 1024;
pub const DEFAULT_MAX_INFLIGHT_MESSAGES: u16 = 20;
pub const DEFAULT_MAX_QUEUED_MESSAGES: usize = 1000;
pub const DEFAULT_MAX_TOPIC_ALIAS: u16 = 10;

/// `[limits]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Largest accepted control packet in bytes. 0 = unlimited.
    pub max_packet_size: u32,
    /// Largest accepted PUBLISH payload in bytes. 0 = unlimited.
    pub message_size_limit: u32,
    /// In-flight window per session per direction. 0 = unlimited.
    pub max_inflight_messages: u16,
    /// QoS 1/2 bytes allowed in flight. 0 = unlimited.
    pub max_inflight_bytes: usize,
    /// Messages allowed in a session's overflow queue. 0 = unlimited.
    pub max_queued_messages: usize,
    /// Bytes allowed in a session's overflow queue. 0 = unlimited.
    pub max_queued_bytes: usize,
    /// Queue QoS 0 messages for offline sessions.
    pub queue_qos0_messages: bool,
    /// Topic aliases each client may establish (v5). 0 = none.
    pub max_topic_alias: u16,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            message_size_limit: 0,
            max_inflight_messages: DEFAULT_MAX_INFLIGHT_MESSAGES,
            max_inflight_bytes: 0,
            max_queued_messages: DEFAULT_MAX_QUEUED_MESSAGES,
            max_queued_bytes: 0,
            queue_qos0_messages: false,
            max_topic_alias: DEFAULT_MAX_TOPIC_ALIAS,
        }
    }
}

impl LimitsConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_packet_size != 0 && self.max_packet_size < 32 {
            return Err(format!(
                "limits.max_packet_size of {} is too small to carry any packet",
                self.max_packet_size
            ));
        }
        Ok(())
    }
}
