//! Protocol feature configuration.

use serde::Deserialize;

/// `[mqtt]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Highest QoS granted to subscribers and accepted from publishers.
    pub max_qos: u8,
    /// Accept and store retained messages.
    pub retain_available: bool,
    /// Deliver a message once per matching subscription even when
    /// subscriptions overlap (v3.x sessions only; v5 defines its own
    /// overlap semantics).
    pub allow_duplicate_messages: bool,
    /// Accept zero-length client identifiers and assign one.
    pub allow_zero_length_clientid: bool,
    /// Prefix for generated client identifiers.
    pub auto_id_prefix: String,
    /// When set, reject clients whose identifier lacks this prefix.
    pub clientid_prefixes: Option<String>,
    /// Accept `$share/...` subscriptions (v5).
    pub shared_subscriptions: bool,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            max_qos: 2,
            retain_available: true,
            allow_duplicate_messages: false,
            allow_zero_length_clientid: true,
            auto_id_prefix: "auto-".into(),
            clientid_prefixes: None,
            shared_subscriptions: true,
        }
    }
}

impl MqttConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_qos > 2 {
            return Err(format!("mqtt.max_qos must be 0, 1 or 2, got {}", self.max_qos));
        }
        Ok(())
    }
}
