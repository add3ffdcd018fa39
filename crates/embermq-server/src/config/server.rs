//! Listener configuration.

use std::net::SocketAddr;

use serde::Deserialize;

/// `[server]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP listen address.
    pub bind: SocketAddr,
    /// Prefix prepended to every topic published or subscribed through
    /// this listener.
    pub mount_point: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:1883".parse().expect("static address"),
            mount_point: None,
        }
    }
}
