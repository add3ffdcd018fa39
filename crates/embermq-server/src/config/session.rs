//! Session lifetime configuration.

use serde::Deserialize;

/// `[session]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Ceiling imposed on client keepalives, seconds. A v5 client above
    /// it is told the server keepalive; a 3.x client is refused.
    /// 0 = no ceiling.
    pub max_keepalive: u16,
    /// Ceiling on requested session expiry intervals, seconds.
    pub max_session_expiry_interval: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_keepalive: 0,
            max_session_expiry_interval: u32::MAX,
        }
    }
}
