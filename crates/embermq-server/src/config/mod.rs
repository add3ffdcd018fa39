//! Broker configuration.
//!
//! Sources, later ones winning:
//! - built-in defaults
//! - TOML file (default: `embermq.toml`), with `${VAR}` and
//!   `${VAR:-default}` substitution applied before parsing
//! - environment variables with the `EMBERMQ__` prefix, double
//!   underscore for nesting: `EMBERMQ__SERVER__BIND=0.0.0.0:1884`,
//!   `EMBERMQ__LIMITS__MAX_QUEUED_MESSAGES=500`

mod limits;
mod log;
mod mqtt;
mod server;
mod session;

use std::path::Path;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

pub use limits::{
    LimitsConfig, DEFAULT_MAX_INFLIGHT_MESSAGES, DEFAULT_MAX_PACKET_SIZE,
    DEFAULT_MAX_QUEUED_MESSAGES, DEFAULT_MAX_TOPIC_ALIAS,
};
pub use log::LogConfig;
pub use mqtt::MqttConfig;
pub use server::ServerConfig;
pub use session::SessionConfig;

/// Substitute `${VAR}` / `${VAR:-default}` with environment values.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").expect("static regex");
    re.replace_all(content, |caps: &regex::Captures| {
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(&caps[1]).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}

/// Root configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub server: ServerConfig,
    pub limits: LimitsConfig,
    pub session: SessionConfig,
    pub mqtt: MqttConfig,
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("validation error: {0}")]
    Validation(String),
}

impl Config {
    /// Load from a TOML file with environment overrides. A missing file
    /// is not an error; defaults and environment apply.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();

        let path = path.as_ref();
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let substituted = substitute_env_vars(&content);
            builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
        }

        let cfg = builder
            .add_source(
                Environment::with_prefix("EMBERMQ")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse from a TOML string (tests).
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let substituted = substitute_env_vars(content);
        let config: Config = toml::from_str(&substituted)
            .map_err(|e| ConfigError::Validation(format!("TOML parse error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.limits.validate().map_err(ConfigError::Validation)?;
        self.mqtt.validate().map_err(ConfigError::Validation)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.limits.max_inflight_messages, 20);
        assert_eq!(config.mqtt.max_qos, 2);
        assert!(config.mqtt.retain_available);
    }

    #[test]
    fn test_parse_toml() {
        let toml = r#"
[server]
bind = "127.0.0.1:1884"
mount_point = "tenant/"

[limits]
max_inflight_messages = 5
max_queued_messages = 100
queue_qos0_messages = true

[mqtt]
max_qos = 1
retain_available = false
auto_id_prefix = "emq-"

[session]
max_keepalive = 120
"#;
        let config = Config::parse(toml).unwrap();
        assert_eq!(config.server.bind.port(), 1884);
        assert_eq!(config.server.mount_point.as_deref(), Some("tenant/"));
        assert_eq!(config.limits.max_inflight_messages, 5);
        assert_eq!(config.limits.max_queued_messages, 100);
        assert!(config.limits.queue_qos0_messages);
        assert_eq!(config.mqtt.max_qos, 1);
        assert!(!config.mqtt.retain_available);
        assert_eq!(config.mqtt.auto_id_prefix, "emq-");
        assert_eq!(config.session.max_keepalive, 120);
    }

    #[test]
    fn test_parse_partial_keeps_defaults() {
        let config = Config::parse("[limits]\nmax_queued_messages = 7\n").unwrap();
        assert_eq!(config.limits.max_queued_messages, 7);
        assert_eq!(config.limits.max_inflight_messages, 20);
        assert_eq!(config.server.bind.port(), 1883);
    }

    #[test]
    fn test_invalid_max_qos_rejected() {
        assert!(Config::parse("[mqtt]\nmax_qos = 3\n").is_err());
    }

    #[test]
    fn test_env_var_substitution() {
        std::env::set_var("EMBERMQ_TEST_PORT", "1999");
        let substituted = substitute_env_vars("bind = \"0.0.0.0:${EMBERMQ_TEST_PORT}\"");
        assert!(substituted.contains("0.0.0.0:1999"));
        std::env::remove_var("EMBERMQ_TEST_PORT");
    }

    #[test]
    fn test_env_var_substitution_default() {
        std::env::remove_var("EMBERMQ_UNSET_VAR");
        let substituted = substitute_env_vars(r#"bind = "${EMBERMQ_UNSET_VAR:-0.0.0.0:1883}""#);
        assert!(substituted.contains("0.0.0.0:1883"));
    }
}
