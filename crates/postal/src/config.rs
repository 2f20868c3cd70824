//! [`PostalConfig`]: the complete set of knobs from which a [`crate::create_post_office`]
//! handle is built.

use serde::{Deserialize, Serialize};

use crate::error::PostalError;

fn default_server_host() -> String {
    if cfg!(windows) {
        "localhost".into()
    } else {
        String::new()
    }
}

fn default_server_port() -> u16 {
    crate::broker::DEFAULT_PORT
}

fn default_true() -> bool {
    true
}

fn default_receive_buffer_max_items() -> usize {
    262_144
}

fn default_receive_buffer_max_megabytes() -> f64 {
    256.0
}

fn default_send_buffer_max_items() -> usize {
    262_144
}

fn default_send_buffer_max_megabytes() -> f64 {
    256.0
}

/// Full configuration for a [`crate::PostOffice`] handle.
///
/// Mirrors the reference `PostOfficeInitializer` field-for-field (see
/// `SPEC_FULL.md` §6). Parsed from a `postal.toml` document via
/// [`PostalConfig::from_toml`]/[`PostalConfig::from_file`], with
/// `POSTAL_*`-prefixed environment variable overrides layered on top.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PostalConfig {
    /// Broker host to dial. Empty string means "localhost" on non-Windows
    /// platforms (matching the reference's platform-dependent default).
    pub server_host: String,

    /// Broker TCP port.
    pub server_port: u16,

    /// Credentials passed through to the transport; unused by the embedded
    /// broker transport (no authentication), carried for parity with the
    /// AMQP/Spread transports named in the data model.
    pub server_username: String,
    pub server_password: String,
    pub server_vhost: String,

    /// If `false`, `create_post_office` returns a thin unbuffered wrapper
    /// around the transport directly, bypassing the worker thread and both
    /// bounded queues entirely.
    pub buffered: bool,

    pub receive_buffer_max_items: usize,
    pub receive_buffer_max_megabytes: f64,
    pub send_buffer_max_items: usize,
    pub send_buffer_max_megabytes: f64,
}

impl Default for PostalConfig {
    fn default() -> Self {
        Self {
            server_host: default_server_host(),
            server_port: default_server_port(),
            server_username: String::new(),
            server_password: String::new(),
            server_vhost: String::new(),
            buffered: default_true(),
            receive_buffer_max_items: default_receive_buffer_max_items(),
            receive_buffer_max_megabytes: default_receive_buffer_max_megabytes(),
            send_buffer_max_items: default_send_buffer_max_items(),
            send_buffer_max_megabytes: default_send_buffer_max_megabytes(),
        }
    }
}

impl PostalConfig {
    /// Parse config from a TOML string, apply `POSTAL_*` env overrides, validate.
    pub fn from_toml(toml_str: &str) -> Result<Self, PostalError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, PostalError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// The effective host to dial: `server_host` as given, or `"localhost"`
    /// when empty on a non-Windows build (matching `claim::CreatePostOffice`'s
    /// `host.empty() ? "localhost" : host`).
    pub fn effective_host(&self) -> &str {
        if self.server_host.is_empty() {
            "localhost"
        } else {
            &self.server_host
        }
    }

    pub fn receive_buffer_max_bytes(&self) -> usize {
        (self.receive_buffer_max_megabytes * 1024.0 * 1024.0) as usize
    }

    pub fn send_buffer_max_bytes(&self) -> usize {
        (self.send_buffer_max_megabytes * 1024.0 * 1024.0) as usize
    }

    /// Apply environment variable overrides.
    ///
    /// Convention: `POSTAL_SECTION_KEY` overrides `section_key`. Examples:
    /// - `POSTAL_SERVER_HOST` → `server_host`
    /// - `POSTAL_SERVER_PORT` → `server_port`
    /// - `POSTAL_BUFFERED` → `buffered`
    /// - `POSTAL_RECEIVE_BUFFER_MAX_ITEMS` → `receive_buffer_max_items`
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("POSTAL_SERVER_HOST") {
            self.server_host = v;
        }
        if let Ok(v) = std::env::var("POSTAL_SERVER_PORT") {
            if let Ok(port) = v.parse::<u16>() {
                self.server_port = port;
            }
        }
        if let Ok(v) = std::env::var("POSTAL_SERVER_USERNAME") {
            self.server_username = v;
        }
        if let Ok(v) = std::env::var("POSTAL_SERVER_PASSWORD") {
            self.server_password = v;
        }
        if let Ok(v) = std::env::var("POSTAL_SERVER_VHOST") {
            self.server_vhost = v;
        }
        if let Ok(v) = std::env::var("POSTAL_BUFFERED") {
            if let Ok(b) = v.parse::<bool>() {
                self.buffered = b;
            }
        }
        if let Ok(v) = std::env::var("POSTAL_RECEIVE_BUFFER_MAX_ITEMS") {
            if let Ok(n) = v.parse::<usize>() {
                self.receive_buffer_max_items = n;
            }
        }
        if let Ok(v) = std::env::var("POSTAL_RECEIVE_BUFFER_MAX_MEGABYTES") {
            if let Ok(n) = v.parse::<f64>() {
                self.receive_buffer_max_megabytes = n;
            }
        }
        if let Ok(v) = std::env::var("POSTAL_SEND_BUFFER_MAX_ITEMS") {
            if let Ok(n) = v.parse::<usize>() {
                self.send_buffer_max_items = n;
            }
        }
        if let Ok(v) = std::env::var("POSTAL_SEND_BUFFER_MAX_MEGABYTES") {
            if let Ok(n) = v.parse::<f64>() {
                self.send_buffer_max_megabytes = n;
            }
        }
    }

    /// Reject configurations the engine cannot operate under.
    pub fn validate(&self) -> Result<(), PostalError> {
        if self.receive_buffer_max_items == 0 {
            return Err(PostalError::Config(
                "receive_buffer_max_items must be >= 1".into(),
            ));
        }
        if self.send_buffer_max_items == 0 {
            return Err(PostalError::Config(
                "send_buffer_max_items must be >= 1".into(),
            ));
        }
        if self.buffered && self.server_port == 0 {
            return Err(PostalError::Config(
                "server_port must be nonzero when buffered transport use requires dialing out"
                    .into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = PostalConfig::default();
        assert_eq!(cfg.server_port, 4808);
        assert!(cfg.buffered);
        assert_eq!(cfg.receive_buffer_max_items, 262_144);
        assert_eq!(cfg.receive_buffer_max_megabytes, 256.0);
        assert_eq!(cfg.send_buffer_max_items, 262_144);
        assert_eq!(cfg.send_buffer_max_megabytes, 256.0);
    }

    #[test]
    fn empty_host_resolves_to_localhost_off_windows() {
        let cfg = PostalConfig {
            server_host: String::new(),
            ..Default::default()
        };
        if !cfg!(windows) {
            assert_eq!(cfg.effective_host(), "localhost");
        }
    }

    #[test]
    fn parse_minimal_toml() {
        let toml = r#"
server_host = "broker.example"
server_port = 5000
"#;
        let cfg = PostalConfig::from_toml(toml).unwrap();
        assert_eq!(cfg.server_host, "broker.example");
        assert_eq!(cfg.server_port, 5000);
        assert!(cfg.buffered);
    }

    #[test]
    fn megabyte_fields_convert_to_bytes() {
        let cfg = PostalConfig {
            receive_buffer_max_megabytes: 1.0,
            ..Default::default()
        };
        assert_eq!(cfg.receive_buffer_max_bytes(), 1024 * 1024);
    }

    #[test]
    fn rejects_zero_item_caps() {
        let cfg = PostalConfig {
            receive_buffer_max_items: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = PostalConfig {
            send_buffer_max_items: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_zero_port_when_buffered() {
        let cfg = PostalConfig {
            server_port: 0,
            buffered: true,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn env_override_server_port() {
        std::env::set_var("POSTAL_SERVER_PORT", "9999");
        let cfg = PostalConfig::from_toml("").unwrap();
        assert_eq!(cfg.server_port, 9999);
        std::env::remove_var("POSTAL_SERVER_PORT");
    }

    #[test]
    fn env_override_buffered_false() {
        std::env::set_var("POSTAL_BUFFERED", "false");
        let cfg = PostalConfig::from_toml("").unwrap();
        assert!(!cfg.buffered);
        std::env::remove_var("POSTAL_BUFFERED");
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let cfg = PostalConfig::from_toml("send_buffer_max_items = 10").unwrap();
        assert_eq!(cfg.send_buffer_max_items, 10);
        assert_eq!(cfg.receive_buffer_max_items, 262_144);
    }
}
