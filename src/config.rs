//! ryuldn_bridge/src/config.rs
//! Host-supplied configuration (sec. 6/10): a `serde`-deserialized struct
//! with `#[serde(default = "...")]` per field, set wholesale through the
//! FFI surface and validated before it's allowed to take effect.

use serde::Deserialize;

use crate::error::{LdnError, Result};

fn default_server_port() -> u16 {
    30456
}

fn default_logging_level() -> u8 {
    3
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server_host: String,
    #[serde(default = "default_server_port")]
    pub server_port: u16,
    #[serde(default)]
    pub passphrase: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub logging_enabled: bool,
    #[serde(default = "default_logging_level")]
    pub logging_level: u8,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server_host: String::new(),
            server_port: default_server_port(),
            passphrase: String::new(),
            enabled: false,
            logging_enabled: false,
            logging_level: default_logging_level(),
        }
    }
}

impl Config {
    /// Validates the fields the wire protocol and logging setup both rely
    /// on: an empty passphrase means "public network" (sec. 4.8's private
    /// token path), but a non-empty one must match the `Ryujinx-XXXXXXXX`
    /// form the master relay expects.
    pub fn validate(&self) -> Result<()> {
        if self.enabled && self.server_host.is_empty() {
            return Err(LdnError::InvalidConfig("server_host must be set when enabled"));
        }
        if !self.passphrase.is_empty() && !is_valid_passphrase(&self.passphrase) {
            return Err(LdnError::InvalidConfig("passphrase must match Ryujinx-XXXXXXXX"));
        }
        if !(1..=5).contains(&self.logging_level) {
            return Err(LdnError::InvalidConfig("logging_level must be in 1..=5"));
        }
        Ok(())
    }
}

fn is_valid_passphrase(p: &str) -> bool {
    let Some(hex) = p.strip_prefix("Ryujinx-") else { return false };
    hex.len() == 8 && hex.chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_disabled_and_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn enabled_without_host_is_rejected() {
        let config = Config { enabled: true, ..Config::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn passphrase_must_match_expected_shape() {
        let mut config = Config { passphrase: "Ryujinx-deadbeef".into(), ..Config::default() };
        assert!(config.validate().is_ok());
        config.passphrase = "not-a-passphrase".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn logging_level_out_of_range_is_rejected() {
        let config = Config { logging_level: 9, ..Config::default() };
        assert!(config.validate().is_err());
    }
}
