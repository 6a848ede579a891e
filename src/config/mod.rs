//! Configuration module for Shroud
//!
//! This module provides configuration types and parsing for the relay
//! daemon.

mod extender;

pub use extender::{ExtenderConfig, ExtenderServerConfig};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Relay server settings
    #[serde(default)]
    pub extender: ExtenderServerConfig,
}

/// Load configuration from a TOML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    parse_config(&content).with_context(|| format!("in config file {}", path.display()))
}

/// Parse configuration from a TOML string
pub fn parse_config(content: &str) -> Result<Config> {
    Ok(toml::from_str(content)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let config_str = r#"
[extender]
allow = ["*.permitted.test"]
"#;

        let config = parse_config(config_str).unwrap();
        assert_eq!(config.extender.ports, vec![8443]);
        assert_eq!(config.extender.allow, vec!["*.permitted.test".to_string()]);
    }

    #[test]
    fn test_parse_full_config() {
        let config_str = r#"
[extender]
ports = [443, 8443]
allow = ["upstream.test", "*.permitted.test"]
organization = "Front Door Networks"
read_timeout_secs = 15
write_timeout_secs = 20
"#;

        let config = parse_config(config_str).unwrap();
        assert_eq!(config.extender.ports, vec![443, 8443]);
        assert_eq!(config.extender.allow.len(), 2);
        assert_eq!(config.extender.organization, "Front Door Networks");
        assert_eq!(config.extender.read_timeout_secs, 15);
        assert_eq!(config.extender.write_timeout_secs, 20);
    }

    #[test]
    fn test_parse_empty_config() {
        let config = parse_config("").unwrap();
        assert_eq!(config.extender.ports, vec![8443]);
    }
}
