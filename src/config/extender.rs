//! Extender configuration types

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::extender::allowlist::AllowList;

/// Client-side connect descriptor
///
/// The spoof host and the destination host are independent strings: the
/// spoof host is what an observer sees in the TLS SNI toward the relay,
/// the destination is where the relay actually splices the bytes.
/// Immutable for the lifetime of a dialer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtenderConfig {
    /// Hostname sent as TLS SNI to the relay
    pub spoof_host: String,
    /// Relay IP address (an extender listener)
    pub relay_ip: IpAddr,
    /// Relay TCP port
    pub relay_port: u16,
    /// True destination host declared in the tunnel header
    pub destination_host: String,
    /// True destination port
    pub destination_port: u16,
}

impl ExtenderConfig {
    /// The relay's socket address
    pub fn relay_addr(&self) -> SocketAddr {
        SocketAddr::new(self.relay_ip, self.relay_port)
    }
}

fn default_ports() -> Vec<u16> {
    vec![8443]
}

fn default_organization() -> String {
    "Example Networks".to_string()
}

fn default_read_timeout_secs() -> u64 {
    30
}

fn default_write_timeout_secs() -> u64 {
    30
}

/// Server-side settings for the `[extender]` TOML section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtenderServerConfig {
    /// TCP ports to listen on (default: 8443)
    #[serde(default = "default_ports")]
    pub ports: Vec<u16>,

    /// Destination patterns the relay will splice to; exact hosts or
    /// `*.suffix` wildcards. Empty means deny everything.
    #[serde(default)]
    pub allow: Vec<String>,

    /// Organization name stamped into minted certificates
    #[serde(default = "default_organization")]
    pub organization: String,

    /// Per-operation read deadline on tunnel IO, seconds (default: 30)
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,

    /// Per-operation write deadline on tunnel IO, seconds (default: 30)
    #[serde(default = "default_write_timeout_secs")]
    pub write_timeout_secs: u64,
}

impl Default for ExtenderServerConfig {
    fn default() -> Self {
        ExtenderServerConfig {
            ports: default_ports(),
            allow: Vec::new(),
            organization: default_organization(),
            read_timeout_secs: default_read_timeout_secs(),
            write_timeout_secs: default_write_timeout_secs(),
        }
    }
}

impl ExtenderServerConfig {
    /// The configured allow-list
    pub fn allowlist(&self) -> AllowList {
        AllowList::new(self.allow.iter().cloned())
    }

    /// Read deadline as a [`Duration`]
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    /// Write deadline as a [`Duration`]
    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_addr() {
        let config = ExtenderConfig {
            spoof_host: "www.example.com".to_string(),
            relay_ip: "127.0.0.1".parse().unwrap(),
            relay_port: 8443,
            destination_host: "upstream.test".to_string(),
            destination_port: 443,
        };
        assert_eq!(config.relay_addr().to_string(), "127.0.0.1:8443");
    }

    #[test]
    fn test_server_config_defaults() {
        let config = ExtenderServerConfig::default();
        assert_eq!(config.ports, vec![8443]);
        assert!(config.allow.is_empty());
        assert_eq!(config.read_timeout(), Duration::from_secs(30));
        assert_eq!(config.write_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_server_config_allowlist() {
        let config = ExtenderServerConfig {
            allow: vec!["*.permitted.test".to_string()],
            ..Default::default()
        };
        let list = config.allowlist();
        assert!(list.matches("a.permitted.test"));
        assert!(!list.matches("permitted.test"));
    }
}
