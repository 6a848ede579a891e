//! Device configuration files
//!
//! Parses and serializes the on-disk INI format for tether devices: one
//! `[Interface]` section and any number of `[Peer]` sections. Parsing is
//! tolerant and line-oriented: `#` comments are stripped, section
//! headers are case-insensitive, keys are case-sensitive, and unknown
//! keys are ignored silently. The device name is the file stem, not a
//! field.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use ipnet::IpNet;
use tracing::debug;

use crate::error::TetherError;
use crate::tether::engine::Key;

/// A peer's UDP endpoint in `host:port` form
///
/// Checked lexically only; no DNS resolution happens at parse time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEndpoint {
    /// Host name or literal address (without brackets)
    pub host: String,
    /// UDP port
    pub port: u16,
}

impl fmt::Display for PeerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for PeerEndpoint {
    type Err = TetherError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| TetherError::Config(format!("endpoint missing port: {}", s)))?;
        let port: u16 = port
            .parse()
            .map_err(|_| TetherError::Config(format!("invalid endpoint port: {}", s)))?;

        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if host.is_empty() {
            return Err(TetherError::Config(format!("endpoint missing host: {}", s)));
        }

        Ok(PeerEndpoint {
            host: host.to_string(),
            port,
        })
    }
}

/// The `[Interface]` section of a device config
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceSection {
    /// Subnets assigned to the device
    pub addresses: Vec<IpNet>,
    /// UDP listen port
    pub listen_port: Option<u16>,
    /// Device private key (mandatory)
    pub private_key: Key,
    /// Whether runtime changes are written back to disk
    pub save_config: bool,
    /// Shell commands run before bringing the device up
    pub pre_up: Vec<String>,
    /// Shell commands run after bringing the device up
    pub post_up: Vec<String>,
    /// Shell commands run before taking the device down
    pub pre_down: Vec<String>,
    /// Shell commands run after taking the device down
    pub post_down: Vec<String>,
}

/// One `[Peer]` section of a device config
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSection {
    /// The peer's public key (mandatory)
    pub public_key: Key,
    /// Optional preshared key
    pub preshared_key: Option<Key>,
    /// Optional UDP endpoint
    pub endpoint: Option<PeerEndpoint>,
    /// Optional keepalive interval
    pub persistent_keepalive: Option<Duration>,
    /// The peer's allowed IPs
    pub allowed_ips: Vec<IpNet>,
}

impl PeerSection {
    /// A peer section carrying only a public key
    pub fn new(public_key: Key) -> Self {
        PeerSection {
            public_key,
            preshared_key: None,
            endpoint: None,
            persistent_keepalive: None,
            allowed_ips: Vec::new(),
        }
    }
}

/// A parsed device configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Device name, taken from the file stem
    pub name: String,
    /// The interface section
    pub interface: InterfaceSection,
    /// All peer sections in file order
    pub peers: Vec<PeerSection>,
}

impl DeviceConfig {
    /// Check the config's name against the device it is meant for
    pub fn expect_name(&self, expected: &str) -> Result<(), TetherError> {
        if self.name != expected {
            return Err(TetherError::NameMismatch {
                expected: expected.to_string(),
                found: self.name.clone(),
            });
        }
        Ok(())
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Section {
    None,
    Interface,
    Peer,
}

#[derive(Default)]
struct InterfaceAcc {
    addresses: Vec<IpNet>,
    listen_port: Option<u16>,
    private_key: Option<Key>,
    save_config: bool,
    pre_up: Vec<String>,
    post_up: Vec<String>,
    pre_down: Vec<String>,
    post_down: Vec<String>,
}

#[derive(Default)]
struct PeerAcc {
    public_key: Option<Key>,
    preshared_key: Option<Key>,
    endpoint: Option<PeerEndpoint>,
    persistent_keepalive: Option<Duration>,
    allowed_ips: Vec<IpNet>,
}

impl PeerAcc {
    fn build(self) -> Result<PeerSection, TetherError> {
        Ok(PeerSection {
            public_key: self
                .public_key
                .ok_or_else(|| TetherError::Config("peer is missing PublicKey".to_string()))?,
            preshared_key: self.preshared_key,
            endpoint: self.endpoint,
            persistent_keepalive: self.persistent_keepalive,
            allowed_ips: self.allowed_ips,
        })
    }
}

/// Parse a device configuration from text
pub fn parse_device_config(name: &str, content: &str) -> Result<DeviceConfig, TetherError> {
    let mut section = Section::None;
    let mut interface_seen = false;
    let mut interface = InterfaceAcc::default();
    let mut peers: Vec<PeerSection> = Vec::new();
    let mut current_peer: Option<PeerAcc> = None;

    for (number, raw) in content.lines().enumerate() {
        let line = match raw.find('#') {
            Some(i) => &raw[..i],
            None => raw,
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(header) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            if let Some(peer) = current_peer.take() {
                peers.push(peer.build()?);
            }
            match header.trim().to_ascii_lowercase().as_str() {
                "interface" => {
                    if interface_seen {
                        return Err(TetherError::Config(
                            "multiple [Interface] sections".to_string(),
                        ));
                    }
                    interface_seen = true;
                    section = Section::Interface;
                }
                "peer" => {
                    current_peer = Some(PeerAcc::default());
                    section = Section::Peer;
                }
                other => {
                    return Err(TetherError::Config(format!(
                        "unknown section [{}] on line {}",
                        other,
                        number + 1
                    )));
                }
            }
            continue;
        }

        let (key, value) = line.split_once('=').ok_or_else(|| {
            TetherError::Config(format!("unparseable line {}: {}", number + 1, line))
        })?;
        let key = key.trim();
        let value = value.trim();

        match section {
            Section::None => {
                return Err(TetherError::Config(format!(
                    "attribute outside any section on line {}",
                    number + 1
                )));
            }
            Section::Interface => parse_interface_field(&mut interface, key, value)?,
            Section::Peer => {
                // A peer header always precedes peer attributes.
                if let Some(peer) = current_peer.as_mut() {
                    parse_peer_field(peer, key, value)?;
                }
            }
        }
    }

    if let Some(peer) = current_peer.take() {
        peers.push(peer.build()?);
    }

    if !interface_seen {
        return Err(TetherError::Config("missing [Interface] section".to_string()));
    }
    let private_key = interface
        .private_key
        .ok_or_else(|| TetherError::Config("interface is missing PrivateKey".to_string()))?;

    Ok(DeviceConfig {
        name: name.to_string(),
        interface: InterfaceSection {
            addresses: interface.addresses,
            listen_port: interface.listen_port,
            private_key,
            save_config: interface.save_config,
            pre_up: interface.pre_up,
            post_up: interface.post_up,
            pre_down: interface.pre_down,
            post_down: interface.post_down,
        },
        peers,
    })
}

fn parse_interface_field(
    acc: &mut InterfaceAcc,
    key: &str,
    value: &str,
) -> Result<(), TetherError> {
    match key {
        "Address" => {
            for part in value.split(',') {
                let part = part.trim();
                let net: IpNet = part
                    .parse()
                    .map_err(|_| TetherError::InvalidAddress(part.to_string()))?;
                acc.addresses.push(net);
            }
        }
        "ListenPort" => {
            acc.listen_port = Some(value.parse().map_err(|_| {
                TetherError::Config(format!("invalid ListenPort: {}", value))
            })?);
        }
        "PrivateKey" => acc.private_key = Some(value.parse()?),
        "SaveConfig" => {
            acc.save_config = match value.to_ascii_lowercase().as_str() {
                "true" => true,
                "false" => false,
                _ => {
                    return Err(TetherError::Config(format!(
                        "invalid SaveConfig: {}",
                        value
                    )))
                }
            };
        }
        "PreUp" => acc.pre_up.push(value.to_string()),
        "PostUp" => acc.post_up.push(value.to_string()),
        "PreDown" => acc.pre_down.push(value.to_string()),
        "PostDown" => acc.post_down.push(value.to_string()),
        unknown => debug!(key = unknown, "ignoring unknown interface key"),
    }
    Ok(())
}

fn parse_peer_field(acc: &mut PeerAcc, key: &str, value: &str) -> Result<(), TetherError> {
    match key {
        "PublicKey" => acc.public_key = Some(value.parse()?),
        "PresharedKey" => acc.preshared_key = Some(value.parse()?),
        "Endpoint" => acc.endpoint = Some(value.parse()?),
        "PersistentKeepaliveInterval" => {
            let secs = value.strip_suffix('s').unwrap_or(value);
            let secs: u64 = secs.parse().map_err(|_| {
                TetherError::Config(format!("invalid PersistentKeepaliveInterval: {}", value))
            })?;
            acc.persistent_keepalive = Some(Duration::from_secs(secs));
        }
        "AllowedIPs" => {
            for part in value.split(',') {
                let part = part.trim();
                let net: IpNet = part
                    .parse()
                    .map_err(|_| TetherError::InvalidAddress(part.to_string()))?;
                acc.allowed_ips.push(net);
            }
        }
        unknown => debug!(key = unknown, "ignoring unknown peer key"),
    }
    Ok(())
}

/// Serialize a device configuration to text
///
/// Field order is stable; unset and zero-valued fields are omitted.
pub fn serialize_device_config(config: &DeviceConfig) -> String {
    let mut out = String::from("[Interface]\n");
    let iface = &config.interface;

    if !iface.addresses.is_empty() {
        let list: Vec<String> = iface.addresses.iter().map(|n| n.to_string()).collect();
        out.push_str(&format!("Address = {}\n", list.join(", ")));
    }
    if let Some(port) = iface.listen_port {
        out.push_str(&format!("ListenPort = {}\n", port));
    }
    out.push_str(&format!("PrivateKey = {}\n", iface.private_key));
    if iface.save_config {
        out.push_str("SaveConfig = true\n");
    }
    for cmd in &iface.pre_up {
        out.push_str(&format!("PreUp = {}\n", cmd));
    }
    for cmd in &iface.post_up {
        out.push_str(&format!("PostUp = {}\n", cmd));
    }
    for cmd in &iface.pre_down {
        out.push_str(&format!("PreDown = {}\n", cmd));
    }
    for cmd in &iface.post_down {
        out.push_str(&format!("PostDown = {}\n", cmd));
    }

    for peer in &config.peers {
        out.push('\n');
        out.push_str("[Peer]\n");
        out.push_str(&format!("PublicKey = {}\n", peer.public_key));
        if let Some(psk) = &peer.preshared_key {
            out.push_str(&format!("PresharedKey = {}\n", psk));
        }
        if !peer.allowed_ips.is_empty() {
            let list: Vec<String> = peer.allowed_ips.iter().map(|n| n.to_string()).collect();
            out.push_str(&format!("AllowedIPs = {}\n", list.join(", ")));
        }
        if let Some(endpoint) = &peer.endpoint {
            out.push_str(&format!("Endpoint = {}\n", endpoint));
        }
        if let Some(keepalive) = peer.persistent_keepalive {
            out.push_str(&format!(
                "PersistentKeepaliveInterval = {}\n",
                keepalive.as_secs()
            ));
        }
    }

    out
}

/// Load a device configuration from disk; the name is the file stem
pub fn load_device_config(path: &Path) -> Result<DeviceConfig, TetherError> {
    let name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| TetherError::Config(format!("bad config path: {}", path.display())))?;

    let content = std::fs::read_to_string(path)?;
    parse_device_config(name, &content)
}

/// Write a device configuration to disk with 0644 permissions
pub fn save_device_config(path: &Path, config: &DeviceConfig) -> Result<(), TetherError> {
    std::fs::write(path, serialize_device_config(config))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(path)?.permissions();
        perms.set_mode(0o644);
        std::fs::set_permissions(path, perms)?;
    }

    Ok(())
}
