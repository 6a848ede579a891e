//! WireGuard engine capability contract
//!
//! The tether drives WireGuard engines through a narrow capability set:
//! close, administrative tun events, and IPC-style get/set of the device
//! configuration. The cryptographic engine and packet plumbing live
//! behind this trait; the registry holds engines as trait objects so
//! production engines and test doubles are interchangeable.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ipnet::IpNet;

use crate::error::TetherError;

/// A 32-byte WireGuard key (public, private, or preshared)
///
/// Text form is standard base64, as in `wg` tooling.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Key([u8; 32]);

impl Key {
    /// Wrap raw key bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Key(bytes)
    }

    /// The raw key bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", BASE64.encode(self.0))
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", BASE64.encode(self.0))
    }
}

impl FromStr for Key {
    type Err = TetherError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let decoded = BASE64
            .decode(s)
            .map_err(|_| TetherError::InvalidKey(format!("not valid base64: {}", s)))?;
        if decoded.len() != 32 {
            return Err(TetherError::InvalidKey(format!(
                "expected 32 bytes, got {}",
                decoded.len()
            )));
        }
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&decoded);
        Ok(Key(bytes))
    }
}

/// Administrative tun state events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunEvent {
    /// Bring the device up
    Up,
    /// Take the device down
    Down,
}

/// Partial per-peer configuration for `ipc_set`
#[derive(Debug, Clone)]
pub struct PeerDelta {
    /// The peer this record addresses
    pub public_key: Key,
    /// Remove the peer instead of configuring it
    pub remove: bool,
    /// Only apply when the peer already exists
    pub update_only: bool,
    /// Replace the peer's allowed IPs instead of appending
    pub replace_allowed_ips: bool,
    /// Preshared key to set
    pub preshared_key: Option<Key>,
    /// UDP endpoint to set
    pub endpoint: Option<SocketAddr>,
    /// Persistent keepalive interval to set
    pub persistent_keepalive: Option<Duration>,
    /// Allowed-IPs entries to apply
    pub allowed_ips: Vec<IpNet>,
}

impl PeerDelta {
    /// A delta that leaves everything but the key unset
    pub fn new(public_key: Key) -> Self {
        PeerDelta {
            public_key,
            remove: false,
            update_only: false,
            replace_allowed_ips: false,
            preshared_key: None,
            endpoint: None,
            persistent_keepalive: None,
            allowed_ips: Vec::new(),
        }
    }

    /// A delta that removes an existing peer, if present
    pub fn removal(public_key: Key) -> Self {
        PeerDelta {
            remove: true,
            update_only: true,
            ..PeerDelta::new(public_key)
        }
    }
}

/// Partial device configuration for `ipc_set`
///
/// Fields left unset are not applied.
#[derive(Debug, Clone, Default)]
pub struct ConfigDelta {
    /// Device private key
    pub private_key: Option<Key>,
    /// UDP listen port
    pub listen_port: Option<u16>,
    /// Firewall mark
    pub fwmark: Option<u32>,
    /// Drop all existing peers before applying the peer records
    pub replace_peers: bool,
    /// Per-peer records
    pub peers: Vec<PeerDelta>,
}

/// One peer as reported by `ipc_get`
#[derive(Debug, Clone)]
pub struct PeerSnapshot {
    /// The peer's public key
    pub public_key: Key,
    /// Configured preshared key
    pub preshared_key: Option<Key>,
    /// Configured UDP endpoint
    pub endpoint: Option<SocketAddr>,
    /// Configured keepalive interval
    pub persistent_keepalive: Option<Duration>,
    /// The peer's allowed IPs
    pub allowed_ips: Vec<IpNet>,
}

/// Device state as reported by `ipc_get`
#[derive(Debug, Clone, Default)]
pub struct DeviceSnapshot {
    /// Device private key
    pub private_key: Option<Key>,
    /// Device public key
    pub public_key: Option<Key>,
    /// UDP listen port
    pub listen_port: u16,
    /// Firewall mark
    pub fwmark: u32,
    /// All configured peers
    pub peers: Vec<PeerSnapshot>,
}

/// The capability set the tether consumes from a WireGuard engine
pub trait WgEngine: Send + fmt::Debug {
    /// Release OS resources held by the engine
    fn close(&mut self);

    /// Drive the engine's administrative state
    fn add_event(&mut self, event: TunEvent) -> Result<(), TetherError>;

    /// Apply a partial configuration
    fn ipc_set(&mut self, delta: &ConfigDelta) -> Result<(), TetherError>;

    /// Snapshot the current configuration
    fn ipc_get(&self) -> Result<DeviceSnapshot, TetherError>;
}

#[cfg(test)]
pub mod mock {
    //! In-memory engine double for tests

    use std::sync::{Arc, Mutex};

    use super::*;

    /// Observable state behind a [`MockEngine`]
    #[derive(Debug, Default)]
    pub struct MockState {
        /// The emulated device configuration
        pub snapshot: DeviceSnapshot,
        /// Whether close() ran
        pub closed: bool,
        /// Events received, in order
        pub events: Vec<TunEvent>,
    }

    /// Engine double that applies deltas to an in-memory snapshot
    #[derive(Debug, Clone)]
    pub struct MockEngine {
        state: Arc<Mutex<MockState>>,
    }

    impl MockEngine {
        /// A fresh, unconfigured engine
        pub fn new() -> Self {
            MockEngine {
                state: Arc::new(Mutex::new(MockState::default())),
            }
        }

        /// Pre-set device keys
        pub fn with_keys(self, private_key: Key, public_key: Key) -> Self {
            {
                let mut state = self.state.lock().unwrap();
                state.snapshot.private_key = Some(private_key);
                state.snapshot.public_key = Some(public_key);
            }
            self
        }

        /// Pre-set the listen port
        pub fn with_listen_port(self, port: u16) -> Self {
            self.state.lock().unwrap().snapshot.listen_port = port;
            self
        }

        /// Handle for asserting on engine state after the registry has
        /// taken ownership of the boxed engine
        pub fn handle(&self) -> Arc<Mutex<MockState>> {
            self.state.clone()
        }
    }

    impl WgEngine for MockEngine {
        fn close(&mut self) {
            self.state.lock().unwrap().closed = true;
        }

        fn add_event(&mut self, event: TunEvent) -> Result<(), TetherError> {
            self.state.lock().unwrap().events.push(event);
            Ok(())
        }

        fn ipc_set(&mut self, delta: &ConfigDelta) -> Result<(), TetherError> {
            let mut state = self.state.lock().unwrap();
            let snapshot = &mut state.snapshot;

            if let Some(key) = delta.private_key {
                snapshot.private_key = Some(key);
            }
            if let Some(port) = delta.listen_port {
                snapshot.listen_port = port;
            }
            if let Some(fwmark) = delta.fwmark {
                snapshot.fwmark = fwmark;
            }
            if delta.replace_peers {
                snapshot.peers.clear();
            }

            for peer in &delta.peers {
                let existing = snapshot
                    .peers
                    .iter()
                    .position(|p| p.public_key == peer.public_key);

                if peer.remove {
                    if let Some(i) = existing {
                        snapshot.peers.remove(i);
                    }
                    continue;
                }

                match existing {
                    Some(i) => {
                        let entry = &mut snapshot.peers[i];
                        if peer.replace_allowed_ips {
                            entry.allowed_ips = peer.allowed_ips.clone();
                        } else {
                            entry.allowed_ips.extend(peer.allowed_ips.iter().cloned());
                        }
                        if peer.preshared_key.is_some() {
                            entry.preshared_key = peer.preshared_key;
                        }
                        if peer.endpoint.is_some() {
                            entry.endpoint = peer.endpoint;
                        }
                        if peer.persistent_keepalive.is_some() {
                            entry.persistent_keepalive = peer.persistent_keepalive;
                        }
                    }
                    None => {
                        if peer.update_only {
                            continue;
                        }
                        snapshot.peers.push(PeerSnapshot {
                            public_key: peer.public_key,
                            preshared_key: peer.preshared_key,
                            endpoint: peer.endpoint,
                            persistent_keepalive: peer.persistent_keepalive,
                            allowed_ips: peer.allowed_ips.clone(),
                        });
                    }
                }
            }

            Ok(())
        }

        fn ipc_get(&self) -> Result<DeviceSnapshot, TetherError> {
            Ok(self.state.lock().unwrap().snapshot.clone())
        }
    }
}
