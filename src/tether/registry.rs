//! Device registry
//!
//! Named userspace WireGuard devices and the only mutation path to
//! their engines. Mutations are not internally synchronized: callers
//! serialize writes (the control HTTP surface does exactly that with a
//! mutex around the registry).

use std::collections::HashMap;

use ipnet::IpNet;
use tracing::{debug, info};

use crate::error::TetherError;
use crate::tether::engine::{ConfigDelta, DeviceSnapshot, Key, PeerSnapshot, TunEvent, WgEngine};

/// One registered device
#[derive(Debug)]
pub struct Device {
    name: String,
    engine: Box<dyn WgEngine>,
    addresses: Vec<IpNet>,
}

impl Device {
    /// The device's registry name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The device's configured subnets
    pub fn addresses(&self) -> &[IpNet] {
        &self.addresses
    }
}

/// A point-in-time view of one device
#[derive(Debug, Clone)]
pub struct DeviceView {
    /// Registry name
    pub name: String,
    /// Device private key
    pub private_key: Option<Key>,
    /// Device public key
    pub public_key: Option<Key>,
    /// UDP listen port
    pub listen_port: u16,
    /// Firewall mark
    pub fwmark: u32,
    /// Current peers
    pub peers: Vec<PeerSnapshot>,
}

impl DeviceView {
    fn from_snapshot(name: &str, snapshot: DeviceSnapshot) -> Self {
        DeviceView {
            name: name.to_string(),
            private_key: snapshot.private_key,
            public_key: snapshot.public_key,
            listen_port: snapshot.listen_port,
            fwmark: snapshot.fwmark,
            peers: snapshot.peers,
        }
    }
}

/// Registry of named WireGuard devices
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: HashMap<String, Device>,
}

impl DeviceRegistry {
    /// An empty registry
    pub fn new() -> Self {
        DeviceRegistry::default()
    }

    /// Register a device under a unique name
    ///
    /// Every address must be a CIDR whose host bits are zero.
    pub fn add(
        &mut self,
        name: &str,
        engine: Box<dyn WgEngine>,
        addresses: &[String],
    ) -> Result<(), TetherError> {
        if self.devices.contains_key(name) {
            return Err(TetherError::DeviceExists(name.to_string()));
        }

        let addresses = parse_network_addresses(addresses)?;
        info!(device = name, subnets = addresses.len(), "device registered");

        self.devices.insert(
            name.to_string(),
            Device {
                name: name.to_string(),
                engine,
                addresses,
            },
        );
        Ok(())
    }

    /// Remove a device, closing its engine
    pub fn remove(&mut self, name: &str) -> Result<(), TetherError> {
        let mut device = self
            .devices
            .remove(name)
            .ok_or_else(|| TetherError::DeviceNotFound(name.to_string()))?;
        device.engine.close();
        info!(device = name, "device removed");
        Ok(())
    }

    /// All registered device names, sorted
    pub fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.devices.keys().cloned().collect();
        names.sort();
        names
    }

    /// Snapshot a device's current state
    pub fn get(&self, name: &str) -> Result<DeviceView, TetherError> {
        let device = self.device(name)?;
        let snapshot = device.engine.ipc_get()?;
        Ok(DeviceView::from_snapshot(name, snapshot))
    }

    /// Apply a configuration delta to a device
    pub fn configure(&mut self, name: &str, delta: &ConfigDelta) -> Result<(), TetherError> {
        debug!(device = name, peers = delta.peers.len(), "configuring device");
        self.device_mut(name)?.engine.ipc_set(delta)
    }

    /// Drive a device's administrative state
    pub fn add_event(&mut self, name: &str, event: TunEvent) -> Result<(), TetherError> {
        self.device_mut(name)?.engine.add_event(event)
    }

    /// Add subnets to a device, optionally replacing the existing list
    pub fn add_addresses(
        &mut self,
        name: &str,
        addresses: &[String],
        replace: bool,
    ) -> Result<(), TetherError> {
        let parsed = parse_network_addresses(addresses)?;
        let device = self.device_mut(name)?;
        if replace {
            device.addresses = parsed;
        } else {
            device.addresses.extend(parsed);
        }
        Ok(())
    }

    /// A device's configured subnets
    pub fn get_addresses(&self, name: &str) -> Result<Vec<IpNet>, TetherError> {
        Ok(self.device(name)?.addresses.clone())
    }

    /// Tear down every device and empty the registry
    pub fn close(&mut self) {
        for (name, device) in self.devices.iter_mut() {
            debug!(device = %name, "closing engine");
            device.engine.close();
        }
        self.devices.clear();
    }

    fn device(&self, name: &str) -> Result<&Device, TetherError> {
        self.devices
            .get(name)
            .ok_or_else(|| TetherError::DeviceNotFound(name.to_string()))
    }

    fn device_mut(&mut self, name: &str) -> Result<&mut Device, TetherError> {
        self.devices
            .get_mut(name)
            .ok_or_else(|| TetherError::DeviceNotFound(name.to_string()))
    }
}

/// Parse address strings, insisting each is a network address
fn parse_network_addresses(addresses: &[String]) -> Result<Vec<IpNet>, TetherError> {
    addresses
        .iter()
        .map(|s| {
            let net: IpNet = s
                .parse()
                .map_err(|_| TetherError::InvalidAddress(s.clone()))?;
            if net.addr() != net.network() {
                return Err(TetherError::NotNetworkAddress(s.clone()));
            }
            Ok(net)
        })
        .collect()
}
