//! Peer lifecycle
//!
//! Adds and removes peers on registered devices and emits client-ready
//! configuration documents for new peers. Peers bring their own public
//! keys; the tether never synthesizes identities. Addresses come from
//! the device's pool when the caller does not supply one.

use std::sync::Arc;

use ipnet::IpNet;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::TetherError;
use crate::tether::endpoints::{EndpointDirectory, EndpointKind};
use crate::tether::engine::{ConfigDelta, Key, PeerDelta};
use crate::tether::pool::{next_available, IpFamily};
use crate::tether::registry::{DeviceRegistry, DeviceView};

/// Manager for peer add/remove and client config emission
///
/// Holds the registry behind a mutex; every operation takes the lock for
/// its duration, which is what serializes control-surface writes.
#[derive(Debug)]
pub struct PeerManager {
    registry: Arc<Mutex<DeviceRegistry>>,
    endpoints: EndpointDirectory,
}

impl PeerManager {
    /// Create a manager over a shared registry
    pub fn new(registry: Arc<Mutex<DeviceRegistry>>, endpoints: EndpointDirectory) -> Self {
        PeerManager {
            registry,
            endpoints,
        }
    }

    /// The shared registry handle
    pub fn registry(&self) -> Arc<Mutex<DeviceRegistry>> {
        self.registry.clone()
    }

    /// Add a peer to a device, allocating its address from the pool
    ///
    /// The new peer's allowed IPs become the singleton allocated address.
    /// Returns that address.
    pub async fn add_peer(&self, device: &str, pubkey: &Key) -> Result<IpNet, TetherError> {
        let mut registry = self.registry.lock().await;

        let view = registry.get(device)?;
        if view.peers.iter().any(|p| p.public_key == *pubkey) {
            return Err(TetherError::PeerExists(pubkey.to_string()));
        }

        let used: Vec<IpNet> = view
            .peers
            .iter()
            .flat_map(|p| p.allowed_ips.iter().cloned())
            .collect();
        let addresses = registry.get_addresses(device)?;
        let address = next_available(&addresses, &used, IpFamily::V4)?;

        let mut peer = PeerDelta::new(*pubkey);
        peer.allowed_ips = vec![address];
        registry.configure(
            device,
            &ConfigDelta {
                peers: vec![peer],
                ..Default::default()
            },
        )?;

        debug!(device, peer = %pubkey, address = %address, "peer added");
        Ok(address)
    }

    /// Remove a peer from a device
    ///
    /// Idempotent: removing a peer that does not exist succeeds.
    pub async fn remove_peer(&self, device: &str, pubkey: &Key) -> Result<(), TetherError> {
        let mut registry = self.registry.lock().await;
        registry.configure(
            device,
            &ConfigDelta {
                peers: vec![PeerDelta::removal(*pubkey)],
                ..Default::default()
            },
        )?;
        debug!(device, peer = %pubkey, "peer removed");
        Ok(())
    }

    /// Emit the client-ready config document for an existing peer
    pub async fn get_peer_config(
        &self,
        device: &str,
        pubkey: &Key,
        endpoint_kind: EndpointKind,
    ) -> Result<String, TetherError> {
        let endpoint = self.endpoints.resolve(endpoint_kind)?.to_string();

        let registry = self.registry.lock().await;
        let view = registry.get(device)?;
        let peer = view
            .peers
            .iter()
            .find(|p| p.public_key == *pubkey)
            .ok_or_else(|| TetherError::PeerNotFound(pubkey.to_string()))?;

        let allowed_ips: Vec<String> = peer.allowed_ips.iter().map(|n| n.to_string()).collect();
        Ok(render_client_config(
            pubkey,
            &view,
            &allowed_ips.join(", "),
            &endpoint,
        ))
    }

    /// Add a peer and emit its config, undoing the add on failure
    pub async fn add_peer_and_get_config(
        &self,
        device: &str,
        pubkey: &Key,
        endpoint_kind: EndpointKind,
    ) -> Result<String, TetherError> {
        self.add_peer(device, pubkey).await?;

        match self.get_peer_config(device, pubkey, endpoint_kind).await {
            Ok(config) => Ok(config),
            Err(e) => {
                let _ = self.remove_peer(device, pubkey).await;
                Err(e)
            }
        }
    }
}

/// Fill the client config template
fn render_client_config(
    pubkey: &Key,
    view: &DeviceView,
    allowed_ips: &str,
    endpoint: &str,
) -> String {
    let device_public_key = view
        .public_key
        .map(|k| k.to_string())
        .unwrap_or_default();

    format!(
        "# Config for public key \"{pubkey}\"\n\
         [Interface]\n\
         PrivateKey = __PLACEHOLDER__ # replace with your private key\n\
         Address = {allowed_ips}\n\
         DNS = 1.1.1.1, 8.8.8.8\n\
         \n\
         [Peer]\n\
         PublicKey = {device_public_key}\n\
         AllowedIPs = 0.0.0.0/0\n\
         Endpoint = {endpoint}:{port}\n",
        port = view.listen_port,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tether::engine::mock::MockEngine;

    fn key(byte: u8) -> Key {
        Key::from_bytes([byte; 32])
    }

    async fn manager_with_device() -> PeerManager {
        let engine = MockEngine::new()
            .with_keys(key(100), key(101))
            .with_listen_port(51820);

        let mut registry = DeviceRegistry::new();
        registry
            .add("wg0", Box::new(engine), &["10.0.0.0/24".to_string()])
            .unwrap();

        let mut endpoints = EndpointDirectory::new();
        endpoints.set(EndpointKind::Ipv4, "203.0.113.5").unwrap();

        PeerManager::new(Arc::new(Mutex::new(registry)), endpoints)
    }

    #[tokio::test]
    async fn test_add_peer_allocates_from_pool() {
        let manager = manager_with_device().await;

        let first = manager.add_peer("wg0", &key(1)).await.unwrap();
        assert_eq!(first, "10.0.0.1/32".parse::<IpNet>().unwrap());

        let second = manager.add_peer("wg0", &key(2)).await.unwrap();
        assert_eq!(second, "10.0.0.2/32".parse::<IpNet>().unwrap());
    }

    #[tokio::test]
    async fn test_add_peer_twice_fails() {
        let manager = manager_with_device().await;

        manager.add_peer("wg0", &key(1)).await.unwrap();
        let err = manager.add_peer("wg0", &key(1)).await.unwrap_err();
        assert!(matches!(err, TetherError::PeerExists(_)));
    }

    #[tokio::test]
    async fn test_remove_peer_is_idempotent() {
        let manager = manager_with_device().await;

        manager.add_peer("wg0", &key(1)).await.unwrap();
        manager.remove_peer("wg0", &key(1)).await.unwrap();
        manager.remove_peer("wg0", &key(1)).await.unwrap();

        let registry = manager.registry();
        let registry = registry.lock().await;
        assert!(registry.get("wg0").unwrap().peers.is_empty());
    }

    #[tokio::test]
    async fn test_peer_config_contents() {
        let manager = manager_with_device().await;
        manager.add_peer("wg0", &key(1)).await.unwrap();

        let config = manager
            .get_peer_config("wg0", &key(1), EndpointKind::Ipv4)
            .await
            .unwrap();

        assert_eq!(config.matches("[Interface]").count(), 1);
        assert_eq!(config.matches("[Peer]").count(), 1);
        assert!(config.contains(&format!("# Config for public key \"{}\"", key(1))));
        assert!(config.contains("Address = 10.0.0.1/32"));
        assert!(config.contains(&format!("PublicKey = {}", key(101))));
        assert!(config.contains("Endpoint = 203.0.113.5:51820"));
        assert!(config.contains("PrivateKey = __PLACEHOLDER__"));
    }

    #[tokio::test]
    async fn test_peer_config_unknown_peer() {
        let manager = manager_with_device().await;
        let err = manager
            .get_peer_config("wg0", &key(9), EndpointKind::Ipv4)
            .await
            .unwrap_err();
        assert!(matches!(err, TetherError::PeerNotFound(_)));
    }

    #[tokio::test]
    async fn test_peer_config_any_endpoint() {
        let manager = manager_with_device().await;
        manager.add_peer("wg0", &key(1)).await.unwrap();

        let config = manager
            .get_peer_config("wg0", &key(1), EndpointKind::Any)
            .await
            .unwrap();
        assert!(config.contains("Endpoint = 203.0.113.5:51820"));
    }

    #[tokio::test]
    async fn test_add_and_get_config_rolls_back_on_failure() {
        // No ipv6 endpoint configured: config emission fails after the
        // add, so the peer must be gone again afterwards.
        let manager = manager_with_device().await;

        let err = manager
            .add_peer_and_get_config("wg0", &key(1), EndpointKind::Ipv6)
            .await
            .unwrap_err();
        assert!(matches!(err, TetherError::EndpointNotFound(_)));

        let registry = manager.registry();
        let registry = registry.lock().await;
        assert!(registry.get("wg0").unwrap().peers.is_empty());
    }

    #[tokio::test]
    async fn test_add_and_get_config_success() {
        let manager = manager_with_device().await;

        let config = manager
            .add_peer_and_get_config("wg0", &key(1), EndpointKind::Ipv4)
            .await
            .unwrap();
        assert!(config.contains("Endpoint = 203.0.113.5:51820"));

        let registry = manager.registry();
        let registry = registry.lock().await;
        assert_eq!(registry.get("wg0").unwrap().peers.len(), 1);
    }

    #[tokio::test]
    async fn test_pool_exhaustion_propagates() {
        let engine = MockEngine::new().with_keys(key(100), key(101));
        let mut registry = DeviceRegistry::new();
        registry
            .add("wg0", Box::new(engine), &["10.0.0.0/30".to_string()])
            .unwrap();

        let manager = PeerManager::new(
            Arc::new(Mutex::new(registry)),
            EndpointDirectory::new(),
        );

        manager.add_peer("wg0", &key(1)).await.unwrap();
        manager.add_peer("wg0", &key(2)).await.unwrap();
        let err = manager.add_peer("wg0", &key(3)).await.unwrap_err();
        assert!(matches!(err, TetherError::NoAvailableIp));
    }
}
