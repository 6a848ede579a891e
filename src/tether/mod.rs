//! Tether: userspace WireGuard management
//!
//! An in-process manager for named WireGuard devices: peer lifecycle,
//! per-device address pool allocation, textual configuration round-trip,
//! and a small HTTP control surface for handing out client configs. The
//! cryptographic engine itself is an external collaborator consumed
//! through the [`engine::WgEngine`] capability trait.

pub mod endpoints;
pub mod engine;
pub mod http;
pub mod ini;
pub mod peers;
pub mod pool;
pub mod registry;

pub use endpoints::{EndpointDirectory, EndpointKind};
pub use engine::{ConfigDelta, DeviceSnapshot, Key, PeerDelta, PeerSnapshot, TunEvent, WgEngine};
pub use ini::{load_device_config, parse_device_config, serialize_device_config, DeviceConfig};
pub use peers::PeerManager;
pub use pool::{next_available, IpFamily};
pub use registry::{DeviceRegistry, DeviceView};
