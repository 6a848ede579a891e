//! Error types for Shroud
//!
//! This module defines all custom error types used throughout the application.

use std::io;
use thiserror::Error;

use crate::tether::endpoints::EndpointKind;

/// Errors surfaced by the extender data plane
///
/// Every variant is fatal to the affected connection only; the server
/// never terminates because a single tunnel failed.
#[derive(Error, Debug)]
pub enum ExtenderError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// On-demand certificate minting failed
    #[error("cert mint failed: {0}")]
    CertMint(String),

    /// TLS handshake (client or server side) did not complete
    #[error("TLS handshake failed: {0}")]
    Handshake(String),

    /// Header length out of bounds or decode failure
    #[error("malformed header frame: {0}")]
    Framing(String),

    /// Allow-list rejected the declared destination
    #[error("destination forbidden: {0}")]
    DestinationForbidden(String),

    /// Dial to the true destination failed
    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    /// Read or write deadline exceeded on the tunnel
    #[error("IO timeout during {0}")]
    IoTimeout(String),

    /// The connection context was canceled during shutdown
    ///
    /// Not a failure: callers tear down silently.
    #[error("connection canceled")]
    Canceled,
}

impl ExtenderError {
    /// Whether this error is a clean-shutdown cancellation rather than a
    /// genuine failure.
    pub fn is_canceled(&self) -> bool {
        matches!(self, ExtenderError::Canceled)
    }
}

/// Errors surfaced by the tether (device registry, allocator, peer
/// manager, endpoint directory, and INI config layer)
#[derive(Error, Debug)]
pub enum TetherError {
    /// A device with this name is already registered
    #[error("device already exists: {0}")]
    DeviceExists(String),

    /// No device registered under this name
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// The string does not parse as a CIDR block
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// The CIDR has host bits set (it is not the network address)
    #[error("not a network address: {0}")]
    NotNetworkAddress(String),

    /// A config file's interface name does not match the expected device
    #[error("device name mismatch: expected {expected}, found {found}")]
    NameMismatch {
        /// The device name the caller asked for
        expected: String,
        /// The name carried by the configuration
        found: String,
    },

    /// The device has no configured subnet for the requested family
    #[error("no addresses found")]
    NoAddressesFound,

    /// Every configured subnet is fully allocated
    #[error("no available IP")]
    NoAvailableIp,

    /// The device already has a peer with this public key
    #[error("peer already exists: {0}")]
    PeerExists(String),

    /// The device has no peer with this public key
    #[error("peer not found: {0}")]
    PeerNotFound(String),

    /// The endpoint kind is not one of ipv4, ipv6, domain, any
    #[error("invalid endpoint type: {0}")]
    InvalidEndpointType(String),

    /// No endpoint of the requested kind is present in the directory
    #[error("endpoint not found: {0}")]
    EndpointNotFound(EndpointKind),

    /// The virtual kind `any` is read-only
    #[error("cannot add an endpoint of kind \"any\"")]
    EndpointAddAny,

    /// A WireGuard key failed to decode (base64, 32 bytes)
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Structural error in a device configuration file
    #[error("configuration error: {0}")]
    Config(String),

    /// The WireGuard engine rejected an IPC operation
    #[error("engine error: {0}")]
    Engine(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}
