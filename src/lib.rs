//! # Shroud - TLS-Fronted Covert Relay
//!
//! Shroud lets a client reach an arbitrary upstream host through an
//! intermediate relay that, to any on-path observer, looks like a normal
//! TLS server on a well-known port answering for a "spoof" hostname.
//! Alongside the relay it ships a userspace WireGuard management layer
//! whose devices and peers are driven at runtime.
//!
//! ## Features
//!
//! - **Extender dialer**: TLS to the relay under a spoof SNI, one
//!   length-prefixed header naming the true destination, then a
//!   transparent duplex stream
//! - **Extender listener**: per-SNI self-signed certificates minted on
//!   demand, destination allow-listing, and timed duplex splicing
//! - **HTTP-over-tunnel client**: a pooled hyper client whose every
//!   connection rides an extender tunnel with a verified end-to-end TLS
//!   session inside
//! - **Tether**: device registry, address pool allocation, peer
//!   lifecycle, INI config round-trip, and an HTTP control surface
//!
//! ## Usage
//!
//! ```rust,ignore
//! use shroud::config::load_config;
//! use shroud::extender::ExtenderServer;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config("config.toml")?;
//!     let cancel = CancellationToken::new();
//!
//!     let server = ExtenderServer::from_config(&config.extender);
//!     server.bind().await?.serve(cancel).await;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! caller -> dialer --TLS(spoof SNI)--> relay --TCP--> true destination
//! ```
//!
//! The relay terminates the spoof-host TLS session, so callers layer
//! their own verified protocol inside the tunnel; the relay is pure
//! transport to it.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod error;
pub mod extender;
pub mod helper;
pub mod tether;

// Re-export commonly used items
pub use config::{load_config, Config, ExtenderConfig};
pub use error::{ExtenderError, TetherError};
pub use extender::{ExtenderDialer, ExtenderServer};

/// Version of the Shroud library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the application
pub const NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_name() {
        assert_eq!(NAME, "shroud");
    }
}
