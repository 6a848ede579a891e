//! Endpoint directory
//!
//! Maps endpoint kinds to the public address strings peers should dial
//! to reach a device. `any` is a virtual, read-only kind resolving to an
//! arbitrary present endpoint.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::TetherError;

/// The kind of a public endpoint string
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EndpointKind {
    /// A public IPv4 address
    Ipv4,
    /// A public IPv6 address
    Ipv6,
    /// A DNS name
    Domain,
    /// Any present endpoint (read-only)
    Any,
}

impl fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EndpointKind::Ipv4 => "ipv4",
            EndpointKind::Ipv6 => "ipv6",
            EndpointKind::Domain => "domain",
            EndpointKind::Any => "any",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for EndpointKind {
    type Err = TetherError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ipv4" => Ok(EndpointKind::Ipv4),
            "ipv6" => Ok(EndpointKind::Ipv6),
            "domain" => Ok(EndpointKind::Domain),
            "any" => Ok(EndpointKind::Any),
            other => Err(TetherError::InvalidEndpointType(other.to_string())),
        }
    }
}

/// Directory of public endpoint strings, one per concrete kind
#[derive(Debug, Clone, Default)]
pub struct EndpointDirectory {
    entries: BTreeMap<EndpointKind, String>,
}

impl EndpointDirectory {
    /// An empty directory
    pub fn new() -> Self {
        EndpointDirectory::default()
    }

    /// Set the endpoint string for a concrete kind
    ///
    /// Fails with [`TetherError::EndpointAddAny`] for the virtual kind.
    pub fn set(&mut self, kind: EndpointKind, value: &str) -> Result<(), TetherError> {
        if kind == EndpointKind::Any {
            return Err(TetherError::EndpointAddAny);
        }
        self.entries.insert(kind, value.to_string());
        Ok(())
    }

    /// Resolve a kind to its endpoint string
    ///
    /// `any` resolves to an arbitrary present endpoint; concrete kinds
    /// resolve to their own entry or fail with
    /// [`TetherError::EndpointNotFound`].
    pub fn resolve(&self, kind: EndpointKind) -> Result<&str, TetherError> {
        match kind {
            EndpointKind::Any => self
                .entries
                .values()
                .next()
                .map(String::as_str)
                .ok_or(TetherError::EndpointNotFound(EndpointKind::Any)),
            concrete => self
                .entries
                .get(&concrete)
                .map(String::as_str)
                .ok_or(TetherError::EndpointNotFound(concrete)),
        }
    }

    /// Whether the directory holds no endpoints
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
