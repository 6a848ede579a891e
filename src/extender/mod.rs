//! Extender: the covert-tunneling relay
//!
//! To an on-path observer the relay is an ordinary TLS server on a
//! well-known port answering for whatever SNI it is probed with. A
//! tunnel client completes that TLS handshake against a spoof host name,
//! sends one length-prefixed header naming the true destination, and
//! from then on the relay splices raw bytes in both directions.

pub mod allowlist;
pub mod cert;
pub mod client;
pub mod dialer;
pub mod frame;
pub mod hello;
pub mod listener;

pub use allowlist::AllowList;
pub use cert::{mint, MintedCert, MintingCertResolver};
pub use client::{extender_http_client, ExtenderHttpClient, HttpClientOptions};
pub use dialer::{Dialer, ExtenderDialer, ExtenderStream, TcpDialer};
pub use frame::{read_header, write_header, DestinationHeader, MAX_HEADER_LEN};
pub use hello::{parse_client_hello, ClientHelloInfo, HelloExtension};
pub use listener::{BoundExtenderServer, ExtenderServer};
