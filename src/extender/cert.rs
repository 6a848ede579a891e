//! On-demand self-signed leaf certificates
//!
//! The relay answers any SNI a client (or probe) presents. Certificates
//! are minted fresh inside the TLS SNI callback, one per handshake, and
//! live only as long as the session. Trust is not the point; extender
//! clients skip verification, and the cert only has to look plausible to
//! an observer probing the listening port.

use std::net::IpAddr;
use std::sync::Arc;

use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, Ia5String, IsCa,
    KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use rsa::pkcs8::EncodePrivateKey;
use rsa::RsaPrivateKey;
use time::{Duration, OffsetDateTime};
use tokio_rustls::rustls::crypto::ring::sign::any_supported_type;
use tokio_rustls::rustls::server::{ClientHello, ResolvesServerCert};
use tokio_rustls::rustls::sign::CertifiedKey;
use tracing::{debug, warn};

use crate::error::ExtenderError;

/// RSA modulus size for minted leaf keys
const KEY_BITS: usize = 2048;

/// How far into the past the validity window starts
const VALID_FROM: Duration = Duration::days(180);

/// How far past "now" the validity window extends
const VALID_FOR: Duration = Duration::days(180);

/// Subject name used when the client sent no SNI
pub const FALLBACK_SERVER_NAME: &str = "invalid.invalid";

/// A freshly minted certificate and its private key, both PEM-encoded
#[derive(Debug, Clone)]
pub struct MintedCert {
    /// PEM-encoded leaf certificate
    pub cert_pem: String,
    /// PKCS#8 PEM-encoded private key
    pub key_pem: String,
}

/// Mint a self-signed leaf certificate for the given subject names
///
/// Each subject becomes an IP SAN when it parses as an address and a DNS
/// SAN otherwise. The key is a fresh RSA-2048 keypair; the serial is 128
/// random bits; the validity window straddles "now" by 180 days in both
/// directions so probes at any nearby clock see a currently valid cert.
pub fn mint(subjects: &[String], organization: &str) -> Result<MintedCert, ExtenderError> {
    if subjects.is_empty() {
        return Err(ExtenderError::CertMint("no subject names".to_string()));
    }

    let rsa_key = RsaPrivateKey::new(&mut rand::rngs::OsRng, KEY_BITS)
        .map_err(|e| ExtenderError::CertMint(format!("RSA keygen failed: {}", e)))?;
    let pkcs8 = rsa_key
        .to_pkcs8_der()
        .map_err(|e| ExtenderError::CertMint(format!("PKCS#8 encoding failed: {}", e)))?;
    let key_pair = KeyPair::try_from(pkcs8.as_bytes())
        .map_err(|e| ExtenderError::CertMint(format!("key import failed: {}", e)))?;

    let mut params = CertificateParams::default();
    params
        .distinguished_name
        .push(DnType::OrganizationName, organization);
    params
        .distinguished_name
        .push(DnType::CommonName, &subjects[0]);

    params.serial_number = Some(SerialNumber::from_slice(&rand::random::<[u8; 16]>()));

    let now = OffsetDateTime::now_utc();
    params.not_before = now - VALID_FROM;
    params.not_after = now + VALID_FOR;

    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
        KeyUsagePurpose::KeyCertSign,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    // CA + cert-sign so TLS 1.3 clients that skip strict chain validation
    // still accept the self-signed leaf.
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);

    for subject in subjects {
        let san = match subject.parse::<IpAddr>() {
            Ok(ip) => SanType::IpAddress(ip),
            Err(_) => SanType::DnsName(
                Ia5String::try_from(subject.as_str())
                    .map_err(|e| ExtenderError::CertMint(format!("bad subject name: {}", e)))?,
            ),
        };
        params.subject_alt_names.push(san);
    }

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| ExtenderError::CertMint(format!("signing failed: {}", e)))?;

    debug!(subject = %subjects[0], "minted leaf certificate");

    Ok(MintedCert {
        cert_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
    })
}

/// Mint a certificate for a single name and package it for rustls
pub fn certified_key_for(name: &str, organization: &str) -> Result<CertifiedKey, ExtenderError> {
    let minted = mint(&[name.to_string()], organization)?;

    let certs = rustls_pemfile::certs(&mut minted.cert_pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ExtenderError::CertMint(format!("cert PEM re-parse failed: {}", e)))?;
    let key = rustls_pemfile::private_key(&mut minted.key_pem.as_bytes())
        .map_err(|e| ExtenderError::CertMint(format!("key PEM re-parse failed: {}", e)))?
        .ok_or_else(|| ExtenderError::CertMint("no private key in PEM".to_string()))?;

    let signing_key = any_supported_type(&key)
        .map_err(|e| ExtenderError::CertMint(format!("unusable signing key: {}", e)))?;

    Ok(CertifiedKey::new(certs, signing_key))
}

/// rustls certificate resolver that mints per handshake
///
/// Invoked synchronously inside the SNI callback with no locks held; the
/// RSA keygen is the dominant per-connection cost and runs entirely on
/// this connection's task.
#[derive(Debug)]
pub struct MintingCertResolver {
    organization: String,
}

impl MintingCertResolver {
    /// Create a resolver minting under the given organization name
    pub fn new(organization: &str) -> Self {
        MintingCertResolver {
            organization: organization.to_string(),
        }
    }
}

impl ResolvesServerCert for MintingCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let name = client_hello
            .server_name()
            .map(str::to_string)
            .unwrap_or_else(|| FALLBACK_SERVER_NAME.to_string());

        match certified_key_for(&name, &self.organization) {
            Ok(key) => Some(Arc::new(key)),
            Err(e) => {
                warn!(sni = %name, error = %e, "cert mint failed, aborting handshake");
                None
            }
        }
    }
}
