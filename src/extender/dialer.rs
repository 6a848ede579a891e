//! Extender dialer (client side)
//!
//! Builds the outbound tunnel: TCP to the relay through a caller-supplied
//! [`Dialer`], a TLS handshake presenting the spoof host as SNI with
//! certificate verification disabled, then the single destination header
//! frame. The returned stream is plain duplex transport; callers usually
//! layer their own verified TLS session on top, end to end to the true
//! destination.

use std::fmt::Debug;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{ClientConfig, DigitallySignedStruct, Error as TlsError, SignatureScheme};
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::ExtenderConfig;
use crate::error::ExtenderError;
use crate::extender::frame::{write_header, DestinationHeader};
use crate::helper::{TcpTuning, DEFAULT_TLS_HANDSHAKE_TIMEOUT};

/// Byte streams usable as tunnel transport
pub trait TunnelStream: AsyncRead + AsyncWrite + Unpin + Send + Sync + Debug {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync + Debug> TunnelStream for T {}

/// The tunnel connection an [`ExtenderDialer`] produces
pub type ExtenderStream = tokio_rustls::client::TlsStream<Box<dyn TunnelStream>>;

/// Raw-connection dialer
///
/// The extender does not dial TCP itself; callers supply the dialer so
/// they can route through SOCKS, apply their own timeouts, or stub the
/// network out in tests.
#[async_trait]
pub trait Dialer: Debug + Send + Sync {
    /// Open a byte-stream connection to the address
    async fn dial(&self, addr: SocketAddr) -> Result<Box<dyn TunnelStream>, ExtenderError>;
}

/// Default dialer: plain TCP with socket tuning and a connect timeout
#[derive(Debug, Clone)]
pub struct TcpDialer {
    /// TCP tuning applied before use
    pub tuning: TcpTuning,
    /// Connect timeout
    pub connect_timeout: Duration,
}

impl Default for TcpDialer {
    fn default() -> Self {
        TcpDialer {
            tuning: TcpTuning::default(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, addr: SocketAddr) -> Result<Box<dyn TunnelStream>, ExtenderError> {
        let stream = timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ExtenderError::IoTimeout(format!("connect to {}", addr)))??;

        self.tuning.apply(&stream)?;
        Ok(Box::new(stream))
    }
}

/// Signature schemes the spoof-leg verifier advertises
///
/// The relay signs with whatever key it just minted, so the dialer
/// offers the whole set instead of guessing at one.
const ACCEPTED_SCHEMES: [SignatureScheme; 10] = [
    SignatureScheme::ED25519,
    SignatureScheme::ECDSA_NISTP256_SHA256,
    SignatureScheme::ECDSA_NISTP384_SHA384,
    SignatureScheme::ECDSA_NISTP521_SHA512,
    SignatureScheme::RSA_PSS_SHA256,
    SignatureScheme::RSA_PSS_SHA384,
    SignatureScheme::RSA_PSS_SHA512,
    SignatureScheme::RSA_PKCS1_SHA256,
    SignatureScheme::RSA_PKCS1_SHA384,
    SignatureScheme::RSA_PKCS1_SHA512,
];

/// Verifier that waves every relay certificate through
///
/// The spoof-host session exists for concealment, not trust: the relay's
/// minted certs can never chain to a real root, so nothing about them is
/// checked. The outer, end-to-end session is where verification belongs.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, TlsError> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        ACCEPTED_SCHEMES.to_vec()
    }
}

/// Build a rustls client config with verification disabled
pub(crate) fn insecure_client_config() -> ClientConfig {
    ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
        .with_no_client_auth()
}

/// Dialer for extender tunnels
///
/// Immutable once built; `dial` can be called repeatedly, producing one
/// tunnel per call. No retries happen here.
pub struct ExtenderDialer {
    config: ExtenderConfig,
    dialer: Arc<dyn Dialer>,
    connector: TlsConnector,
    handshake_timeout: Duration,
}

impl std::fmt::Debug for ExtenderDialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtenderDialer")
            .field("config", &self.config)
            .field("handshake_timeout", &self.handshake_timeout)
            .finish()
    }
}

impl ExtenderDialer {
    /// Create a dialer using plain TCP toward the relay
    pub fn new(config: ExtenderConfig) -> Self {
        Self::with_dialer(config, Arc::new(TcpDialer::default()))
    }

    /// Create a dialer with a caller-supplied raw-connection dialer
    pub fn with_dialer(config: ExtenderConfig, dialer: Arc<dyn Dialer>) -> Self {
        ExtenderDialer {
            config,
            dialer,
            connector: TlsConnector::from(Arc::new(insecure_client_config())),
            handshake_timeout: DEFAULT_TLS_HANDSHAKE_TIMEOUT,
        }
    }

    /// Set the TLS handshake timeout
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// The connect descriptor this dialer was built with
    pub fn config(&self) -> &ExtenderConfig {
        &self.config
    }

    /// Open a tunnel through the relay
    ///
    /// Connects to the relay, completes the spoof-host TLS handshake, and
    /// writes the destination header. The returned stream is ready for
    /// the caller's own protocol; the relay is invisible to it.
    pub async fn dial(&self, cancel: &CancellationToken) -> Result<ExtenderStream, ExtenderError> {
        let relay_addr = self.config.relay_addr();

        let tcp = tokio::select! {
            _ = cancel.cancelled() => return Err(ExtenderError::Canceled),
            conn = self.dialer.dial(relay_addr) => conn?,
        };

        let server_name = ServerName::try_from(self.config.spoof_host.clone())
            .map_err(|e| ExtenderError::Handshake(format!("invalid spoof host: {}", e)))?;

        let mut tls = tokio::select! {
            _ = cancel.cancelled() => return Err(ExtenderError::Canceled),
            handshake = timeout(self.handshake_timeout, self.connector.connect(server_name, tcp)) => {
                match handshake {
                    Ok(Ok(stream)) => stream,
                    Ok(Err(e)) => return Err(ExtenderError::Handshake(e.to_string())),
                    Err(_) => return Err(ExtenderError::IoTimeout("TLS handshake".to_string())),
                }
            }
        };

        let header =
            DestinationHeader::new(&self.config.destination_host, self.config.destination_port);
        write_header(&mut tls, &header).await?;

        debug!(
            relay = %relay_addr,
            spoof = %self.config.spoof_host,
            destination = %self.config.destination_host,
            "extender tunnel established"
        );

        Ok(tls)
    }
}
