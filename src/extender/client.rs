//! HTTP client over extender tunnels
//!
//! The factory here returns an HTTP client whose every connection is an
//! extender tunnel: TCP to the relay, spoof-host TLS, header frame, then
//! a second, verified TLS session end to end to the true destination.
//! The relay only ever sees the outer session's ciphertext.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::rt::{Read, ReadBufCursor, Write};
use hyper::{Request, Response, Uri};
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::time::timeout;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ExtenderConfig;
use crate::error::ExtenderError;
use crate::extender::dialer::{ExtenderDialer, TunnelStream};

/// The outer (destination) TLS session layered over a tunnel
type OuterStream = tokio_rustls::client::TlsStream<Box<dyn TunnelStream>>;

/// Connection pooling and timeout knobs
///
/// The defaults are contractual for parity with existing deployments;
/// change them only when you know both ends.
#[derive(Debug, Clone)]
pub struct HttpClientOptions {
    /// Maximum idle pooled connections
    pub max_idle_conns: usize,
    /// Idle connection lifetime
    pub idle_timeout: Duration,
    /// Outer TLS handshake deadline
    pub tls_handshake_timeout: Duration,
    /// 100-continue wait before sending a request body
    pub expect_continue_timeout: Duration,
    /// Overall per-request deadline
    pub request_timeout: Duration,
}

impl Default for HttpClientOptions {
    fn default() -> Self {
        HttpClientOptions {
            max_idle_conns: 100,
            idle_timeout: Duration::from_secs(90),
            tls_handshake_timeout: Duration::from_secs(10),
            expect_continue_timeout: Duration::from_secs(1),
            request_timeout: Duration::from_secs(90),
        }
    }
}

/// Build a rustls client config verifying against the native root store
///
/// This is the default OUTER session config: unlike the spoof-host leg,
/// the end-to-end session to the true destination is verified. Root-store
/// load problems are logged rather than silently dropped; a store that
/// ends up empty will fail every outer handshake, which is the right
/// failure mode for a client that promised verification.
pub fn verified_client_config() -> ClientConfig {
    let loaded = rustls_native_certs::load_native_certs();
    for error in &loaded.errors {
        warn!(error = %error, "native root store load problem");
    }

    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(loaded.certs);
    debug!(added, ignored, "native roots installed");

    ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth()
}

/// hyper connector that dials through the extender
#[derive(Clone)]
pub struct ExtenderConnector {
    dialer: Arc<ExtenderDialer>,
    outer: TlsConnector,
    outer_name: ServerName<'static>,
    handshake_timeout: Duration,
    cancel: CancellationToken,
}

impl tower::Service<Uri> for ExtenderConnector {
    type Response = ExtenderConnection;
    type Error = ExtenderError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _dst: Uri) -> Self::Future {
        // The tunnel always leads to the configured destination; the
        // request URI plays no part in routing.
        let this = self.clone();
        Box::pin(async move {
            let tunnel = this.dialer.dial(&this.cancel).await?;
            let boxed: Box<dyn TunnelStream> = Box::new(tunnel);

            let outer = match timeout(
                this.handshake_timeout,
                this.outer.connect(this.outer_name.clone(), boxed),
            )
            .await
            {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => return Err(ExtenderError::Handshake(e.to_string())),
                Err(_) => return Err(ExtenderError::IoTimeout("outer TLS handshake".to_string())),
            };

            Ok(ExtenderConnection {
                inner: TokioIo::new(outer),
            })
        })
    }
}

/// One pooled tunnel connection as hyper sees it
pub struct ExtenderConnection {
    inner: TokioIo<OuterStream>,
}

impl Read for ExtenderConnection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: ReadBufCursor<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl Write for ExtenderConnection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl Connection for ExtenderConnection {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

/// HTTP client whose transport is the extender
pub struct ExtenderHttpClient {
    client: Client<ExtenderConnector, Full<Bytes>>,
    request_timeout: Duration,
}

impl ExtenderHttpClient {
    /// Issue a request through the tunnel
    pub async fn request(
        &self,
        req: Request<Full<Bytes>>,
    ) -> Result<Response<Incoming>, ExtenderError> {
        match timeout(self.request_timeout, self.client.request(req)).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(e)) => Err(ExtenderError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                e.to_string(),
            ))),
            Err(_) => Err(ExtenderError::IoTimeout("HTTP request".to_string())),
        }
    }

    /// Convenience GET
    pub async fn get(&self, uri: Uri) -> Result<Response<Incoming>, ExtenderError> {
        let req = Request::builder()
            .uri(uri)
            .body(Full::new(Bytes::new()))
            .map_err(|e| {
                ExtenderError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    e.to_string(),
                ))
            })?;
        self.request(req).await
    }
}

/// Build an HTTP client that tunnels every connection through the relay
///
/// `outer_tls` configures the verified end-to-end session to the true
/// destination; [`verified_client_config`] is the usual choice. `cancel`
/// aborts in-flight tunnel dials on shutdown.
pub fn extender_http_client(
    config: ExtenderConfig,
    outer_tls: ClientConfig,
    options: HttpClientOptions,
    cancel: CancellationToken,
) -> Result<ExtenderHttpClient, ExtenderError> {
    let outer_name = ServerName::try_from(config.destination_host.clone())
        .map_err(|e| ExtenderError::Handshake(format!("invalid destination host: {}", e)))?;

    let connector = ExtenderConnector {
        dialer: Arc::new(ExtenderDialer::new(config)),
        outer: TlsConnector::from(Arc::new(outer_tls)),
        outer_name,
        handshake_timeout: options.tls_handshake_timeout,
        cancel,
    };

    let client = Client::builder(TokioExecutor::new())
        .pool_idle_timeout(options.idle_timeout)
        .pool_max_idle_per_host(options.max_idle_conns)
        .build::<_, Full<Bytes>>(connector);

    Ok(ExtenderHttpClient {
        client,
        request_timeout: options.request_timeout,
    })
}
