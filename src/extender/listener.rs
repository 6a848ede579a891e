//! Extender listener (server side)
//!
//! Accepts TLS on one or more ports, terminates the handshake with a
//! certificate minted for whatever SNI the client presented, reads the
//! destination header, checks it against the allow-list, dials the
//! upstream, and splices bytes until either side closes.
//!
//! Every failure is fatal to its own connection only; a failed accept
//! terminates only its own port's loop. Shutdown is driven by the root
//! cancellation token, which closes all listeners together; in-flight
//! tunnels drain to their own deadlines.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ExtenderServerConfig;
use crate::error::ExtenderError;
use crate::extender::allowlist::AllowList;
use crate::extender::cert::MintingCertResolver;
use crate::extender::frame::{decode_body, MAX_HEADER_LEN};
use crate::extender::hello::sni_from_record;
use crate::helper::{copy_with_deadlines, TcpTuning};

/// Settings shared by all accept loops and connection handlers
struct ServerShared {
    allowlist: AllowList,
    organization: String,
    read_timeout: Duration,
    write_timeout: Duration,
    tuning: TcpTuning,
}

/// The extender relay server
pub struct ExtenderServer {
    ports: Vec<u16>,
    shared: ServerShared,
}

impl ExtenderServer {
    /// Create a server for the given allow-list and listening ports
    pub fn new(allowlist: AllowList, ports: Vec<u16>) -> Self {
        ExtenderServer {
            ports,
            shared: ServerShared {
                allowlist,
                organization: "Example Networks".to_string(),
                read_timeout: crate::helper::DEFAULT_READ_TIMEOUT,
                write_timeout: crate::helper::DEFAULT_WRITE_TIMEOUT,
                tuning: TcpTuning::default(),
            },
        }
    }

    /// Create a server from the `[extender]` config section
    pub fn from_config(config: &ExtenderServerConfig) -> Self {
        let mut server = Self::new(config.allowlist(), config.ports.clone());
        server.shared.organization = config.organization.clone();
        server.shared.read_timeout = config.read_timeout();
        server.shared.write_timeout = config.write_timeout();
        server
    }

    /// Set the organization name stamped into minted certificates
    pub fn with_organization(mut self, organization: &str) -> Self {
        self.shared.organization = organization.to_string();
        self
    }

    /// Set the tunnel IO deadlines
    pub fn with_timeouts(mut self, read: Duration, write: Duration) -> Self {
        self.shared.read_timeout = read;
        self.shared.write_timeout = write;
        self
    }

    /// Bind every listening port
    ///
    /// All listeners are created together; failure to bind any port fails
    /// the whole server.
    pub async fn bind(self) -> Result<BoundExtenderServer, ExtenderError> {
        let mut listeners = Vec::with_capacity(self.ports.len());
        for port in &self.ports {
            let listener = TcpListener::bind(("0.0.0.0", *port)).await?;
            info!(addr = %listener.local_addr()?, "extender listening");
            listeners.push(listener);
        }

        let tls_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(MintingCertResolver::new(
                &self.shared.organization,
            )));

        Ok(BoundExtenderServer {
            listeners,
            acceptor: TlsAcceptor::from(Arc::new(tls_config)),
            shared: Arc::new(self.shared),
        })
    }
}

/// A server whose listening sockets are bound and ready to accept
pub struct BoundExtenderServer {
    listeners: Vec<TcpListener>,
    acceptor: TlsAcceptor,
    shared: Arc<ServerShared>,
}

impl BoundExtenderServer {
    /// The bound listening addresses
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .iter()
            .filter_map(|l| l.local_addr().ok())
            .collect()
    }

    /// Run accept loops until the token is canceled
    ///
    /// Returns after every accept loop has exited. Cancellation closes
    /// the listeners; running tunnels observe their per-connection token
    /// at the next IO deadline.
    pub async fn serve(self, cancel: CancellationToken) {
        let mut loops = JoinSet::new();
        for listener in self.listeners {
            let shared = self.shared.clone();
            let acceptor = self.acceptor.clone();
            let cancel = cancel.clone();
            loops.spawn(accept_loop(listener, acceptor, shared, cancel));
        }

        while loops.join_next().await.is_some() {}
        info!("extender server stopped");
    }
}

/// Accept connections on one port until shutdown or accept failure
async fn accept_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    shared: Arc<ServerShared>,
    cancel: CancellationToken,
) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("accept loop shutting down");
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "accept failed, terminating this listener");
                    return;
                }
            },
        };

        let shared = shared.clone();
        let acceptor = acceptor.clone();
        let conn_cancel = cancel.child_token();
        tokio::spawn(async move {
            match handle_connection(stream, peer, acceptor, shared, conn_cancel).await {
                Ok(()) => debug!(peer = %peer, "tunnel closed"),
                Err(e) if e.is_canceled() => debug!(peer = %peer, "tunnel canceled"),
                Err(e) => warn!(peer = %peer, error = %e, "tunnel failed"),
            }
        });
    }
}

/// Serve a single accepted connection to completion
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    acceptor: TlsAcceptor,
    shared: Arc<ServerShared>,
    cancel: CancellationToken,
) -> Result<(), ExtenderError> {
    shared.tuning.apply(&stream)?;

    let mut tls = match timeout(shared.read_timeout, acceptor.accept(stream)).await {
        Ok(Ok(tls)) => tls,
        Ok(Err(e)) => return Err(ExtenderError::Handshake(e.to_string())),
        Err(_) => return Err(ExtenderError::IoTimeout("TLS accept".to_string())),
    };

    // Header: 4-byte length then the message, each read on its own
    // deadline. Oversized declarations are dropped before reading on.
    let mut len_buf = [0u8; 4];
    timed_read_exact(&mut tls, &mut len_buf, shared.read_timeout).await?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len == 0 || len > MAX_HEADER_LEN {
        return Err(ExtenderError::Framing(format!(
            "declared header length {} out of bounds (1..={})",
            len, MAX_HEADER_LEN
        )));
    }

    let mut body = vec![0u8; len];
    timed_read_exact(&mut tls, &mut body, shared.read_timeout).await?;
    let header = decode_body(&body)?;

    if !shared.allowlist.matches(&header.destination_host) {
        return Err(ExtenderError::DestinationForbidden(
            header.destination_host.clone(),
        ));
    }

    let upstream = match timeout(
        shared.read_timeout,
        TcpStream::connect((header.destination_host.as_str(), header.port())),
    )
    .await
    {
        Ok(Ok(conn)) => conn,
        Ok(Err(e)) => {
            return Err(ExtenderError::UpstreamUnreachable(format!(
                "{}:{}: {}",
                header.destination_host,
                header.port(),
                e
            )))
        }
        Err(_) => {
            return Err(ExtenderError::UpstreamUnreachable(format!(
                "{}:{}: connect timeout",
                header.destination_host,
                header.port()
            )))
        }
    };
    shared.tuning.apply(&upstream)?;

    debug!(
        peer = %peer,
        destination = %header.destination_host,
        port = header.port(),
        "splicing tunnel"
    );

    let (mut client_read, mut client_write) = tokio::io::split(tls);
    let (mut upstream_read, mut upstream_write) = upstream.into_split();

    let read_timeout = shared.read_timeout;
    let write_timeout = shared.write_timeout;

    // Whichever direction finishes first cancels the shared token; the
    // other observes it at its next deadline.
    let up_cancel = cancel.clone();
    let up = tokio::spawn(async move {
        let res = copy_with_deadlines(
            &mut client_read,
            &mut upstream_write,
            read_timeout,
            write_timeout,
            &up_cancel,
        )
        .await;
        up_cancel.cancel();
        res
    });

    let down_cancel = cancel.clone();
    let down = tokio::spawn(async move {
        let res = copy_with_deadlines(
            &mut upstream_read,
            &mut client_write,
            read_timeout,
            write_timeout,
            &down_cancel,
        )
        .await;
        down_cancel.cancel();
        res
    });

    let (up_res, down_res) = tokio::join!(up, down);
    let sent = flatten_copy_result(up_res)?;
    let received = flatten_copy_result(down_res)?;

    debug!(peer = %peer, sent, received, "tunnel drained");
    Ok(())
}

/// Read exactly `buf` bytes under a deadline
async fn timed_read_exact<R>(
    reader: &mut R,
    buf: &mut [u8],
    deadline: Duration,
) -> Result<(), ExtenderError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    match timeout(deadline, reader.read_exact(buf)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(ExtenderError::IoTimeout("header read".to_string())),
    }
}

/// Collapse a joined copy-task result, treating cancellation as clean EOF
fn flatten_copy_result(
    joined: Result<Result<u64, ExtenderError>, tokio::task::JoinError>,
) -> Result<u64, ExtenderError> {
    match joined {
        Ok(Ok(n)) => Ok(n),
        Ok(Err(e)) if e.is_canceled() => Ok(0),
        Ok(Err(e)) => Err(e),
        Err(e) => Err(ExtenderError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("copy task failed: {}", e),
        ))),
    }
}

/// Peek the ClientHello on an accepted socket and extract its SNI
///
/// Reads with MSG_PEEK so the handshake bytes remain for the TLS library.
/// The accept path does not need this (the certificate resolver sees the
/// SNI directly); it exists for inspection tooling.
pub async fn peek_sni(stream: &TcpStream) -> Result<Option<String>, ExtenderError> {
    let mut buf = vec![0u8; 4096];
    let n = stream.peek(&mut buf).await?;
    sni_from_record(&buf[..n])
}
