//! Shared helpers for Shroud integration tests

use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use shroud::extender::{AllowList, ExtenderServer};

/// Bind a listener on an ephemeral loopback port
///
/// Ephemeral ports keep the test binary parallel-safe; callers dial the
/// reported address.
pub async fn bind_local() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind(("127.0.0.1", 0))
        .await
        .expect("bind loopback listener");
    let addr = listener
        .local_addr()
        .expect("loopback listener has an address");
    (listener, addr)
}

/// Spawn an extender relay with the given allow-list patterns
///
/// Serves until the returned token is canceled.
pub async fn spawn_relay(patterns: &[&str]) -> (SocketAddr, CancellationToken) {
    let allowlist = AllowList::new(patterns.iter().copied());
    let bound = ExtenderServer::new(allowlist, vec![0])
        .bind()
        .await
        .expect("bind relay");
    let addr = bound.local_addrs()[0];

    let cancel = CancellationToken::new();
    let serve_cancel = cancel.clone();
    tokio::spawn(async move { bound.serve(serve_cancel).await });

    (addr, cancel)
}

/// Spawn a TCP upstream that echoes everything back
pub async fn spawn_echo_upstream() -> SocketAddr {
    let (listener, addr) = bind_local().await;
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                while let Ok(n) = stream.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                    if stream.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    addr
}
