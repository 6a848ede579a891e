//! Helper utilities for Shroud
//!
//! Shared socket tuning and the deadline-aware copy loop used by the
//! extender's tunnel relay.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::error::ExtenderError;

/// Buffer size for tunnel copy loops
pub const COPY_BUFFER_SIZE: usize = 4096;

/// Default per-operation read deadline on tunnel IO
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Default per-operation write deadline on tunnel IO
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default TLS client handshake deadline
pub const DEFAULT_TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// TCP keepalive probe timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Keepalive {
    /// Idle time before the first probe
    pub idle: Duration,
    /// Interval between unanswered probes
    pub interval: Duration,
}

impl Keepalive {
    /// Probe timing for tunnel sockets
    ///
    /// Dead peers must be noticed well inside the 30 second tunnel IO
    /// deadlines, so probing starts at half that.
    pub fn for_tunnels() -> Self {
        Keepalive {
            idle: Duration::from_secs(15),
            interval: Duration::from_secs(5),
        }
    }
}

/// Per-socket TCP tuning for tunnel connections
#[derive(Debug, Clone)]
pub struct TcpTuning {
    /// Disable Nagle's algorithm
    pub nodelay: bool,
    /// Keepalive probing; `None` leaves the OS default untouched
    pub keepalive: Option<Keepalive>,
}

impl Default for TcpTuning {
    fn default() -> Self {
        TcpTuning {
            nodelay: true,
            keepalive: Some(Keepalive::for_tunnels()),
        }
    }
}

impl TcpTuning {
    /// Apply the tuning to a TCP stream
    pub fn apply(&self, stream: &TcpStream) -> std::io::Result<()> {
        stream.set_nodelay(self.nodelay)?;

        let Some(keepalive) = self.keepalive else {
            return Ok(());
        };
        let probes = socket2::TcpKeepalive::new()
            .with_time(keepalive.idle)
            .with_interval(keepalive.interval);
        socket2::SockRef::from(stream).set_tcp_keepalive(&probes)
    }
}

/// Copy bytes from `reader` to `writer` until EOF, error, deadline, or
/// cancellation
///
/// Every read is bounded by `read_timeout` and every write by
/// `write_timeout`. Cancellation of `cancel` is observed at the next read
/// and surfaces as [`ExtenderError::Canceled`]. On clean EOF the writer
/// side is shut down so the far end observes it.
///
/// Returns the number of bytes copied.
pub async fn copy_with_deadlines<R, W>(
    reader: &mut R,
    writer: &mut W,
    read_timeout: Duration,
    write_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<u64, ExtenderError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = [0u8; COPY_BUFFER_SIZE];
    let mut total: u64 = 0;

    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => return Err(ExtenderError::Canceled),
            read = timeout(read_timeout, reader.read(&mut buf)) => match read {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => return Err(ExtenderError::IoTimeout("read".to_string())),
            },
        };

        if n == 0 {
            break;
        }

        match timeout(write_timeout, writer.write_all(&buf[..n])).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(ExtenderError::IoTimeout("write".to_string())),
        }

        total += n as u64;
    }

    let _ = writer.shutdown().await;
    Ok(total)
}
