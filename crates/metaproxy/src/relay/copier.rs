//! Duplex byte copier between the client socket and the upstream tunnel.
//!
//! Each direction runs in its own task. When a direction's source reaches
//! end-of-stream or fails, that task shuts down the write side of its
//! destination and ends; the opposite direction is left running until its
//! own source ends. A socket is fully closed once both tasks have dropped
//! their halves.

use std::fmt;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::debug;

const COPY_BUFFER_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    /// client → upstream
    Outbound,
    /// upstream → client
    Inbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Outbound => f.write_str("client->upstream"),
            Direction::Inbound => f.write_str("upstream->client"),
        }
    }
}

/// Byte counts of a finished relay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Bytes copied from the client to the upstream.
    pub sent: u64,
    /// Bytes copied from the upstream to the client.
    pub received: u64,
}

/// Handles of the two copy tasks of one relay.
///
/// Dropping the handle detaches the tasks; the relay keeps running.
pub struct RelayHandle {
    outbound: JoinHandle<u64>,
    inbound: JoinHandle<u64>,
}

impl RelayHandle {
    /// Wait for both directions to finish.
    pub async fn join(self) -> RelayStats {
        let (sent, received) = tokio::join!(self.outbound, self.inbound);
        RelayStats {
            sent: sent.unwrap_or(0),
            received: received.unwrap_or(0),
        }
    }
}

/// Start relaying between `client` and `upstream`.
///
/// `dest` is the client's original destination and only labels log lines.
pub fn spawn_duplex<C, U>(client: C, upstream: U, dest: SocketAddr) -> RelayHandle
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    U: AsyncRead + AsyncWrite + Send + 'static,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (upstream_read, upstream_write) = tokio::io::split(upstream);

    let outbound = tokio::spawn(copy_and_close(
        client_read,
        upstream_write,
        Direction::Outbound,
        dest,
    ));
    let inbound = tokio::spawn(copy_and_close(
        upstream_read,
        client_write,
        Direction::Inbound,
        dest,
    ));

    RelayHandle { outbound, inbound }
}

/// Copy until `reader` ends or errors, then shut down `writer`.
async fn copy_and_close<R, W>(mut reader: R, mut writer: W, direction: Direction, dest: SocketAddr) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut written: u64 = 0;

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if let Err(e) = writer.write_all(&buf[..n]).await {
                    debug!(dest = %dest, %direction, error = %e, "error writing relayed data");
                    break;
                }
                written += n as u64;
            }
            Err(e) => {
                debug!(dest = %dest, %direction, error = %e, "error reading relayed data");
                break;
            }
        }
    }

    if let Err(e) = writer.shutdown().await {
        debug!(dest = %dest, %direction, error = %e, "error closing destination");
    }

    debug!(dest = %dest, %direction, bytes = written, "copy finished");
    written
}
