//! Upstream relays: HTTP CONNECT and SOCKS5 tunnels plus the duplex copier.
//!
//! # Submodule Architecture
//!
//! - **[`http_connect`]**: opens a tunnel with an HTTP `CONNECT` request and
//!   treats any non-200 answer as an explicit refusal.
//! - **[`socks5`]**: SOCKS5 method selection, RFC 1929 username/password
//!   sub-negotiation and `CONNECT`, over TCP or a unix-domain socket.
//! - **[`credentials`]**: the SOCKS5 [`CredentialPolicy`] (random per
//!   connection, fixed, or none).
//! - **[`copier`]**: [`spawn_duplex`](copier::spawn_duplex), two independent
//!   copy tasks that half-close their destination on end-of-stream.
//!
//! Both relays follow the same shape: dial the [`Upstream`], negotiate the
//! tunnel to the client's original destination, then hand the client socket
//! and the upstream stream to the copier. A failed dial or handshake returns
//! an error and the client socket is dropped (closed) without copying.

pub mod copier;
pub mod credentials;
pub mod http_connect;
pub mod socks5;

pub use copier::RelayHandle;
pub use credentials::CredentialPolicy;

use metaproxy_core::{ProxyError, ProxyResult, Upstream};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// A bidirectional byte stream to an upstream proxy (TCP or unix-domain).
pub trait ProxyStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ProxyStream for T {}

pub type BoxedStream = Box<dyn ProxyStream>;

/// One intercepted connection, owned by its dispatcher task.
#[derive(Debug)]
pub struct Client {
    /// Peer address of the redirected client.
    pub client_addr: SocketAddr,
    /// Destination the client dialed before NAT rewrote it.
    pub dest: SocketAddr,
    /// The accepted client socket.
    pub conn: TcpStream,
}

/// Open the transport to an upstream proxy.
pub async fn dial(upstream: &Upstream) -> ProxyResult<BoxedStream> {
    match upstream {
        Upstream::Tcp(addr) => {
            let stream = TcpStream::connect(addr.as_str())
                .await
                .map_err(|e| ProxyError::UpstreamDial(format!("cannot connect to {addr}: {e}")))?;
            let _ = stream.set_nodelay(true);
            Ok(Box::new(stream))
        }
        #[cfg(unix)]
        Upstream::Unix(path) => {
            let stream = tokio::net::UnixStream::connect(path).await.map_err(|e| {
                ProxyError::UpstreamDial(format!("cannot connect to {upstream}: {e}"))
            })?;
            Ok(Box::new(stream))
        }
        #[cfg(not(unix))]
        Upstream::Unix(_) => Err(ProxyError::UpstreamDial(format!(
            "unix-domain upstream {upstream} is not supported on this platform"
        ))),
    }
}
