//! Loopback acceptor for redirected connections.
//!
//! Each accepted socket gets keep-alive, passes admission control, and is
//! handed to the [`ConnectionDispatcher`] on its own task. The task holds its
//! [`ConnectionGuard`](super::admission::ConnectionGuard) until both copy
//! directions have finished, so the admission count tracks live relays.

use super::admission::AdmissionControl;
use super::dispatcher::{ConnectionDispatcher, Dispatch};
use metaproxy_core::ProxyResult;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// Pause after a failed `accept`, so descriptor exhaustion does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Accepts intercepted connections and dispatches each on its own task.
pub struct InterceptListener {
    listener: TcpListener,
    dispatcher: Arc<ConnectionDispatcher>,
    admission: Arc<AdmissionControl>,
}

impl InterceptListener {
    /// Bind the listening socket.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Io`](metaproxy_core::ProxyError::Io) if the
    /// address cannot be bound.
    pub async fn bind(
        addr: SocketAddr,
        dispatcher: Arc<ConnectionDispatcher>,
        admission: Arc<AdmissionControl>,
    ) -> ProxyResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            dispatcher,
            admission,
        })
    }

    pub fn local_addr(&self) -> ProxyResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept loop. Never returns; per-connection failures stay inside the
    /// connection's task and accept errors are logged.
    pub async fn run(self) {
        info!(addr = ?self.listener.local_addr().ok(), "accepting intercepted connections");
        loop {
            match self.listener.accept().await {
                Ok((conn, client_addr)) => self.handle(conn, client_addr),
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }

    fn handle(&self, conn: TcpStream, client_addr: SocketAddr) {
        if let Err(e) = socket2::SockRef::from(&conn).set_keepalive(true) {
            debug!(client = %client_addr, error = %e, "failed to enable keep-alive");
        }

        let guard = match self.admission.try_acquire() {
            Ok(guard) => guard,
            Err(reason) => {
                warn!(client = %client_addr, reason = %reason, "rejecting connection");
                return;
            }
        };
        debug!(
            client = %client_addr,
            active = self.admission.active_connections(),
            "connection accepted"
        );

        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move {
            let _guard = guard;
            match dispatcher.dispatch(conn, client_addr).await {
                Dispatch::Relaying(handle) => {
                    let stats = handle.join().await;
                    debug!(
                        client = %client_addr,
                        sent = stats.sent,
                        received = stats.received,
                        "connection closed"
                    );
                }
                Dispatch::Dropped(reason) => {
                    debug!(client = %client_addr, reason = %reason, "connection dropped");
                }
            }
        });
    }
}
