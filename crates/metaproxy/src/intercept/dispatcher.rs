//! Per-connection dispatch: resolve, match a policy, open the relay.
//!
//! ```text
//! Accepted ──resolve──▶ Resolved ──lookup──▶ PolicyMatched ──dial+handshake──▶ Relaying ──▶ Closed
//!    │                     │                      │
//!    └─▶ Dropped           └─▶ Dropped            └─▶ Dropped
//!        (Unresolved)          (NoPolicy)             (Upstream)
//! ```
//!
//! Every drop closes the client socket without writing anything to it. The
//! dispatcher's job ends once the copier is running; [`Dispatch::Relaying`]
//! carries the copier's handle for callers that want to wait on it.

use super::original_dst::OriginalDestination;
use crate::relay::{http_connect, socks5, Client, CredentialPolicy, RelayHandle};
use metaproxy_core::{ProxyError, RelayTable, RelayType};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Outcome of dispatching one accepted connection.
pub enum Dispatch {
    /// The tunnel is up and both copy directions are running.
    Relaying(RelayHandle),
    /// The connection was closed without relaying.
    Dropped(DropReason),
}

/// Why a connection was dropped.
#[derive(Debug)]
pub enum DropReason {
    /// The original destination could not be recovered.
    Unresolved(ProxyError),
    /// Neither an exact nor a wildcard policy matched. No upstream was dialed.
    NoPolicy { dest: SocketAddr },
    /// Dialing or negotiating with the upstream proxy failed.
    Upstream {
        relay_type: RelayType,
        error: ProxyError,
    },
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::Unresolved(e) => write!(f, "unresolved: {e}"),
            DropReason::NoPolicy { dest } => write!(f, "no policy for port {}", dest.port()),
            DropReason::Upstream { relay_type, error } => write!(f, "{relay_type} relay: {error}"),
        }
    }
}

/// Routes intercepted connections to their upstream relay.
///
/// Holds only read-only state, so one instance is shared by every
/// connection task.
pub struct ConnectionDispatcher {
    /// Port-keyed relay policies, never mutated after startup.
    relays: Arc<RelayTable>,
    /// Recovers the pre-NAT destination of each connection.
    resolver: Arc<dyn OriginalDestination>,
    /// SOCKS5 credential selection.
    credentials: CredentialPolicy,
}

impl ConnectionDispatcher {
    pub fn new(
        relays: Arc<RelayTable>,
        resolver: Arc<dyn OriginalDestination>,
        credentials: CredentialPolicy,
    ) -> Self {
        Self {
            relays,
            resolver,
            credentials,
        }
    }

    /// Handle one accepted connection up to the start of the relay.
    pub async fn dispatch(&self, conn: TcpStream, client_addr: SocketAddr) -> Dispatch {
        let dest = match self.resolver.original_destination(&conn) {
            Ok(dest) => dest,
            Err(e) => {
                warn!(client = %client_addr, error = %e, "cannot get original destination, dropping connection");
                return Dispatch::Dropped(DropReason::Unresolved(e));
            }
        };
        debug!(client = %client_addr, dest = %dest, "resolved original destination");

        let relay = match self.relays.lookup_port(dest.port()) {
            Some(relay) => relay,
            None => {
                info!(client = %client_addr, dest = %dest, "no policy for destination port, dropping connection");
                return Dispatch::Dropped(DropReason::NoPolicy { dest });
            }
        };
        if relay.is_wildcard() {
            info!(dest = %dest, "no specific policy for destination port, using wildcard relay");
        }

        let client = Client {
            client_addr,
            dest,
            conn,
        };
        info!(
            client = %client_addr,
            dest = %dest,
            relay_type = %relay.relay_type,
            upstream = %relay.upstream(),
            "opening relay"
        );
        let result = match relay.relay_type {
            RelayType::HttpConnect => http_connect::relay(client, relay).await,
            RelayType::Socks5 => socks5::relay(client, relay, &self.credentials).await,
        };

        match result {
            Ok(handle) => Dispatch::Relaying(handle),
            Err(error) => {
                warn!(
                    client = %client_addr,
                    dest = %dest,
                    relay_type = %relay.relay_type,
                    upstream = %relay.upstream(),
                    error = %error,
                    "relay failed, dropping connection"
                );
                Dispatch::Dropped(DropReason::Upstream {
                    relay_type: relay.relay_type,
                    error,
                })
            }
        }
    }
}
