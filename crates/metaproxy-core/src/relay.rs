//! Relay policy model and the port-keyed policy table.
//!
//! A [`Relay`] names the upstream proxy (HTTP CONNECT or SOCKS5) that carries
//! traffic for one original destination port. The [`RelayTable`] is built once
//! at startup and then only read, so it is shared between connection tasks
//! behind an `Arc` without any locking.
//!
//! # Lookup
//!
//! | Table contains            | `lookup("443")` returns |
//! |---------------------------|-------------------------|
//! | `"443"` (and maybe `"*"`) | the `"443"` entry       |
//! | `"*"` only                | the `"*"` entry         |
//! | neither                   | `None` (drop)           |

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

/// Table key for the fallback policy.
pub const WILDCARD_PORT: &str = "*";

/// Prefix on `relayip` selecting a unix-domain upstream transport.
pub const UNIX_PREFIX: &str = "unix:";

/// Upstream proxy protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelayType {
    #[serde(rename = "SOCKS5")]
    Socks5,
    #[serde(rename = "HTTP_CONNECT")]
    HttpConnect,
}

impl fmt::Display for RelayType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayType::Socks5 => f.write_str("SOCKS5"),
            RelayType::HttpConnect => f.write_str("HTTP_CONNECT"),
        }
    }
}

/// One relay policy, as declared in the `Relays` list of the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relay {
    /// Original destination port this policy applies to, or `"*"`.
    #[serde(rename = "destinationport")]
    pub destination_port: String,
    #[serde(rename = "relaytype")]
    pub relay_type: RelayType,
    /// Upstream proxy IP/hostname, or `unix:<path>` for a unix-domain socket.
    #[serde(rename = "relayip")]
    pub relay_ip: String,
    /// Upstream proxy port. Ignored for unix-domain upstreams.
    #[serde(rename = "relayport", default)]
    pub relay_port: String,
}

/// Where the upstream proxy is reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Upstream {
    /// `host:port` suitable for `TcpStream::connect`.
    Tcp(String),
    /// Filesystem path of a unix-domain stream socket.
    Unix(PathBuf),
}

impl fmt::Display for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Upstream::Tcp(addr) => f.write_str(addr),
            Upstream::Unix(path) => write!(f, "{}{}", UNIX_PREFIX, path.display()),
        }
    }
}

impl Relay {
    /// Whether this is the fallback policy.
    pub fn is_wildcard(&self) -> bool {
        self.destination_port == WILDCARD_PORT
    }

    /// Resolve the upstream transport from `relayip` / `relayport`.
    pub fn upstream(&self) -> Upstream {
        match self.relay_ip.strip_prefix(UNIX_PREFIX) {
            Some(path) => Upstream::Unix(PathBuf::from(path)),
            None => Upstream::Tcp(join_host_port(&self.relay_ip, &self.relay_port)),
        }
    }
}

/// Join host and port, bracketing IPv6 literals.
pub fn join_host_port(host: &str, port: &str) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Immutable mapping from destination port to relay policy.
#[derive(Debug, Clone, Default)]
pub struct RelayTable {
    relays: HashMap<String, Relay>,
}

impl RelayTable {
    /// Build a table from relays in declaration order. When two relays share a
    /// destination port, the later one wins.
    pub fn from_relays<I>(relays: I) -> Self
    where
        I: IntoIterator<Item = Relay>,
    {
        let mut map = HashMap::new();
        for relay in relays {
            if let Some(previous) = map.insert(relay.destination_port.clone(), relay) {
                tracing::debug!(
                    port = %previous.destination_port,
                    "duplicate relay for destination port, later entry wins"
                );
            }
        }
        Self { relays: map }
    }

    /// Find the policy for `dest_port`: exact match first, then the wildcard.
    ///
    /// `None` is the expected "no policy, drop the connection" outcome, not an
    /// error.
    pub fn lookup(&self, dest_port: &str) -> Option<&Relay> {
        self.relays
            .get(dest_port)
            .or_else(|| self.relays.get(WILDCARD_PORT))
    }

    /// [`lookup`](Self::lookup) keyed by a numeric port.
    pub fn lookup_port(&self, dest_port: u16) -> Option<&Relay> {
        self.lookup(&dest_port.to_string())
    }

    pub fn has_wildcard(&self) -> bool {
        self.relays.contains_key(WILDCARD_PORT)
    }

    pub fn len(&self) -> usize {
        self.relays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relays.is_empty()
    }

    /// Relays sorted by destination port, wildcard last.
    pub fn relays(&self) -> Vec<&Relay> {
        let mut relays: Vec<&Relay> = self.relays.values().collect();
        relays.sort_by_key(|r| (r.is_wildcard(), r.destination_port.parse::<u32>().unwrap_or(0)));
        relays
    }
}
