//! metaproxy-core: Shared library for the metaproxy transparent relay.
//!
//! Provides the relay policy data model, the port-keyed policy table with
//! wildcard fallback, JSON configuration decoding, and the error taxonomy
//! used by the proxy binary.

pub mod config;
pub mod error;
pub mod relay;

// Re-export commonly used items at crate root.
pub use config::{load_relay_table, parse_relay_table, RelayConfig};
pub use error::{ProxyError, ProxyResult};
pub use relay::{Relay, RelayTable, RelayType, Upstream, UNIX_PREFIX, WILDCARD_PORT};
