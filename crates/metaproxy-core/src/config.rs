//! Relay configuration: JSON file decoding and validation.
//!
//! ```json
//! { "Relays": [
//!     { "destinationport": "80", "relaytype": "SOCKS5",
//!       "relayip": "127.0.0.1", "relayport": "9050" },
//!     { "destinationport": "*", "relaytype": "HTTP_CONNECT",
//!       "relayip": "127.0.0.1", "relayport": "8118" }
//! ] }
//! ```
//!
//! Any failure here is a [`ProxyError::Config`] and must stop the process
//! before the listener starts.

use crate::error::{ProxyError, ProxyResult};
use crate::relay::{Relay, RelayTable, UNIX_PREFIX, WILDCARD_PORT};
use serde::Deserialize;
use std::path::Path;
use tracing::debug;

/// Top-level config file structure.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    #[serde(rename = "Relays", alias = "relays", default)]
    pub relays: Vec<Relay>,
}

/// Read and decode the relay table from a JSON file.
pub fn load_relay_table(path: &Path) -> ProxyResult<RelayTable> {
    debug!(path = %path.display(), "reading config file");
    let content = std::fs::read_to_string(path).map_err(|e| {
        ProxyError::Config(format!("cannot read config file {}: {e}", path.display()))
    })?;
    parse_relay_table(&content, &path.display().to_string())
}

/// Decode and validate a relay table. `origin` names the source in errors.
pub fn parse_relay_table(content: &str, origin: &str) -> ProxyResult<RelayTable> {
    let config: RelayConfig = serde_json::from_str(content).map_err(|e| {
        use serde_json::error::Category;
        match e.classify() {
            Category::Syntax | Category::Eof => ProxyError::Config(format!(
                "JSON syntax error in config file {origin} at line {} and col {}: {e}",
                e.line(),
                e.column()
            )),
            _ => ProxyError::Config(format!("invalid relay in config file {origin}: {e}")),
        }
    })?;

    if config.relays.is_empty() {
        return Err(ProxyError::Config(format!(
            "no relays found in config file {origin}"
        )));
    }

    for relay in &config.relays {
        validate_relay(relay).map_err(|reason| {
            ProxyError::Config(format!("invalid relay in config file {origin}: {reason}"))
        })?;
    }

    Ok(RelayTable::from_relays(config.relays))
}

fn validate_relay(relay: &Relay) -> Result<(), String> {
    if relay.destination_port != WILDCARD_PORT && relay.destination_port.parse::<u16>().is_err() {
        return Err(format!(
            "destinationport {:?} is neither \"*\" nor a port number",
            relay.destination_port
        ));
    }

    match relay.relay_ip.strip_prefix(UNIX_PREFIX) {
        Some("") => Err(format!(
            "relayip {:?} has an empty unix socket path",
            relay.relay_ip
        )),
        Some(_) => Ok(()),
        None if relay.relay_ip.is_empty() => Err(format!(
            "relay for destinationport {:?} has no relayip",
            relay.destination_port
        )),
        None => match relay.relay_port.parse::<u16>() {
            Ok(p) if p != 0 => Ok(()),
            _ => Err(format!(
                "relayport {:?} for relayip {} is not a valid port",
                relay.relay_port, relay.relay_ip
            )),
        },
    }
}
