//! Runtime settings: CLI values resolved into one explicit object.

use crate::relay::CredentialPolicy;
use clap::ValueEnum;
use metaproxy_core::{load_relay_table, ProxyError, ProxyResult, RelayTable};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use tracing::info;

/// How SOCKS5 usernames are chosen, as selected on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Socks5Auth {
    /// Fresh random username for every connection.
    Random,
    /// `--socks5-username` and `--socks5-password` for every connection.
    Fixed,
    /// Offer only "no authentication".
    None,
}

impl Socks5Auth {
    /// Build the credential policy this mode describes.
    pub fn policy(self, username: Option<&str>, password: &str) -> ProxyResult<CredentialPolicy> {
        let policy = match self {
            Socks5Auth::Random => CredentialPolicy::RandomPerConnection {
                password: password.to_string(),
            },
            Socks5Auth::Fixed => CredentialPolicy::Fixed {
                username: username
                    .ok_or_else(|| {
                        ProxyError::Config("--socks5-auth fixed requires --socks5-username".into())
                    })?
                    .to_string(),
                password: password.to_string(),
            },
            Socks5Auth::None => CredentialPolicy::None,
        };
        policy.validate().map_err(ProxyError::Config)?;
        Ok(policy)
    }
}

/// Resolved runtime settings, built once in `main` and passed down.
#[derive(Debug, Clone)]
pub struct ProxySettings {
    /// IPv4 loopback address the listener binds.
    pub listen_addr: SocketAddr,
    /// IPv6 loopback address, bound when the host has one.
    pub listen_addr_v6: SocketAddr,
    /// Relay table file, `~` already expanded.
    pub config_path: PathBuf,
    pub credentials: CredentialPolicy,
    /// `None` = unbounded.
    pub max_connections: Option<usize>,
}

impl ProxySettings {
    pub fn new(
        port: u16,
        config_path: &Path,
        credentials: CredentialPolicy,
        max_connections: Option<usize>,
    ) -> ProxyResult<Self> {
        if max_connections == Some(0) {
            return Err(ProxyError::Config(
                "--max-connections must be at least 1".into(),
            ));
        }
        Ok(Self {
            listen_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
            listen_addr_v6: SocketAddr::from((Ipv6Addr::LOCALHOST, port)),
            config_path: expand_tilde(config_path),
            credentials,
            max_connections,
        })
    }

    /// Load the relay table named by `config_path`.
    pub fn relay_table(&self) -> ProxyResult<RelayTable> {
        info!(path = %self.config_path.display(), "loading config file");
        let table = load_relay_table(&self.config_path)?;
        if !table.has_wildcard() {
            info!("no wildcard relay configured; unmatched ports will be dropped");
        }
        Ok(table)
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
