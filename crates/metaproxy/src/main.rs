//! metaproxy: transparent intercepting proxy.
//!
//! Accepts TCP connections that a firewall `REDIRECT` rule sent to the local
//! port, recovers each connection's original destination, and relays it
//! through the HTTP CONNECT or SOCKS5 upstream configured for that port.

mod intercept;
mod relay;
mod settings;

use anyhow::Context;
use clap::Parser;
use intercept::{AdmissionControl, ConnectionDispatcher, InterceptListener, SoOriginalDst};
use metaproxy_core::RelayTable;
use relay::credentials::DEFAULT_PASSWORD;
use settings::{ProxySettings, Socks5Auth};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// metaproxy: transparent HTTP CONNECT and SOCKS5 relay
#[derive(Parser, Debug)]
#[command(name = "metaproxy", version, about = "Transparent intercepting proxy")]
struct Cli {
    /// Listen port on 127.0.0.1 (and ::1 when available)
    #[arg(short, long, default_value_t = 8675)]
    port: u16,

    /// Relay configuration file (JSON)
    #[arg(short, long)]
    config: PathBuf,

    /// Check the configuration, print the relay table and exit
    #[arg(short, long)]
    test_config: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// SOCKS5 username policy
    #[arg(long, value_enum, default_value_t = Socks5Auth::Random)]
    socks5_auth: Socks5Auth,

    /// SOCKS5 username for `--socks5-auth fixed`
    #[arg(long)]
    socks5_username: Option<String>,

    /// SOCKS5 password
    #[arg(long, default_value = DEFAULT_PASSWORD)]
    socks5_password: String,

    /// Maximum concurrent connections (unbounded when absent)
    #[arg(long)]
    max_connections: Option<usize>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let level = if cli.debug { "debug" } else { cli.log_level.as_str() };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    if let Err(e) = run(cli).await {
        error!(error = %format!("{e:#}"), "metaproxy failed");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let credentials = cli
        .socks5_auth
        .policy(cli.socks5_username.as_deref(), &cli.socks5_password)
        .context("invalid SOCKS5 credentials")?;
    let settings = ProxySettings::new(cli.port, &cli.config, credentials, cli.max_connections)
        .context("invalid settings")?;
    let table = settings
        .relay_table()
        .context("failed to load relay configuration")?;

    if cli.test_config {
        print_table(&table)?;
        return Ok(());
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %settings.listen_addr,
        relays = table.len(),
        max_connections = ?settings.max_connections,
        "starting metaproxy"
    );

    let dispatcher = Arc::new(ConnectionDispatcher::new(
        Arc::new(table),
        Arc::new(SoOriginalDst),
        settings.credentials.clone(),
    ));
    let admission = Arc::new(AdmissionControl::new(settings.max_connections));
    let mut listeners = vec![InterceptListener::bind(
        settings.listen_addr,
        dispatcher.clone(),
        admission.clone(),
    )
    .await
    .with_context(|| format!("failed to listen on {}", settings.listen_addr))?];
    match InterceptListener::bind(settings.listen_addr_v6, dispatcher, admission).await {
        Ok(listener) => listeners.push(listener),
        Err(e) => warn!(
            addr = %settings.listen_addr_v6,
            error = %e,
            "IPv6 loopback unavailable, accepting IPv4 connections only"
        ),
    }

    // Dropping the set on shutdown aborts the accept loops.
    let mut accept_loops = tokio::task::JoinSet::new();
    for listener in listeners {
        accept_loops.spawn(listener.run());
    }

    shutdown_signal().await;
    info!("received shutdown signal");

    info!("metaproxy stopped");
    Ok(())
}

/// Print the decoded table in the configuration file's own shape.
fn print_table(table: &RelayTable) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(&serde_json::json!({ "Relays": table.relays() }))
        .context("failed to encode relay table")?;
    println!("{json}");
    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
