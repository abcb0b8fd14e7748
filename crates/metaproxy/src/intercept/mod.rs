//! Intercept side: accepting redirected connections and routing them.
//!
//! # Submodule Architecture
//!
//! - **[`listener`]**: [`InterceptListener`] binds the loopback port (IPv4 and,
//!   when available, IPv6) that the firewall redirects traffic to and spawns one task per accepted socket.
//!
//! - **[`admission`]**: [`AdmissionControl`] caps concurrent connections
//!   when configured; its RAII guard lives as long as the connection task.
//!
//! - **[`original_dst`]**: The [`OriginalDestination`](original_dst::OriginalDestination) trait and its kernel
//!   implementation [`SoOriginalDst`], which reads the pre-NAT destination
//!   from conntrack.
//!
//! - **[`dispatcher`]**: [`ConnectionDispatcher`] resolves the destination,
//!   picks the relay policy for its port, and opens the upstream tunnel.
//!
//! # Data Flow
//!
//! ```text
//! accept (listener.rs)
//!   → AdmissionControl::try_acquire
//!   → ConnectionDispatcher::dispatch
//!       → OriginalDestination::original_destination
//!       → RelayTable::lookup_port
//!       → http_connect::relay / socks5::relay
//!           → copier::spawn_duplex
//! ```

pub mod admission;
pub mod dispatcher;
pub mod listener;
pub mod original_dst;

pub use admission::AdmissionControl;
pub use dispatcher::ConnectionDispatcher;
pub use listener::InterceptListener;
pub use original_dst::SoOriginalDst;
