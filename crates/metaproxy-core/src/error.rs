use thiserror::Error;

/// Errors produced while loading relay policy or relaying a connection.
///
/// Only [`ProxyError::Config`] is fatal to the process. Every other variant is
/// scoped to a single intercepted connection: it is logged and the connection
/// is closed, and the listener keeps serving.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("config error: {0}")]
    Config(String),

    #[error("original destination unavailable: {0}")]
    Resolution(String),

    #[error("upstream dial failed: {0}")]
    UpstreamDial(String),

    /// The upstream HTTP proxy answered the CONNECT with a non-200 status.
    #[error("upstream refused tunnel with status {status}: {reason}")]
    UpstreamRefused { status: u16, reason: String },

    #[error("upstream handshake failed: {0}")]
    Handshake(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// Whether this error came from dialing or negotiating with the upstream proxy.
    pub fn is_upstream(&self) -> bool {
        matches!(
            self,
            ProxyError::UpstreamDial(_)
                | ProxyError::UpstreamRefused { .. }
                | ProxyError::Handshake(_)
        )
    }
}

pub type ProxyResult<T> = Result<T, ProxyError>;
