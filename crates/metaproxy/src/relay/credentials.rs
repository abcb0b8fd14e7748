//! SOCKS5 credential policy.
//!
//! Upstreams such as Tor isolate streams by SOCKS5 username, so the default
//! policy draws a fresh random username for every intercepted connection.
//! A fixed pair and no authentication at all are available for upstreams that
//! expect them.

use rand::RngCore;

/// Number of random bytes behind a per-connection username.
const RANDOM_USERNAME_BYTES: usize = 8;

/// Password sent alongside random usernames unless configured otherwise.
pub const DEFAULT_PASSWORD: &str = "password";

/// A username/password pair for RFC 1929 authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// How SOCKS5 credentials are chosen for each upstream connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialPolicy {
    /// Offer only the "no authentication" method.
    None,
    /// Same username and password for every connection.
    Fixed { username: String, password: String },
    /// Random hex username per connection, fixed password.
    RandomPerConnection { password: String },
}

impl Default for CredentialPolicy {
    fn default() -> Self {
        CredentialPolicy::RandomPerConnection {
            password: DEFAULT_PASSWORD.to_string(),
        }
    }
}

impl CredentialPolicy {
    /// Check RFC 1929 field lengths.
    ///
    /// # Errors
    ///
    /// Returns `Err(String)` if a username is empty or a field exceeds 255 bytes.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            CredentialPolicy::None => Ok(()),
            CredentialPolicy::Fixed { username, password } => {
                if username.is_empty() || username.len() > 255 {
                    return Err(format!(
                        "SOCKS5 username must be 1-255 bytes, got {}",
                        username.len()
                    ));
                }
                check_password(password)
            }
            CredentialPolicy::RandomPerConnection { password } => check_password(password),
        }
    }

    /// Credentials for one new upstream connection, or `None` for no auth.
    pub fn credentials(&self) -> Option<Credentials> {
        match self {
            CredentialPolicy::None => None,
            CredentialPolicy::Fixed { username, password } => Some(Credentials {
                username: username.clone(),
                password: password.clone(),
            }),
            CredentialPolicy::RandomPerConnection { password } => {
                let mut bytes = [0u8; RANDOM_USERNAME_BYTES];
                rand::rngs::OsRng.fill_bytes(&mut bytes);
                Some(Credentials {
                    username: hex::encode(bytes),
                    password: password.clone(),
                })
            }
        }
    }
}

fn check_password(password: &str) -> Result<(), String> {
    if password.len() > 255 {
        return Err(format!(
            "SOCKS5 password must be at most 255 bytes, got {}",
            password.len()
        ));
    }
    Ok(())
}
