//! Credentials attached to CONNECT.
//!
//! The session never parses connection strings or mints tokens; it asks a
//! [`CredentialSource`] before every connect attempt, so a source backed by a
//! token service can hand out a fresh token each time.

use std::fmt;

use crate::config::CredentialsConfig;

/// Opaque username/password pair for the CONNECT packet.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl From<&CredentialsConfig> for Credentials {
    fn from(config: &CredentialsConfig) -> Self {
        Credentials::new(config.username.clone(), config.password.clone())
    }
}

/// Resolves credentials for each connect attempt.
///
/// Returning `None` connects without a login.
pub trait CredentialSource: Send + Sync {
    fn resolve(&self) -> Option<Credentials>;
}

/// Static credentials resolve to themselves.
impl CredentialSource for Credentials {
    fn resolve(&self) -> Option<Credentials> {
        Some(self.clone())
    }
}

impl<F> CredentialSource for F
where
    F: Fn() -> Option<Credentials> + Send + Sync,
{
    fn resolve(&self) -> Option<Credentials> {
        self()
    }
}
