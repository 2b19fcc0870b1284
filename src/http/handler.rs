//! Secret handler contract
//!
//! The broker core never talks to a vault itself. A completed, well-formed
//! request is handed to a [`SecretHandler`], which resolves the secret (in
//! practice via a Key Vault REST client and a token-acquisition flow) and
//! reports back either the secret value or an error.

use serde::{Deserialize, Serialize};

/// Body of a broker request: the vault URL of the secret to fetch.
#[derive(Debug, Clone, Deserialize)]
pub struct SecretRequest {
    pub url: String,
}

/// Body of a successful broker reply.
#[derive(Debug, Serialize)]
pub struct SecretReply<'a> {
    pub secret: &'a str,
}

/// Failure reported by a handler.
///
/// Handler failures are never fatal to a connection; the driver converts
/// them into a `402 Request Failed` reply carrying this description.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(description: impl Into<String>) -> Self {
        HandlerError(description.into())
    }
}

/// Resolves secret URLs to secret values.
///
/// Implementations may block on network I/O; the driver always invokes them
/// off the connection's serial loop and receives the result back over the
/// connection's event channel.
pub trait SecretHandler: Send + Sync + 'static {
    fn fetch(&self, url: &str) -> Result<String, HandlerError>;
}

impl<F> SecretHandler for F
where
    F: Fn(&str) -> Result<String, HandlerError> + Send + Sync + 'static,
{
    fn fetch(&self, url: &str) -> Result<String, HandlerError> {
        self(url)
    }
}
