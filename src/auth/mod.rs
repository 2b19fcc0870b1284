//! Authentication challenge header parsing
//!
//! Vault endpoints answer unauthenticated requests with a
//! `WWW-Authenticate` header describing one or more challenges:
//!
//! ```text
//! Bearer authorization_uri="https://login.example.com/common", resource="https://vault.example.com"
//! ```
//!
//! This module turns such a header into a map from challenge scheme to its
//! parameters. It is alias-agnostic: which parameter keys matter (e.g.
//! `authorization_uri` vs `authorization`) is the caller's business.

pub mod challenge;

pub use challenge::{parse, ChallengeMap, ChallengeParams};

/// Result type for challenge parsing
pub type Result<T> = std::result::Result<T, ChallengeError>;

/// Challenge header parsing errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ChallengeError {
    #[error("empty challenge header")]
    EmptyInput,

    #[error("invalid challenge header")]
    InvalidHeaderSyntax,
}
