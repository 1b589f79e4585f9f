#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Turns the raw credential a client presents during the handshake into the
//! opaque identifier its connection is known by.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use sha2::{Digest as _, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("Empty credentials")]
    EmptyCredentials,
    #[error("Token issuance failed: {0}")]
    Issuer(String),
}

/// Issues session tokens from raw credential bytes.
///
/// The returned token must be printable, since it doubles as the connection's
/// user id in logs and in disconnect notices.
pub trait TokenIssuer: Send + Sync {
    /// # Errors
    ///
    /// * If the credentials cannot be turned into a token
    fn issue(&self, credentials: &[u8]) -> Result<String, TokenError>;
}

impl<F> TokenIssuer for F
where
    F: Fn(&[u8]) -> Result<String, TokenError> + Send + Sync,
{
    fn issue(&self, credentials: &[u8]) -> Result<String, TokenError> {
        self(credentials)
    }
}

/// Deterministic issuer: `base64url(sha256(secret || credentials))`.
///
/// The same credential always maps to the same token, so a client that
/// reconnects is recognised as the same user.
#[derive(Debug, Clone, Default)]
pub struct Sha256TokenIssuer {
    secret: Option<String>,
}

impl Sha256TokenIssuer {
    #[must_use]
    pub const fn new() -> Self {
        Self { secret: None }
    }

    #[must_use]
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }
}

impl TokenIssuer for Sha256TokenIssuer {
    fn issue(&self, credentials: &[u8]) -> Result<String, TokenError> {
        if credentials.iter().all(u8::is_ascii_whitespace) {
            return Err(TokenError::EmptyCredentials);
        }

        let mut hasher = Sha256::new();
        if let Some(secret) = &self.secret {
            hasher.update(secret.as_bytes());
            hasher.update([0]);
        }
        hasher.update(credentials);

        let token = URL_SAFE_NO_PAD.encode(hasher.finalize());
        log::trace!("issue: token={token}");
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::{assert_eq, assert_ne};

    use super::*;

    #[test_log::test]
    fn same_credentials_issue_the_same_token() {
        let issuer = Sha256TokenIssuer::new();
        assert_eq!(
            issuer.issue(b"alice:secret").unwrap(),
            issuer.issue(b"alice:secret").unwrap()
        );
    }

    #[test_log::test]
    fn different_credentials_issue_different_tokens() {
        let issuer = Sha256TokenIssuer::new();
        assert_ne!(
            issuer.issue(b"alice").unwrap(),
            issuer.issue(b"bob").unwrap()
        );
    }

    #[test_log::test]
    fn secret_changes_the_token() {
        let plain = Sha256TokenIssuer::new().issue(b"alice").unwrap();
        let salted = Sha256TokenIssuer::new()
            .with_secret("pepper")
            .issue(b"alice")
            .unwrap();
        assert_ne!(plain, salted);
    }

    #[test_log::test]
    fn token_is_printable_and_url_safe() {
        let token = Sha256TokenIssuer::new().issue(b"alice").unwrap();
        assert_eq!(token.len(), 43);
        assert!(
            token
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        );
    }

    #[test_log::test]
    fn blank_credentials_are_rejected() {
        let issuer = Sha256TokenIssuer::new();
        assert!(matches!(
            issuer.issue(b""),
            Err(TokenError::EmptyCredentials)
        ));
        assert!(matches!(
            issuer.issue(b"  "),
            Err(TokenError::EmptyCredentials)
        ));
    }

    #[test_log::test]
    fn closures_can_issue_tokens() {
        let issuer = |credentials: &[u8]| -> Result<String, TokenError> {
            Ok(String::from_utf8_lossy(credentials).into_owned())
        };
        assert_eq!(issuer.issue(b"alice").unwrap(), "alice");
    }
}
