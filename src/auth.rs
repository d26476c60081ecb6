//! Authorization providers consulted before a stream connects.
//!
//! Request signing is out of scope for this crate; a provider only reports
//! whether credentials exist and supplies the `Authorization` header value
//! attached to every connection attempt.

use std::fmt;

use secrecy::{ExposeSecret, SecretString};

pub trait Authorization: Send + Sync + fmt::Debug {
    /// Returns `true` when credentials are present.
    fn is_enabled(&self) -> bool;

    /// Header value sent as `Authorization` on each connection attempt.
    fn authorization_header(&self) -> Option<SecretString>;
}

/// OAuth 2.0 bearer token credentials.
#[derive(Clone, Debug)]
pub struct BearerToken {
    token: SecretString,
}

impl BearerToken {
    pub fn new(token: SecretString) -> Self {
        Self { token }
    }
}

impl Authorization for BearerToken {
    fn is_enabled(&self) -> bool {
        !self.token.expose_secret().trim().is_empty()
    }

    fn authorization_header(&self) -> Option<SecretString> {
        if !self.is_enabled() {
            return None;
        }
        Some(SecretString::new(format!(
            "Bearer {}",
            self.token.expose_secret().trim()
        )))
    }
}

/// Placeholder used when no credentials were configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullAuthorization;

impl Authorization for NullAuthorization {
    fn is_enabled(&self) -> bool {
        false
    }

    fn authorization_header(&self) -> Option<SecretString> {
        None
    }
}

#[cfg(test)]
mod tests {
    use secrecy::{ExposeSecret, SecretString};

    use super::{Authorization, BearerToken, NullAuthorization};

    #[test]
    fn bearer_token_builds_header() {
        let auth = BearerToken::new(SecretString::new("abc123".to_string()));
        assert!(auth.is_enabled());
        let header = auth.authorization_header().expect("header");
        assert_eq!(header.expose_secret(), "Bearer abc123");
    }

    #[test]
    fn blank_bearer_token_is_not_enabled() {
        let auth = BearerToken::new(SecretString::new("   ".to_string()));
        assert!(!auth.is_enabled());
        assert!(auth.authorization_header().is_none());
    }

    #[test]
    fn null_authorization_is_never_enabled() {
        assert!(!NullAuthorization.is_enabled());
        assert!(NullAuthorization.authorization_header().is_none());
    }

    #[test]
    fn debug_output_redacts_token() {
        let auth = BearerToken::new(SecretString::new("super-secret".to_string()));
        assert!(!format!("{auth:?}").contains("super-secret"));
    }
}
