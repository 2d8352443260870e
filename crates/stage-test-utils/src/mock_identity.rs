//! Mock identity verifier.
//!
//! Accepts tokens of the form `valid-<identity>`, yielding identity id
//! `<identity>` and display name `User <identity>`; everything else is
//! rejected as an authentication failure.

use async_trait::async_trait;
use stage_server::auth::{Identity, IdentityVerifier};
use stage_server::errors::StageError;

#[derive(Debug, Default)]
pub struct MockIdentityVerifier;

impl MockIdentityVerifier {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl IdentityVerifier for MockIdentityVerifier {
    async fn verify(&self, token: &str) -> Result<Identity, StageError> {
        token
            .strip_prefix("valid-")
            .filter(|id| !id.is_empty())
            .map(|id| Identity {
                identity_id: id.to_string(),
                display_name: format!("User {id}"),
            })
            .ok_or_else(|| StageError::Authentication("unknown token".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_accepts_prefixed_tokens_only() {
        let verifier = MockIdentityVerifier::new();

        let identity = verifier.verify("valid-alice").await.unwrap();
        assert_eq!(identity.identity_id, "alice");
        assert_eq!(identity.display_name, "User alice");

        assert!(verifier.verify("alice").await.is_err());
        assert!(verifier.verify("valid-").await.is_err());
    }
}
