//! Identity verification boundary.
//!
//! Identity issuance lives in an external identity/directory service; the
//! stage server only validates the tokens it minted. Tokens are HS256 JWTs
//! over a shared secret with `sub` (identity id), `name` and `exp` claims.
//!
//! Tokens are size-checked before parsing, and validation failures surface
//! a generic message; the detailed cause is logged at debug level only.

use crate::errors::StageError;

use async_trait::async_trait;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Maximum accepted token size in bytes, checked before any parsing.
pub const MAX_TOKEN_SIZE_BYTES: usize = 8192;

/// A verified identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Stable identity id from the identity service (`sub`).
    pub identity_id: String,
    /// Display name shown to other participants.
    pub display_name: String,
}

/// Verifies identity tokens presented on `create-stage` / `join-stage`.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    /// Verify a token, returning the identity it asserts.
    async fn verify(&self, token: &str) -> Result<Identity, StageError>;
}

/// Claims carried by a Stagelink identity token.
#[derive(Debug, Serialize, Deserialize)]
struct IdentityClaims {
    /// Identity id.
    sub: String,
    /// Display name.
    name: String,
    /// Expiry (seconds since epoch).
    exp: i64,
}

/// HS256 verifier over the configured shared secret.
pub struct JwtIdentityVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtIdentityVerifier {
    #[must_use]
    pub fn new(secret: &SecretString) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.required_spec_claims = ["exp", "sub"].iter().map(ToString::to_string).collect();

        Self {
            decoding_key: DecodingKey::from_secret(secret.expose_secret().as_bytes()),
            validation,
        }
    }
}

#[async_trait]
impl IdentityVerifier for JwtIdentityVerifier {
    async fn verify(&self, token: &str) -> Result<Identity, StageError> {
        if token.len() > MAX_TOKEN_SIZE_BYTES {
            return Err(StageError::Authentication("token too large".to_string()));
        }

        let data = decode::<IdentityClaims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| {
                debug!(target: "stage.auth", error = %e, "Identity token rejected");
                StageError::Authentication(e.to_string())
            })?;

        Ok(Identity {
            identity_id: data.claims.sub,
            display_name: data.claims.name,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const TEST_SECRET: &str = "unit-test-identity-secret";

    fn issue(sub: &str, name: &str, exp_offset_secs: i64) -> String {
        let claims = IdentityClaims {
            sub: sub.to_string(),
            name: name.to_string(),
            exp: chrono::Utc::now().timestamp() + exp_offset_secs,
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(TEST_SECRET.as_bytes()),
        )
        .expect("token encoding should succeed")
    }

    fn verifier() -> JwtIdentityVerifier {
        JwtIdentityVerifier::new(&SecretString::from(TEST_SECRET.to_string()))
    }

    #[tokio::test]
    async fn test_valid_token_yields_identity() {
        let token = issue("identity-7", "First Violin", 3600);

        let identity = verifier().verify(&token).await.expect("token should verify");
        assert_eq!(identity.identity_id, "identity-7");
        assert_eq!(identity.display_name, "First Violin");
    }

    #[tokio::test]
    async fn test_expired_token_is_rejected() {
        let token = issue("identity-7", "First Violin", -3600);

        let result = verifier().verify(&token).await;
        assert!(matches!(result, Err(StageError::Authentication(_))));
    }

    #[tokio::test]
    async fn test_wrong_secret_is_rejected() {
        let claims = IdentityClaims {
            sub: "identity-7".to_string(),
            name: "First Violin".to_string(),
            exp: chrono::Utc::now().timestamp() + 3600,
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"some-other-secret"),
        )
        .expect("token encoding should succeed");

        let result = verifier().verify(&token).await;
        assert!(matches!(result, Err(StageError::Authentication(_))));
    }

    #[tokio::test]
    async fn test_garbage_token_is_rejected() {
        let result = verifier().verify("not-a-jwt").await;
        assert!(matches!(result, Err(StageError::Authentication(_))));
    }

    #[tokio::test]
    async fn test_oversized_token_is_rejected_before_parsing() {
        let token = "a".repeat(MAX_TOKEN_SIZE_BYTES + 1);
        let result = verifier().verify(&token).await;
        assert!(matches!(result, Err(StageError::Authentication(_))));
    }
}
