//! Anonymous, short-lived session tokens.
//!
//! Tokens are detached credentials: nothing server-side is consulted besides
//! the signing secret. The cryptographic signature is always authoritative;
//! any copy of the token string kept in the store is bookkeeping only.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use presence_types::{MomentId, SessionId};
use secrecy::{ExposeSecret as _, SecretString};
use serde::{Deserialize, Serialize};

const ISSUER: &str = "presence-service";
const AUDIENCE: &str = "presence-service-clients";

/// Errors raised while issuing or verifying a token.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    /// The token's signature, claims, or algorithm did not validate.
    #[error("invalid token")]
    Invalid,
    /// The token validated but its `exp` claim is in the past.
    #[error("expired token")]
    Expired,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: SessionId,
    moment_id: MomentId,
    iss: String,
    aud: String,
    iat: i64,
    exp: i64,
}

/// The outcome of a successful [`TokenService::verify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenClaims {
    /// The session the token was issued for.
    pub session_id: SessionId,
    /// The moment the token is bound to.
    pub moment_id: MomentId,
}

/// Mints and verifies session tokens with a fixed symmetric algorithm.
pub struct TokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    lifetime: ChronoDuration,
}

impl TokenService {
    /// Builds a service signing and verifying with `secret`, issuing tokens
    /// valid for `lifetime`.
    pub fn new(secret: &SecretString, lifetime: std::time::Duration) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims(&["exp", "iss", "aud"]);
        validation.set_issuer(&[ISSUER]);
        validation.set_audience(&[AUDIENCE]);
        validation.leeway = 0;

        Self {
            encoding_key: EncodingKey::from_secret(secret.expose_secret().as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.expose_secret().as_bytes()),
            validation,
            lifetime: ChronoDuration::from_std(lifetime).unwrap_or(ChronoDuration::hours(24)),
        }
    }

    /// Mints a signed token bound to `session_id`/`moment_id`, returning the
    /// encoded token and its expiry.
    pub fn issue(
        &self,
        session_id: SessionId,
        moment_id: MomentId,
    ) -> Result<(String, DateTime<Utc>), TokenError> {
        let now = Utc::now();
        let expires_at = now + self.lifetime;
        let claims = Claims {
            sub: session_id,
            moment_id,
            iss: ISSUER.to_owned(),
            aud: AUDIENCE.to_owned(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|_| TokenError::Invalid)?;
        Ok((token, expires_at))
    }

    /// Verifies a token's signature, issuer, audience, algorithm and expiry.
    pub fn verify(&self, token: &str) -> Result<TokenClaims, TokenError> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation).map_err(
            |err| match err.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => TokenError::Expired,
                _ => TokenError::Invalid,
            },
        )?;
        Ok(TokenClaims {
            session_id: data.claims.sub,
            moment_id: data.claims.moment_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> TokenService {
        TokenService::new(
            &SecretString::from("a-very-long-test-signing-secret-value".to_owned()),
            std::time::Duration::from_secs(60 * 60 * 24),
        )
    }

    #[test]
    fn verify_is_right_inverse_of_issue() {
        let svc = service();
        let session_id = SessionId::new();
        let moment_id = MomentId::new();
        let (token, _) = svc.issue(session_id, moment_id).unwrap();
        let claims = svc.verify(&token).unwrap();
        assert_eq!(claims.session_id, session_id);
        assert_eq!(claims.moment_id, moment_id);
    }

    #[test]
    fn verify_rejects_tokens_signed_with_a_different_secret() {
        let svc = service();
        let other = TokenService::new(
            &SecretString::from("a-completely-different-signing-secret".to_owned()),
            std::time::Duration::from_secs(3600),
        );
        let (token, _) = other.issue(SessionId::new(), MomentId::new()).unwrap();
        assert!(matches!(svc.verify(&token), Err(TokenError::Invalid)));
    }

    #[test]
    fn verify_rejects_expired_tokens() {
        let svc = TokenService::new(
            &SecretString::from("a-very-long-test-signing-secret-value".to_owned()),
            std::time::Duration::from_secs(0),
        );
        let (token, _) = svc.issue(SessionId::new(), MomentId::new()).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(1100));
        assert!(matches!(svc.verify(&token), Err(TokenError::Expired)));
    }
}
