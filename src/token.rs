//! Bearer token codec.
//!
//! Tokens are compact HS256 JWTs. Each [`TokenCodec`] is bound to one
//! [`Realm`]: it stamps that realm's issuer on every token it mints and
//! requires the same issuer on every token it verifies. Every verification
//! failure collapses into [`TokenError::Invalid`].

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::realm::Realm;

pub const DEFAULT_ACCESS_TTL_SECONDS: i64 = 15 * 60;
pub const DEFAULT_REFRESH_TTL_SECONDS: i64 = 7 * 24 * 60 * 60;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("invalid token")]
    Invalid,
    #[error("token signing secret is not configured")]
    MissingSecret,
    #[error("failed to sign token")]
    Signing(#[source] jsonwebtoken::errors::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
}

/// Identity stamped into an access token.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subject {
    pub principal_id: Uuid,
    pub tenant_id: Option<Uuid>,
    pub email: Option<String>,
    pub role: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessClaims {
    pub iss: String,
    /// Principal id.
    pub sub: Uuid,
    #[serde(rename = "tenantId", default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub role: String,
    /// Session the token was minted for.
    pub sid: Uuid,
    pub typ: TokenKind,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshClaims {
    pub iss: String,
    /// Session id.
    pub sub: Uuid,
    /// Principal id.
    pub uid: Uuid,
    #[serde(rename = "tenantId", default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<Uuid>,
    pub typ: TokenKind,
    /// Keeps two pairs minted for one session in the same second distinct.
    pub jti: Uuid,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    /// Access token lifetime in seconds.
    pub expires_in: i64,
}

#[derive(Clone)]
pub struct TokenCodec {
    realm: Realm,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    access_ttl_seconds: i64,
    refresh_ttl_seconds: i64,
}

impl fmt::Debug for TokenCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenCodec")
            .field("realm", &self.realm)
            .field("access_ttl_seconds", &self.access_ttl_seconds)
            .field("refresh_ttl_seconds", &self.refresh_ttl_seconds)
            .finish_non_exhaustive()
    }
}

impl TokenCodec {
    /// Build a codec for `realm` using the default lifetimes.
    ///
    /// # Errors
    /// Returns [`TokenError::MissingSecret`] when the secret is empty.
    pub fn new(realm: Realm, secret: &SecretString) -> Result<Self, TokenError> {
        let secret = secret.expose_secret().as_bytes();
        if secret.is_empty() {
            return Err(TokenError::MissingSecret);
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[realm.issuer()]);
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);
        validation.validate_aud = false;
        validation.leeway = 0;

        Ok(Self {
            realm,
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            validation,
            access_ttl_seconds: DEFAULT_ACCESS_TTL_SECONDS,
            refresh_ttl_seconds: DEFAULT_REFRESH_TTL_SECONDS,
        })
    }

    #[must_use]
    pub fn with_access_ttl_seconds(mut self, seconds: i64) -> Self {
        self.access_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_refresh_ttl_seconds(mut self, seconds: i64) -> Self {
        self.refresh_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn realm(&self) -> Realm {
        self.realm
    }

    #[must_use]
    pub fn access_ttl_seconds(&self) -> i64 {
        self.access_ttl_seconds
    }

    #[must_use]
    pub fn refresh_ttl_seconds(&self) -> i64 {
        self.refresh_ttl_seconds
    }

    /// Mint an access/refresh pair for `subject` bound to `session_id`.
    ///
    /// # Errors
    /// Returns [`TokenError::Signing`] if the signer rejects the claims.
    pub fn issue(&self, subject: &Subject, session_id: Uuid) -> Result<TokenPair, TokenError> {
        self.issue_at(subject, session_id, chrono::Utc::now().timestamp())
    }

    fn issue_at(
        &self,
        subject: &Subject,
        session_id: Uuid,
        now: i64,
    ) -> Result<TokenPair, TokenError> {
        let header = Header::new(Algorithm::HS256);

        let access = AccessClaims {
            iss: self.realm.issuer().to_string(),
            sub: subject.principal_id,
            tenant_id: subject.tenant_id,
            email: subject.email.clone(),
            role: subject.role.clone(),
            sid: session_id,
            typ: TokenKind::Access,
            iat: now,
            exp: now + self.access_ttl_seconds,
        };
        let refresh = RefreshClaims {
            iss: self.realm.issuer().to_string(),
            sub: session_id,
            uid: subject.principal_id,
            tenant_id: subject.tenant_id,
            typ: TokenKind::Refresh,
            jti: Uuid::new_v4(),
            iat: now,
            exp: now + self.refresh_ttl_seconds,
        };

        let access_token =
            encode(&header, &access, &self.encoding_key).map_err(TokenError::Signing)?;
        let refresh_token =
            encode(&header, &refresh, &self.encoding_key).map_err(TokenError::Signing)?;

        Ok(TokenPair {
            access_token,
            refresh_token,
            expires_in: self.access_ttl_seconds,
        })
    }

    /// Verify an access token minted by this realm.
    ///
    /// # Errors
    /// Returns [`TokenError::Invalid`] for any signature, expiry, shape or issuer failure.
    pub fn verify_access(&self, token: &str) -> Result<AccessClaims, TokenError> {
        let claims = decode::<AccessClaims>(token, &self.decoding_key, &self.validation)
            .map_err(|_| TokenError::Invalid)?
            .claims;
        if claims.typ == TokenKind::Access {
            Ok(claims)
        } else {
            Err(TokenError::Invalid)
        }
    }

    /// Verify a refresh token minted by this realm.
    ///
    /// # Errors
    /// Returns [`TokenError::Invalid`] for any signature, expiry, shape or issuer failure.
    pub fn verify_refresh(&self, token: &str) -> Result<RefreshClaims, TokenError> {
        let claims = decode::<RefreshClaims>(token, &self.decoding_key, &self.validation)
            .map_err(|_| TokenError::Invalid)?
            .claims;
        if claims.typ == TokenKind::Refresh {
            Ok(claims)
        } else {
            Err(TokenError::Invalid)
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use anyhow::Result;

    fn secret() -> SecretString {
        SecretString::from("test-secret-with-enough-entropy-000000".to_string())
    }

    fn subject() -> Subject {
        Subject {
            principal_id: Uuid::new_v4(),
            tenant_id: Some(Uuid::new_v4()),
            email: Some("amy@example.com".to_string()),
            role: "tenant_owner".to_string(),
        }
    }

    #[test]
    fn access_token_round_trips_claims() -> Result<()> {
        let codec = TokenCodec::new(Realm::Customer, &secret())?;
        let subject = subject();
        let session_id = Uuid::new_v4();

        let pair = codec.issue(&subject, session_id)?;
        let claims = codec.verify_access(&pair.access_token)?;

        assert_eq!(claims.sub, subject.principal_id);
        assert_eq!(claims.tenant_id, subject.tenant_id);
        assert_eq!(claims.email, subject.email);
        assert_eq!(claims.role, "tenant_owner");
        assert_eq!(claims.sid, session_id);
        assert_eq!(claims.iss, "berhot-identity");
        assert_eq!(pair.expires_in, DEFAULT_ACCESS_TTL_SECONDS);
        Ok(())
    }

    #[test]
    fn refresh_token_carries_session_as_subject() -> Result<()> {
        let codec = TokenCodec::new(Realm::Customer, &secret())?;
        let subject = subject();
        let session_id = Uuid::new_v4();

        let pair = codec.issue(&subject, session_id)?;
        let claims = codec.verify_refresh(&pair.refresh_token)?;

        assert_eq!(claims.sub, session_id);
        assert_eq!(claims.uid, subject.principal_id);
        assert_eq!(claims.exp - claims.iat, DEFAULT_REFRESH_TTL_SECONDS);
        Ok(())
    }

    #[test]
    fn refresh_tokens_differ_within_one_second() -> Result<()> {
        let codec = TokenCodec::new(Realm::Customer, &secret())?;
        let subject = subject();
        let session_id = Uuid::new_v4();

        let first = codec.issue_at(&subject, session_id, 1_700_000_000)?;
        let second = codec.issue_at(&subject, session_id, 1_700_000_000)?;
        assert_ne!(first.refresh_token, second.refresh_token);
        Ok(())
    }

    #[test]
    fn realms_never_accept_each_others_tokens() -> Result<()> {
        let customer = TokenCodec::new(Realm::Customer, &secret())?;
        let admin = TokenCodec::new(Realm::Admin, &secret())?;
        let subject = subject();

        let customer_pair = customer.issue(&subject, Uuid::new_v4())?;
        let admin_pair = admin.issue(&subject, Uuid::new_v4())?;

        assert!(matches!(
            admin.verify_access(&customer_pair.access_token),
            Err(TokenError::Invalid)
        ));
        assert!(matches!(
            admin.verify_refresh(&customer_pair.refresh_token),
            Err(TokenError::Invalid)
        ));
        assert!(matches!(
            customer.verify_access(&admin_pair.access_token),
            Err(TokenError::Invalid)
        ));
        assert!(matches!(
            customer.verify_refresh(&admin_pair.refresh_token),
            Err(TokenError::Invalid)
        ));
        Ok(())
    }

    #[test]
    fn expired_access_token_is_rejected() -> Result<()> {
        let codec = TokenCodec::new(Realm::Customer, &secret())?;
        let an_hour_ago = chrono::Utc::now().timestamp() - 3600;

        let pair = codec.issue_at(&subject(), Uuid::new_v4(), an_hour_ago)?;

        assert!(matches!(
            codec.verify_access(&pair.access_token),
            Err(TokenError::Invalid)
        ));
        // The refresh lifetime is a week, so it is still valid.
        assert!(codec.verify_refresh(&pair.refresh_token).is_ok());
        Ok(())
    }

    #[test]
    fn tokens_stop_verifying_right_after_exp() -> Result<()> {
        let codec = TokenCodec::new(Realm::Customer, &secret())?;
        let now = chrono::Utc::now().timestamp();

        let lapsed = codec.issue_at(&subject(), Uuid::new_v4(), now - DEFAULT_ACCESS_TTL_SECONDS - 1)?;
        assert!(matches!(
            codec.verify_access(&lapsed.access_token),
            Err(TokenError::Invalid)
        ));

        let live = codec.issue_at(&subject(), Uuid::new_v4(), now - DEFAULT_ACCESS_TTL_SECONDS + 5)?;
        assert!(codec.verify_access(&live.access_token).is_ok());
        Ok(())
    }

    #[test]
    fn token_kinds_are_not_interchangeable() -> Result<()> {
        let codec = TokenCodec::new(Realm::Admin, &secret())?;
        let pair = codec.issue(&subject(), Uuid::new_v4())?;

        assert!(codec.verify_access(&pair.refresh_token).is_err());
        assert!(codec.verify_refresh(&pair.access_token).is_err());
        Ok(())
    }

    #[test]
    fn foreign_secret_and_garbage_are_rejected() -> Result<()> {
        let codec = TokenCodec::new(Realm::Customer, &secret())?;
        let other = TokenCodec::new(
            Realm::Customer,
            &SecretString::from("another-secret".to_string()),
        )?;
        let pair = other.issue(&subject(), Uuid::new_v4())?;

        assert!(codec.verify_access(&pair.access_token).is_err());
        assert!(codec.verify_access("not.a.jwt").is_err());
        assert!(codec.verify_access("").is_err());
        Ok(())
    }

    #[test]
    fn empty_secret_is_a_configuration_error() {
        let result = TokenCodec::new(Realm::Customer, &SecretString::from(String::new()));
        assert!(matches!(result, Err(TokenError::MissingSecret)));
    }
}
