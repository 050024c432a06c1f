//! Signed `state` parameter for the OAuth round trip.
//!
//! The state is a short-lived HS256 token carrying the landing page and a
//! random nonce. The same nonce goes into an `HttpOnly` cookie on the
//! outbound redirect, so a callback only succeeds in the browser that started
//! the flow.

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use rand::{Rng, distributions::Alphanumeric, rngs::OsRng};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use super::OAuthError;

pub const STATE_TTL_SECONDS: i64 = 10 * 60;
pub const NONCE_COOKIE: &str = "oauth_nonce";
const STATE_ISSUER: &str = "berhot-identity-oauth-state";
const NONCE_LEN: usize = 32;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthState {
    pub iss: String,
    pub redirect_uri: String,
    pub lang: String,
    pub nonce: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Clone)]
pub struct StateCodec {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl StateCodec {
    /// # Errors
    /// [`OAuthError::NotConfigured`] when the secret is empty.
    pub fn new(secret: &SecretString) -> Result<Self, OAuthError> {
        let secret = secret.expose_secret().as_bytes();
        if secret.is_empty() {
            return Err(OAuthError::NotConfigured);
        }
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[STATE_ISSUER]);
        validation.set_required_spec_claims(&["exp", "iss"]);
        validation.validate_aud = false;
        validation.leeway = 0;

        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            validation,
        })
    }

    /// Returns `(state, nonce)`; the nonce belongs in the cookie.
    ///
    /// # Errors
    /// [`OAuthError::InvalidState`] if signing fails.
    pub fn issue(&self, redirect_uri: &str, lang: &str) -> Result<(String, String), OAuthError> {
        let nonce: String = OsRng
            .sample_iter(&Alphanumeric)
            .take(NONCE_LEN)
            .map(char::from)
            .collect();
        let now = chrono::Utc::now().timestamp();
        let claims = OAuthState {
            iss: STATE_ISSUER.to_string(),
            redirect_uri: redirect_uri.to_string(),
            lang: lang.to_string(),
            nonce: nonce.clone(),
            iat: now,
            exp: now + STATE_TTL_SECONDS,
        };
        let state = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|_| OAuthError::InvalidState)?;
        Ok((state, nonce))
    }

    /// Verify signature, expiry and that `cookie_nonce` matches the state.
    ///
    /// # Errors
    /// [`OAuthError::InvalidState`] for every failure.
    pub fn verify(&self, state: &str, cookie_nonce: Option<&str>) -> Result<OAuthState, OAuthError> {
        let claims = decode::<OAuthState>(state, &self.decoding_key, &self.validation)
            .map_err(|_| OAuthError::InvalidState)?
            .claims;
        match cookie_nonce {
            Some(nonce) if !nonce.is_empty() && nonce == claims.nonce => Ok(claims),
            _ => Err(OAuthError::InvalidState),
        }
    }
}
