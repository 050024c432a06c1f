use anyhow::{Context, Result, anyhow};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::{fmt, time::Duration};
use tracing::{Instrument, info_span};
use url::Url;

use crate::APP_USER_AGENT;

const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const GOOGLE_USERINFO_URL: &str = "https://www.googleapis.com/oauth2/v2/userinfo";
const GOOGLE_SCOPES: &str = "openid email profile";
const PROVIDER_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct GoogleConfig {
    pub client_id: String,
    pub client_secret: SecretString,
    pub redirect_url: String,
}

impl fmt::Debug for GoogleConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GoogleConfig")
            .field("client_id", &self.client_id)
            .field("redirect_url", &self.redirect_url)
            .finish_non_exhaustive()
    }
}

/// Tokens returned by the provider's code exchange.
#[derive(Clone, Deserialize)]
pub struct ProviderTokens {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct GoogleProfile {
    pub id: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub verified_email: bool,
    #[serde(default)]
    pub given_name: String,
    #[serde(default)]
    pub family_name: String,
    #[serde(default)]
    pub picture: Option<String>,
}

#[derive(Clone, Debug)]
pub struct GoogleProvider {
    config: GoogleConfig,
    http: reqwest::Client,
}

impl GoogleProvider {
    /// # Errors
    /// Returns error if the HTTP client cannot be built.
    pub fn new(config: GoogleConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(APP_USER_AGENT)
            .timeout(PROVIDER_TIMEOUT)
            .build()
            .context("Failed to build OAuth HTTP client")?;
        Ok(Self { config, http })
    }

    /// Consent screen URL carrying the signed `state`.
    ///
    /// # Errors
    /// Returns error if the static endpoint fails to parse.
    pub fn authorization_url(&self, state: &str) -> Result<Url> {
        Url::parse_with_params(
            GOOGLE_AUTH_URL,
            &[
                ("client_id", self.config.client_id.as_str()),
                ("redirect_uri", self.config.redirect_url.as_str()),
                ("response_type", "code"),
                ("scope", GOOGLE_SCOPES),
                ("access_type", "offline"),
                ("state", state),
            ],
        )
        .context("Invalid Google authorization endpoint")
    }

    /// Exchange an authorization code for provider tokens.
    ///
    /// # Errors
    /// Returns error on transport failure or a non-success response.
    pub async fn exchange(&self, code: &str) -> Result<ProviderTokens> {
        let span = info_span!("oauth.exchange", provider = "google");
        let response = self
            .http
            .post(GOOGLE_TOKEN_URL)
            .form(&[
                ("code", code),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.expose_secret()),
                ("redirect_uri", self.config.redirect_url.as_str()),
                ("grant_type", "authorization_code"),
            ])
            .send()
            .instrument(span)
            .await
            .context("Token exchange request failed")?;

        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("Token exchange returned {status}"));
        }
        response
            .json::<ProviderTokens>()
            .await
            .context("Token exchange returned an unreadable body")
    }

    /// Fetch the profile; returns it parsed and as the raw JSON payload.
    ///
    /// # Errors
    /// Returns error on transport failure, a non-success response, or a
    /// profile without a subject id.
    pub async fn profile(&self, access_token: &str) -> Result<(GoogleProfile, serde_json::Value)> {
        let span = info_span!("oauth.userinfo", provider = "google");
        let response = self
            .http
            .get(GOOGLE_USERINFO_URL)
            .bearer_auth(access_token)
            .send()
            .instrument(span)
            .await
            .context("Userinfo request failed")?;

        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("Userinfo returned {status}"));
        }
        let raw: serde_json::Value = response
            .json()
            .await
            .context("Userinfo returned an unreadable body")?;
        let profile: GoogleProfile =
            serde_json::from_value(raw.clone()).context("Userinfo payload has an unexpected shape")?;
        if profile.id.is_empty() {
            return Err(anyhow!("Userinfo payload is missing the subject id"));
        }
        Ok((profile, raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authorization_url_carries_offline_scopes_and_state() -> Result<()> {
        let provider = GoogleProvider::new(GoogleConfig {
            client_id: "client-123".to_string(),
            client_secret: SecretString::from("shh".to_string()),
            redirect_url: "http://localhost:8080/api/v1/auth/oauth/google/callback".to_string(),
        })?;

        let url = provider.authorization_url("signed.state.value")?;
        let params: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();

        assert_eq!(url.host_str(), Some("accounts.google.com"));
        assert_eq!(params.get("client_id").map(String::as_str), Some("client-123"));
        assert_eq!(params.get("scope").map(String::as_str), Some("openid email profile"));
        assert_eq!(params.get("access_type").map(String::as_str), Some("offline"));
        assert_eq!(params.get("state").map(String::as_str), Some("signed.state.value"));
        assert!(!url.as_str().contains("shh"));
        Ok(())
    }

    #[test]
    fn profile_tolerates_missing_optional_fields() -> Result<()> {
        let profile: GoogleProfile = serde_json::from_value(serde_json::json!({
            "id": "1089",
            "email": "amy@example.com"
        }))?;
        assert_eq!(profile.id, "1089");
        assert!(!profile.verified_email);
        assert_eq!(profile.given_name, "");
        Ok(())
    }

    #[test]
    fn debug_output_hides_the_client_secret() {
        let config = GoogleConfig {
            client_id: "client-123".to_string(),
            client_secret: SecretString::from("shh-secret".to_string()),
            redirect_url: "http://localhost/cb".to_string(),
        };
        assert!(!format!("{config:?}").contains("shh-secret"));
    }
}
