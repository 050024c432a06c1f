//! Google OAuth delegation.
//!
//! The browser is sent to Google with a signed `state`; the callback checks
//! it, exchanges the code and resolves the account. Results travel back to
//! the frontend in the URL fragment so tokens never hit server logs.

mod provider;
mod state;

pub use provider::{GoogleConfig, GoogleProfile, GoogleProvider, ProviderTokens};
pub use state::{NONCE_COOKIE, OAuthState, STATE_TTL_SECONDS, StateCodec};

use thiserror::Error;
use url::{Url, form_urlencoded};

use crate::token::TokenPair;

pub const PROVIDER_GOOGLE: &str = "google";
const DEFAULT_LANG: &str = "en";

#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("Google OAuth is not configured. Set GOOGLE_CLIENT_ID and GOOGLE_CLIENT_SECRET.")]
    NotConfigured,
    #[error("invalid OAuth state")]
    InvalidState,
    #[error("Failed to exchange authorization code")]
    Exchange(#[source] anyhow::Error),
    #[error("Failed to get user info from Google")]
    Profile(#[source] anyhow::Error),
}

/// Decides where the browser lands after the callback.
#[derive(Clone, Debug)]
pub struct RedirectPolicy {
    frontend_url: String,
    allowed_origins: Vec<String>,
}

impl RedirectPolicy {
    #[must_use]
    pub fn new(frontend_url: &str, allowed_origins: &[String]) -> Self {
        let frontend_url = frontend_url.trim_end_matches('/').to_string();
        let mut origins: Vec<String> = Vec::new();
        for origin in allowed_origins
            .iter()
            .map(String::as_str)
            .chain(std::iter::once(frontend_url.as_str()))
            .filter_map(origin_of)
        {
            if !origins.contains(&origin) {
                origins.push(origin);
            }
        }
        Self {
            frontend_url,
            allowed_origins: origins,
        }
    }

    /// `<frontend>/<lang>/signin`.
    #[must_use]
    pub fn default_landing(&self, lang: &str) -> String {
        format!("{}/{}/signin", self.frontend_url, sanitize_lang(lang))
    }

    /// The requested URI if its origin is allowed, else the default landing page.
    #[must_use]
    pub fn resolve(&self, requested: Option<&str>, lang: &str) -> String {
        requested
            .filter(|uri| !uri.is_empty())
            .filter(|uri| origin_of(uri).is_some_and(|o| self.allowed_origins.contains(&o)))
            .map_or_else(|| self.default_landing(lang), ToString::to_string)
    }
}

fn origin_of(uri: &str) -> Option<String> {
    let url = Url::parse(uri.trim()).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    let host = url.host_str()?;
    let port = url.port().map_or_else(String::new, |port| format!(":{port}"));
    Some(format!("{}://{}{}", url.scheme(), host, port))
}

/// Language codes are path segments; anything odd falls back to `en`.
#[must_use]
pub fn sanitize_lang(lang: &str) -> &str {
    let valid = (2..=10).contains(&lang.len())
        && lang.chars().all(|c| c.is_ascii_alphabetic() || c == '-');
    if valid { lang } else { DEFAULT_LANG }
}

/// Replace any fragment already on `landing` with `fragment`.
fn with_fragment(landing: &str, fragment: &str) -> String {
    match Url::parse(landing) {
        Ok(mut url) => {
            url.set_fragment(Some(fragment));
            url.into()
        }
        Err(_) => {
            let base = landing.split_once('#').map_or(landing, |(base, _)| base);
            format!("{base}#{fragment}")
        }
    }
}

/// Landing URL for a first-time Google user; no tokens are minted.
#[must_use]
pub fn new_user_redirect(landing: &str, profile: &GoogleProfile) -> String {
    let fragment = form_urlencoded::Serializer::new(String::new())
        .append_pair("google_new_user", "true")
        .append_pair("google_email", &profile.email)
        .append_pair("google_first_name", &profile.given_name)
        .append_pair("google_last_name", &profile.family_name)
        .append_pair("google_id", &profile.id)
        .finish();
    with_fragment(landing, &fragment)
}

#[must_use]
pub fn tokens_redirect(landing: &str, tokens: &TokenPair) -> String {
    let fragment = form_urlencoded::Serializer::new(String::new())
        .append_pair("access_token", &tokens.access_token)
        .append_pair("refresh_token", &tokens.refresh_token)
        .append_pair("expires_in", &tokens.expires_in.to_string())
        .finish();
    with_fragment(landing, &fragment)
}

#[must_use]
pub fn error_redirect(landing: &str, message: &str) -> String {
    let fragment = form_urlencoded::Serializer::new(String::new())
        .append_pair("error", message)
        .finish();
    with_fragment(landing, &fragment)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RedirectPolicy {
        RedirectPolicy::new(
            "http://localhost:3000/",
            &["https://app.berhot.com".to_string(), "http://localhost:3001".to_string()],
        )
    }

    #[test]
    fn allowed_origins_are_honoured() {
        let policy = policy();
        assert_eq!(
            policy.resolve(Some("https://app.berhot.com/ar/signin"), "ar"),
            "https://app.berhot.com/ar/signin"
        );
        assert_eq!(
            policy.resolve(Some("http://localhost:3000/en/welcome"), "en"),
            "http://localhost:3000/en/welcome"
        );
    }

    #[test]
    fn foreign_or_malformed_redirects_fall_back() {
        let policy = policy();
        assert_eq!(
            policy.resolve(Some("https://evil.example/steal"), "en"),
            "http://localhost:3000/en/signin"
        );
        assert_eq!(
            policy.resolve(Some("https://app.berhot.com.evil.example/"), "ar"),
            "http://localhost:3000/ar/signin"
        );
        assert_eq!(
            policy.resolve(Some("javascript:alert(1)"), "en"),
            "http://localhost:3000/en/signin"
        );
        assert_eq!(policy.resolve(None, "en"), "http://localhost:3000/en/signin");
    }

    #[test]
    fn odd_language_codes_are_replaced() {
        assert_eq!(sanitize_lang("ar"), "ar");
        assert_eq!(sanitize_lang("pt-BR"), "pt-BR");
        assert_eq!(sanitize_lang("../admin"), "en");
        assert_eq!(sanitize_lang(""), "en");
    }

    #[test]
    fn fragments_are_url_encoded() {
        let profile = GoogleProfile {
            id: "42".to_string(),
            email: "amy+test@example.com".to_string(),
            verified_email: true,
            given_name: "Amy".to_string(),
            family_name: "Pond Williams".to_string(),
            picture: None,
        };
        let url = new_user_redirect("http://localhost:3000/en/signin", &profile);
        assert_eq!(
            url,
            "http://localhost:3000/en/signin#google_new_user=true&google_email=amy%2Btest%40example.com\
             &google_first_name=Amy&google_last_name=Pond+Williams&google_id=42"
        );

        let tokens = TokenPair {
            access_token: "a.b.c".to_string(),
            refresh_token: "d.e.f".to_string(),
            expires_in: 900,
        };
        assert_eq!(
            tokens_redirect("http://x/en/signin", &tokens),
            "http://x/en/signin#access_token=a.b.c&refresh_token=d.e.f&expires_in=900"
        );
        assert_eq!(
            error_redirect("http://x/en/signin", "Failed to exchange authorization code"),
            "http://x/en/signin#error=Failed+to+exchange+authorization+code"
        );
    }

    #[test]
    fn landing_fragment_is_replaced_not_doubled() {
        let tokens = TokenPair {
            access_token: "a.b.c".to_string(),
            refresh_token: "d.e.f".to_string(),
            expires_in: 900,
        };
        let url = tokens_redirect("https://app.berhot.com/ar/signin#step=2", &tokens);
        assert_eq!(
            url,
            "https://app.berhot.com/ar/signin#access_token=a.b.c&refresh_token=d.e.f&expires_in=900"
        );
        assert_eq!(url.matches('#').count(), 1);

        assert_eq!(
            error_redirect("https://app.berhot.com/ar/signin?x=1#old", "denied"),
            "https://app.berhot.com/ar/signin?x=1#error=denied"
        );
    }
}
