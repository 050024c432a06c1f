//! Google sign-in redirects.
//!
//! Flow Overview:
//! 1) `start` resolves the landing page against the allowed origins, signs a
//!    state carrying it plus a nonce, sets the nonce cookie and redirects to
//!    Google.
//! 2) `callback` checks the state against the cookie, exchanges the code and
//!    resolves the account. Known users land with a token pair in the URL
//!    fragment; new users land with their Google profile so the client can
//!    register. Every failure after the state check lands with an `error`.

use axum::{
    Extension,
    extract::Query,
    http::{HeaderMap, HeaderValue, header::SET_COOKIE},
    response::{AppendHeaders, IntoResponse, Redirect, Response},
};
use std::sync::Arc;
use tracing::{instrument, warn};

use super::{
    AuthState,
    types::{ErrorBody, OAuthCallbackQuery, OAuthStartQuery},
    utils::{cookie_value, session_meta},
};
use crate::api::error::{ApiError, ApiResult};
use crate::oauth::{
    GoogleProvider, NONCE_COOKIE, OAuthError, STATE_TTL_SECONDS, error_redirect,
    new_user_redirect, sanitize_lang, tokens_redirect,
};

const COOKIE_PATH: &str = "/api/v1/auth/oauth";
const DEFAULT_LANG: &str = "en";

fn nonce_cookie(nonce: &str, max_age: i64) -> ApiResult<HeaderValue> {
    HeaderValue::from_str(&format!(
        "{NONCE_COOKIE}={nonce}; Path={COOKIE_PATH}; Max-Age={max_age}; HttpOnly; SameSite=Lax"
    ))
    .map_err(|err| ApiError::internal("Failed to build OAuth cookie", err))
}

fn google(auth: &AuthState) -> ApiResult<&GoogleProvider> {
    auth.google().ok_or_else(|| OAuthError::NotConfigured.into())
}

#[utoipa::path(
    get,
    path = "/api/v1/auth/oauth/google",
    params(OAuthStartQuery),
    responses(
        (status = 307, description = "Redirect to Google consent"),
        (status = 501, description = "Google OAuth is not configured", body = ErrorBody)
    ),
    tag = "oauth"
)]
#[instrument(skip(auth, query))]
pub async fn start(
    Extension(auth): Extension<Arc<AuthState>>,
    Query(query): Query<OAuthStartQuery>,
) -> ApiResult<Response> {
    let provider = google(&auth)?;
    let lang = sanitize_lang(query.lang.as_deref().unwrap_or(DEFAULT_LANG));
    let landing = auth.redirects().resolve(query.redirect_uri.as_deref(), lang);

    let (state, nonce) = auth.oauth_state().issue(&landing, lang)?;
    let url = provider
        .authorization_url(&state)
        .map_err(|err| ApiError::internal("Failed to build Google authorization URL", err))?;

    let cookie = nonce_cookie(&nonce, STATE_TTL_SECONDS)?;
    Ok((
        AppendHeaders([(SET_COOKIE, cookie)]),
        Redirect::temporary(url.as_str()),
    )
        .into_response())
}

#[utoipa::path(
    get,
    path = "/api/v1/auth/oauth/google/callback",
    params(OAuthCallbackQuery),
    responses(
        (status = 307, description = "Redirect to the frontend with the result in the fragment"),
        (status = 501, description = "Google OAuth is not configured", body = ErrorBody)
    ),
    tag = "oauth"
)]
#[instrument(skip(auth, headers, query))]
pub async fn callback(
    Extension(auth): Extension<Arc<AuthState>>,
    headers: HeaderMap,
    Query(query): Query<OAuthCallbackQuery>,
) -> ApiResult<Response> {
    let provider = google(&auth)?;
    let location = resolve_callback(&auth, provider, &headers, query).await;
    let cleared = nonce_cookie("", 0)?;
    Ok((
        AppendHeaders([(SET_COOKIE, cleared)]),
        Redirect::temporary(&location),
    )
        .into_response())
}

async fn resolve_callback(
    auth: &AuthState,
    provider: &GoogleProvider,
    headers: &HeaderMap,
    query: OAuthCallbackQuery,
) -> String {
    let nonce = cookie_value(headers, NONCE_COOKIE);
    let state = match query
        .state
        .as_deref()
        .map(|state| auth.oauth_state().verify(state, nonce))
    {
        Some(Ok(state)) => state,
        _ => {
            warn!("oauth callback with invalid state");
            let landing = auth.redirects().default_landing(DEFAULT_LANG);
            return error_redirect(&landing, "Invalid OAuth state");
        }
    };
    let landing = state.redirect_uri;

    if let Some(error) = query.error {
        warn!(%error, "google returned an authorization error");
        return error_redirect(&landing, "Google sign-in was cancelled");
    }
    let Some(code) = query.code.filter(|code| !code.is_empty()) else {
        return error_redirect(&landing, "Missing authorization code");
    };

    let tokens = match provider.exchange(&code).await {
        Ok(tokens) => tokens,
        Err(err) => {
            warn!("google code exchange failed: {err:#}");
            return error_redirect(&landing, "Failed to exchange authorization code");
        }
    };
    let (profile, raw) = match provider.profile(&tokens.access_token).await {
        Ok(profile) => profile,
        Err(err) => {
            warn!("google profile fetch failed: {err:#}");
            return error_redirect(&landing, "Failed to get user info from Google");
        }
    };

    let principal = match auth.provisioner().resolve_google(&profile, &tokens, raw).await {
        Ok(Some(principal)) => principal,
        Ok(None) => return new_user_redirect(&landing, &profile),
        Err(err) => {
            warn!("google account resolution failed: {err:#}");
            return error_redirect(&landing, "Failed to sign in with Google");
        }
    };

    let customers = auth.customer();
    if let Err(err) = customers.directory().record_login(principal.id).await {
        warn!(user_id = %principal.id, "failed to record google login: {err:#}");
    }
    match customers
        .start_session(&principal, session_meta(headers))
        .await
    {
        Ok(session) => tokens_redirect(&landing, &session.tokens),
        Err(err) => {
            warn!(user_id = %principal.id, "failed to start google session: {err:#}");
            error_redirect(&landing, "Failed to sign in with Google")
        }
    }
}
