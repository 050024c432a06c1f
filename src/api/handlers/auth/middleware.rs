//! Bearer middleware for the customer and admin realms.
//!
//! Flow Overview: read the bearer token, verify it with the realm's codec,
//! check the session is not revoked, then insert the [`AuthContext`] as a
//! request extension. Every refusal is the same 401 body.

use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use tracing::debug;

use super::{AuthState, utils::bearer_token};
use crate::api::error::{ApiError, ApiResult};
use crate::realm::{AuthContext, AuthError, Realm};

/// Resolve the bearer token on `headers` into a context for `realm`.
///
/// # Errors
/// [`ApiError::Unauthorized`] for any refused credential.
pub async fn require_realm(
    headers: &HeaderMap,
    state: &AuthState,
    realm: Realm,
) -> ApiResult<AuthContext> {
    let token = bearer_token(headers).ok_or(AuthError::MissingToken)?;
    match state.realm(realm).authenticate(token).await {
        Ok(context) => Ok(context),
        Err(err) => {
            if !err.is_internal() {
                debug!(%realm, "bearer rejected: {err}");
            }
            Err(err.into())
        }
    }
}

async fn inject(
    state: &AuthState,
    realm: Realm,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let context = require_realm(request.headers(), state, realm).await?;
    request.extensions_mut().insert(context);
    Ok(next.run(request).await)
}

/// # Errors
/// 401 when the request carries no valid customer session.
pub async fn require_customer(
    State(state): State<Arc<AuthState>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    inject(&state, Realm::Customer, request, next).await
}

/// # Errors
/// 401 when the request carries no valid admin session.
pub async fn require_admin(
    State(state): State<Arc<AuthState>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    inject(&state, Realm::Admin, request, next).await
}
