//! Password sign-in and session lifecycle for the customer realm.

use axum::{Extension, Json, http::HeaderMap};
use std::sync::Arc;
use tracing::{debug, instrument};

use super::{
    AuthState,
    types::{
        AuthResponse, CheckUserRequest, CheckUserResponse, ErrorBody, LoginRequest, MeResponse,
        MessageResponse, RefreshRequest, TokenResponse,
    },
    utils::session_meta,
};
use crate::api::error::{ApiError, ApiResult};
use crate::credential::CredentialVerifier;
use crate::identity::{UserLookup, classify};
use crate::realm::{AuthContext, PrincipalRecord, RealmAuth};

const INVALID_LOGIN: &str = "Invalid email or password";

/// Check `password` for `identifier` in `realm`. Unknown identifiers, accounts
/// without a password, inactive accounts and wrong passwords all fail with
/// the same `refusal` message after comparable bcrypt work.
pub(crate) async fn verify_password(
    realm: &RealmAuth,
    verifier: CredentialVerifier,
    identifier: &str,
    password: &str,
    refusal: &str,
) -> ApiResult<PrincipalRecord> {
    let refused = || ApiError::Unauthorized(refusal.to_string());

    let lookup = classify(identifier).map(|id| id.as_str().to_string());
    let record = match lookup {
        Some(identifier) => realm
            .directory()
            .find_login(&identifier)
            .await
            .map_err(|err| ApiError::internal("Database error", err))?,
        None => None,
    };

    let Some((record, hash)) =
        record.and_then(|r| r.password_hash.clone().map(|hash| (r, hash)))
    else {
        // Burn the same work factor so timing does not reveal unknown accounts.
        verifier
            .hash(password)
            .await
            .map_err(|err| ApiError::internal("Failed to verify password", err))?;
        return Err(refused());
    };

    let matched = verifier
        .verify(password, &hash)
        .await
        .map_err(|err| ApiError::internal("Failed to verify password", err))?;
    if !matched || !record.is_active() {
        debug!(realm = %realm.realm(), principal_id = %record.principal.id, "password login refused");
        return Err(refused());
    }

    realm
        .directory()
        .record_login(record.principal.id)
        .await
        .map_err(|err| ApiError::internal("Database error", err))?;
    Ok(record.principal)
}

#[utoipa::path(
    post,
    path = "/api/v1/auth/check-user",
    request_body = CheckUserRequest,
    responses(
        (status = 200, description = "Whether an active account holds the identifier", body = CheckUserResponse),
        (status = 400, description = "Validation error", body = ErrorBody)
    ),
    tag = "auth"
)]
#[instrument(skip(auth, request))]
pub async fn check_user(
    Extension(auth): Extension<Arc<AuthState>>,
    Json(request): Json<CheckUserRequest>,
) -> ApiResult<Json<CheckUserResponse>> {
    if request.identifier.trim().is_empty() {
        return Err(ApiError::Validation("Identifier is required".to_string()));
    }
    let response = match auth.provisioner().check_user(&request.identifier).await? {
        UserLookup::Unknown => CheckUserResponse {
            exists: false,
            method: None,
            destination: None,
        },
        UserLookup::Known {
            method,
            destination,
        } => CheckUserResponse {
            exists: true,
            method: Some(method.as_str().to_string()),
            destination,
        },
    };
    Ok(Json(response))
}

#[utoipa::path(
    post,
    path = "/api/v1/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Signed in", body = AuthResponse),
        (status = 401, description = "Invalid email or password", body = ErrorBody)
    ),
    tag = "auth"
)]
#[instrument(skip(auth, headers, request))]
pub async fn login(
    Extension(auth): Extension<Arc<AuthState>>,
    headers: HeaderMap,
    Json(request): Json<LoginRequest>,
) -> ApiResult<Json<AuthResponse>> {
    if request.email.trim().is_empty() || request.password.is_empty() {
        return Err(ApiError::Validation(
            "Email and password are required".to_string(),
        ));
    }
    let principal = verify_password(
        auth.customer(),
        auth.verifier(),
        &request.email,
        &request.password,
        INVALID_LOGIN,
    )
    .await?;
    let session = auth
        .customer()
        .start_session(&principal, session_meta(&headers))
        .await?;
    Ok(Json(AuthResponse::new(&principal, session.tokens)))
}

#[utoipa::path(
    post,
    path = "/api/v1/auth/refresh",
    request_body = RefreshRequest,
    responses(
        (status = 200, description = "Rotated token pair", body = TokenResponse),
        (status = 401, description = "Unauthorized", body = ErrorBody)
    ),
    tag = "auth"
)]
#[instrument(skip(auth, request))]
pub async fn refresh(
    Extension(auth): Extension<Arc<AuthState>>,
    Json(request): Json<RefreshRequest>,
) -> ApiResult<Json<TokenResponse>> {
    let session = auth.customer().refresh(&request.refresh_token).await?;
    Ok(Json(session.tokens.into()))
}

#[utoipa::path(
    post,
    path = "/api/v1/auth/logout",
    responses(
        (status = 200, description = "Session revoked", body = MessageResponse),
        (status = 401, description = "Unauthorized", body = ErrorBody)
    ),
    security(("bearer" = [])),
    tag = "auth"
)]
#[instrument(skip(auth, context), fields(session_id = %context.session_id))]
pub async fn logout(
    Extension(auth): Extension<Arc<AuthState>>,
    Extension(context): Extension<AuthContext>,
) -> ApiResult<Json<MessageResponse>> {
    auth.customer().logout(context.session_id).await?;
    Ok(Json(MessageResponse {
        message: "Logged out successfully".to_string(),
    }))
}

#[utoipa::path(
    get,
    path = "/api/v1/auth/me",
    responses(
        (status = 200, description = "Current request context", body = MeResponse),
        (status = 401, description = "Unauthorized", body = ErrorBody)
    ),
    security(("bearer" = [])),
    tag = "auth"
)]
pub async fn me(Extension(context): Extension<AuthContext>) -> Json<MeResponse> {
    Json(context.into())
}
