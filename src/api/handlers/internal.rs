//! Service-to-service endpoints: token introspection and user lookup.
//!
//! Guarded by `X-Internal-Api-Key` when `INTERNAL_API_KEY` is configured;
//! otherwise the network boundary is the only protection.

use axum::{
    Extension, Json,
    extract::{Path, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use super::auth::{AuthState, types::ErrorBody};
use crate::api::error::{ApiError, ApiResult};

pub const INTERNAL_KEY_HEADER: &str = "x-internal-api-key";

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct ValidateTokenRequest {
    pub token: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct ValidateTokenResponse {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct InternalUserResponse {
    pub id: Uuid,
    pub tenant_id: Option<Uuid>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub first_name: String,
    pub last_name: String,
    pub role: String,
    pub status: String,
    pub email_verified: bool,
    pub phone_verified: bool,
    pub has_password: bool,
}

/// # Errors
/// 401 when a key is configured and the request does not present it.
pub async fn require_service_key(
    State(state): State<Arc<AuthState>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let presented = request
        .headers()
        .get(INTERNAL_KEY_HEADER)
        .and_then(|value| value.to_str().ok());
    if !state.config().internal_key_matches(presented) {
        warn!("internal request with missing or wrong service key");
        return Err(ApiError::unauthorized());
    }
    Ok(next.run(request).await)
}

#[utoipa::path(
    post,
    path = "/internal/validate-token",
    request_body = ValidateTokenRequest,
    responses(
        (status = 200, description = "Token is valid and its session live", body = ValidateTokenResponse),
        (status = 401, description = "Token refused", body = ValidateTokenResponse)
    ),
    tag = "internal"
)]
#[instrument(skip(auth, request))]
pub async fn validate_token(
    Extension(auth): Extension<Arc<AuthState>>,
    Json(request): Json<ValidateTokenRequest>,
) -> ApiResult<Response> {
    match auth.customer().authenticate(&request.token).await {
        Ok(context) => Ok(Json(ValidateTokenResponse {
            valid: true,
            user_id: Some(context.principal_id),
            tenant_id: context.tenant_id,
            email: context.email,
            role: Some(context.role),
        })
        .into_response()),
        Err(err) if err.is_internal() => Err(err.into()),
        Err(_) => Ok((
            StatusCode::UNAUTHORIZED,
            Json(ValidateTokenResponse::default()),
        )
            .into_response()),
    }
}

#[utoipa::path(
    get,
    path = "/internal/users/{id}",
    params(("id" = Uuid, Path, description = "User id")),
    responses(
        (status = 200, description = "User profile", body = InternalUserResponse),
        (status = 404, description = "User not found", body = ErrorBody)
    ),
    tag = "internal"
)]
#[instrument(skip(auth))]
pub async fn user_by_id(
    Extension(auth): Extension<Arc<AuthState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<InternalUserResponse>> {
    let profile = auth
        .provisioner()
        .store()
        .profile(id)
        .await
        .map_err(|err| ApiError::internal("Database error", err))?
        .ok_or_else(|| ApiError::NotFound("User not found".to_string()))?;
    let principal = profile.principal;
    Ok(Json(InternalUserResponse {
        id: principal.id,
        tenant_id: principal.tenant_id,
        email: principal.email,
        phone: principal.phone,
        first_name: principal.first_name,
        last_name: principal.last_name,
        role: principal.role,
        status: profile.status,
        email_verified: profile.email_verified,
        phone_verified: profile.phone_verified,
        has_password: profile.has_password,
    }))
}
