use axum::{Extension, Json, http::HeaderMap, http::StatusCode};
use std::sync::Arc;
use tracing::instrument;

use super::{
    AuthState,
    types::{AuthResponse, ErrorBody, RegisterRequest},
    utils::session_meta,
};
use crate::api::error::ApiResult;

#[utoipa::path(
    post,
    path = "/api/v1/auth/register",
    request_body = RegisterRequest,
    responses(
        (status = 201, description = "Account created and signed in", body = AuthResponse),
        (status = 400, description = "Validation error", body = ErrorBody),
        (status = 403, description = "Tenant is not active", body = ErrorBody),
        (status = 404, description = "Tenant not found", body = ErrorBody),
        (status = 409, description = "Account already exists", body = ErrorBody)
    ),
    tag = "auth"
)]
#[instrument(skip(auth, headers, request))]
pub async fn register(
    Extension(auth): Extension<Arc<AuthState>>,
    headers: HeaderMap,
    Json(request): Json<RegisterRequest>,
) -> ApiResult<(StatusCode, Json<AuthResponse>)> {
    let principal = auth.provisioner().register(request.into()).await?;
    let session = auth
        .customer()
        .start_session(&principal, session_meta(&headers))
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(AuthResponse::new(&principal, session.tokens)),
    ))
}
