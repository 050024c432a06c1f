//! One-time code sign-in.
//!
//! Flow Overview:
//! 1) `send` classifies the identifier, enforces the send window and delivers
//!    a fresh code to the email or phone.
//! 2) `verify` consumes the code. A known active principal is signed in (and
//!    its phone stamped verified); an unknown identifier is handed back so the
//!    client can finish registration.

use axum::{Extension, Json, http::HeaderMap};
use std::sync::Arc;
use tracing::{info, instrument};

use super::{
    AuthState,
    types::{ErrorBody, OtpSendRequest, OtpSendResponse, OtpVerifyRequest, OtpVerifyResponse},
    utils::session_meta,
};
use crate::api::error::{ApiError, ApiResult};
use crate::identity::{Identifier, classify};
use crate::otp::mask_destination;

fn parse_identifier(raw: &str) -> ApiResult<Identifier> {
    if raw.trim().is_empty() {
        return Err(ApiError::Validation("Email or phone is required".to_string()));
    }
    classify(raw).ok_or_else(|| ApiError::Validation("Invalid email or phone".to_string()))
}

#[utoipa::path(
    post,
    path = "/api/v1/auth/otp/send",
    request_body = OtpSendRequest,
    responses(
        (status = 200, description = "Code delivered", body = OtpSendResponse),
        (status = 400, description = "Validation error", body = ErrorBody),
        (status = 429, description = "Too many codes requested", body = ErrorBody)
    ),
    tag = "otp"
)]
#[instrument(skip(auth, request))]
pub async fn send(
    Extension(auth): Extension<Arc<AuthState>>,
    Json(request): Json<OtpSendRequest>,
) -> ApiResult<Json<OtpSendResponse>> {
    let identifier = parse_identifier(&request.identifier)?;
    let sent = auth.otp().send(identifier.as_str()).await?;
    Ok(Json(OtpSendResponse {
        sent: true,
        destination: sent.destination,
        expires_in: sent.expires_in,
    }))
}

#[utoipa::path(
    post,
    path = "/api/v1/auth/otp/verify",
    request_body = OtpVerifyRequest,
    responses(
        (status = 200, description = "Code accepted", body = OtpVerifyResponse),
        (status = 400, description = "Validation error", body = ErrorBody),
        (status = 401, description = "Invalid or missing code", body = ErrorBody),
        (status = 429, description = "Attempts exhausted", body = ErrorBody)
    ),
    tag = "otp"
)]
#[instrument(skip(auth, headers, request))]
pub async fn verify(
    Extension(auth): Extension<Arc<AuthState>>,
    headers: HeaderMap,
    Json(request): Json<OtpVerifyRequest>,
) -> ApiResult<Json<OtpVerifyResponse>> {
    let identifier = parse_identifier(&request.identifier)?;
    if request.code.trim().is_empty() {
        return Err(ApiError::Validation("Code is required".to_string()));
    }

    auth.otp().verify(identifier.as_str(), &request.code).await?;

    let customers = auth.customer();
    let Some(principal) = customers
        .directory()
        .find_active_by_identifier(identifier.as_str())
        .await
        .map_err(|err| ApiError::internal("Database error", err))?
    else {
        info!(destination = %mask_destination(identifier.as_str()), "otp verified for unknown identifier");
        return Ok(Json(OtpVerifyResponse {
            verified: true,
            user_exists: false,
            identifier: Some(identifier.as_str().to_string()),
            needs_registration: Some(true),
            ..OtpVerifyResponse::default()
        }));
    };

    if identifier.is_phone() {
        customers
            .directory()
            .mark_phone_verified(principal.id)
            .await
            .map_err(|err| ApiError::internal("Database error", err))?;
    }
    customers
        .directory()
        .record_login(principal.id)
        .await
        .map_err(|err| ApiError::internal("Database error", err))?;

    let session = customers
        .start_session(&principal, session_meta(&headers))
        .await?;
    Ok(Json(OtpVerifyResponse {
        verified: true,
        user_exists: true,
        user: Some((&principal).into()),
        access_token: Some(session.tokens.access_token),
        refresh_token: Some(session.tokens.refresh_token),
        expires_in: Some(session.tokens.expires_in),
        ..OtpVerifyResponse::default()
    }))
}
