//! Passkey registration (signed-in customers) and discoverable login.

use axum::{Extension, Json, extract::Query, http::HeaderMap};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use webauthn_rs::prelude::{
    CreationChallengeResponse, PublicKeyCredential, RegisterPublicKeyCredential,
};

use super::{
    AuthState, Passkeys,
    types::{
        AuthResponse, ErrorBody, PasskeyLoginBeginResponse, PasskeyLoginFinishQuery,
        PasskeyRegisterResponse,
    },
    utils::session_meta,
};
use crate::api::error::{ApiError, ApiResult};
use crate::realm::AuthContext;
use crate::webauthn::{CeremonyError, NewPasskey, StoredPasskey};

fn passkeys(auth: &AuthState) -> ApiResult<&Passkeys> {
    auth.passkeys().ok_or_else(|| {
        ApiError::NotConfigured("Passkey authentication is not available".to_string())
    })
}

fn storage(err: anyhow::Error) -> ApiError {
    CeremonyError::Storage(err).into()
}

#[utoipa::path(
    post,
    path = "/api/v1/auth/passkey/login/begin",
    responses(
        (status = 200, description = "Discoverable login challenge", body = PasskeyLoginBeginResponse),
        (status = 501, description = "Passkeys are not available", body = ErrorBody)
    ),
    tag = "passkeys"
)]
#[instrument(skip(auth))]
pub async fn login_begin(
    Extension(auth): Extension<Arc<AuthState>>,
) -> ApiResult<Json<PasskeyLoginBeginResponse>> {
    let passkeys = passkeys(&auth)?;
    let login = passkeys.service.login_begin().await?;
    let public_key = serde_json::to_value(&login.challenge.public_key)
        .map_err(|err| ApiError::internal("Failed to encode passkey challenge", err))?;
    Ok(Json(PasskeyLoginBeginResponse {
        public_key,
        session_key: login.session_key,
    }))
}

/// The body is the browser's `PublicKeyCredential` assertion.
#[utoipa::path(
    post,
    path = "/api/v1/auth/passkey/login/finish",
    params(PasskeyLoginFinishQuery),
    request_body = Object,
    responses(
        (status = 200, description = "Signed in", body = AuthResponse),
        (status = 400, description = "Ceremony expired or unknown", body = ErrorBody),
        (status = 401, description = "Passkey authentication failed", body = ErrorBody),
        (status = 501, description = "Passkeys are not available", body = ErrorBody)
    ),
    tag = "passkeys"
)]
#[instrument(skip(auth, headers, query, credential))]
pub async fn login_finish(
    Extension(auth): Extension<Arc<AuthState>>,
    headers: HeaderMap,
    Query(query): Query<PasskeyLoginFinishQuery>,
    Json(credential): Json<PublicKeyCredential>,
) -> ApiResult<Json<AuthResponse>> {
    let passkeys = passkeys(&auth)?;
    let pending = passkeys.service.take_login(query.session_key).await?;
    let user_id = passkeys.service.identify(&credential)?;

    let customers = auth.customer();
    let principal = customers
        .directory()
        .find_active(user_id)
        .await
        .map_err(storage)?
        .ok_or(CeremonyError::AuthenticationFailed)?;

    let records = passkeys.store.list_for_user(user_id).await.map_err(storage)?;
    let stored = StoredPasskey::decode_all(user_id, records);
    let verified = passkeys
        .service
        .login_finish(pending, &credential, &stored)?;

    let state = serde_json::to_value(&verified.passkey.passkey)
        .map_err(|err| ApiError::internal("Failed to encode passkey", err))?;
    let recorded = passkeys
        .store
        .record_use(
            &verified.passkey.credential_id,
            verified.previous_count,
            verified.passkey.sign_count,
            state,
        )
        .await
        .map_err(storage)?;
    if !recorded {
        warn!(%user_id, "passkey counter moved during login");
        return Err(CeremonyError::AuthenticationFailed.into());
    }

    customers
        .directory()
        .record_login(principal.id)
        .await
        .map_err(storage)?;
    let session = customers
        .start_session(&principal, session_meta(&headers))
        .await?;
    Ok(Json(AuthResponse::new(&principal, session.tokens)))
}

#[utoipa::path(
    post,
    path = "/api/v1/auth/passkey/register/begin",
    responses(
        (status = 200, description = "`PublicKeyCredentialCreationOptions` for `navigator.credentials.create`"),
        (status = 401, description = "Unauthorized", body = ErrorBody),
        (status = 501, description = "Passkeys are not available", body = ErrorBody)
    ),
    security(("bearer" = [])),
    tag = "passkeys"
)]
#[instrument(skip(auth, context), fields(user_id = %context.principal_id))]
pub async fn register_begin(
    Extension(auth): Extension<Arc<AuthState>>,
    Extension(context): Extension<AuthContext>,
) -> ApiResult<Json<CreationChallengeResponse>> {
    let passkeys = passkeys(&auth)?;
    let principal = auth
        .customer()
        .directory()
        .find_active(context.principal_id)
        .await
        .map_err(storage)?
        .ok_or_else(ApiError::unauthorized)?;

    let user_name = principal
        .email
        .clone()
        .or_else(|| principal.phone.clone())
        .unwrap_or_else(|| principal.id.to_string());
    let display_name = format!("{} {}", principal.first_name, principal.last_name);
    let display_name = match display_name.trim() {
        "" => user_name.clone(),
        name => name.to_string(),
    };

    let records = passkeys
        .store
        .list_for_user(principal.id)
        .await
        .map_err(storage)?;
    let existing = StoredPasskey::decode_all(principal.id, records);
    let challenge = passkeys
        .service
        .register_begin(principal.id, &user_name, &display_name, &existing)
        .await?;
    Ok(Json(challenge))
}

/// The body is the browser's `PublicKeyCredential` attestation.
#[utoipa::path(
    post,
    path = "/api/v1/auth/passkey/register/finish",
    request_body = Object,
    responses(
        (status = 200, description = "Passkey stored", body = PasskeyRegisterResponse),
        (status = 400, description = "Registration failed or ceremony expired", body = ErrorBody),
        (status = 401, description = "Unauthorized", body = ErrorBody),
        (status = 501, description = "Passkeys are not available", body = ErrorBody)
    ),
    security(("bearer" = [])),
    tag = "passkeys"
)]
#[instrument(skip(auth, context, credential), fields(user_id = %context.principal_id))]
pub async fn register_finish(
    Extension(auth): Extension<Arc<AuthState>>,
    Extension(context): Extension<AuthContext>,
    Json(credential): Json<RegisterPublicKeyCredential>,
) -> ApiResult<Json<PasskeyRegisterResponse>> {
    let passkeys = passkeys(&auth)?;
    let passkey = passkeys
        .service
        .register_finish(context.principal_id, &credential)
        .await?;

    let row = NewPasskey::from_registration(context.principal_id, &passkey, &credential)
        .map_err(|err| ApiError::internal("Failed to encode passkey", err))?;
    let attestation_type = row.details.attestation_type.clone();
    passkeys.store.insert(row).await.map_err(storage)?;

    info!(user_id = %context.principal_id, %attestation_type, "passkey registered");
    Ok(Json(PasskeyRegisterResponse {
        status: "ok".to_string(),
        message: "Passkey registered successfully".to_string(),
    }))
}
