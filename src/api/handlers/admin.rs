//! Admin realm handlers.
//!
//! Flow Overview:
//! 1) `signup` bootstraps the first `super_admin` and is refused for good once
//!    one exists.
//! 2) `login`, `refresh` and `logout` mirror the customer realm against
//!    `admin_users` and `admin_sessions`.
//! 3) `invite` and `list` require a `super_admin` or `system_admin` bearer;
//!    only a `super_admin` may invite another `super_admin`.

use axum::{Extension, Json, http::HeaderMap, http::StatusCode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use super::auth::{
    AuthState,
    login::verify_password,
    types::{ErrorBody, MessageResponse, RefreshRequest, TokenResponse},
    utils::session_meta,
};
use crate::api::error::{ApiError, ApiResult};
use crate::identity::{
    admin::{
        AdminOutcome, AdminSummary, NewAdmin, ROLE_SUPER_ADMIN, ROLE_SUPPORT_AGENT,
        can_manage_admins, is_admin_role, temporary_password,
    },
    is_email, normalize_email,
};
use crate::realm::{AuthContext, PrincipalRecord};

const INVALID_CREDENTIALS: &str = "Invalid credentials";
const SIGNUP_DISABLED: &str = "Admin signup is disabled. Use invite flow.";
const MIN_ADMIN_PASSWORD_LEN: usize = 10;

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct AdminLoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AdminSignupRequest {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AdminInviteRequest {
    pub email: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    /// Defaults to `support_agent`.
    #[serde(default)]
    pub role: Option<String>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AdminBody {
    pub id: Uuid,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub role: String,
}

impl From<&PrincipalRecord> for AdminBody {
    fn from(principal: &PrincipalRecord) -> Self {
        Self {
            id: principal.id,
            email: principal.email.clone().unwrap_or_default(),
            first_name: principal.first_name.clone(),
            last_name: principal.last_name.clone(),
            role: principal.role.clone(),
        }
    }
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AdminAuthResponse {
    pub admin: AdminBody,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AdminInviteResponse {
    pub admin: AdminBody,
    /// Shown once; the invitee signs in with it.
    pub temp_password: String,
    pub invited_at: DateTime<Utc>,
    pub message: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AdminListItem {
    pub id: Uuid,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub role: String,
    pub status: String,
    pub last_login_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<AdminSummary> for AdminListItem {
    fn from(summary: AdminSummary) -> Self {
        Self {
            id: summary.id,
            email: summary.email,
            first_name: summary.first_name,
            last_name: summary.last_name,
            role: summary.role,
            status: summary.status,
            last_login_at: summary.last_login_at,
            created_at: summary.created_at,
        }
    }
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct AdminListResponse {
    pub admins: Vec<AdminListItem>,
    pub total: usize,
}

fn require_manager(context: &AuthContext) -> ApiResult<()> {
    if can_manage_admins(&context.role) {
        Ok(())
    } else {
        Err(ApiError::Forbidden("Insufficient permissions".to_string()))
    }
}

fn validate_admin_identity(email: &str, first_name: &str, last_name: &str) -> ApiResult<String> {
    let email = normalize_email(email);
    if !is_email(&email) {
        return Err(ApiError::Validation("A valid email is required".to_string()));
    }
    if first_name.trim().is_empty() || last_name.trim().is_empty() {
        return Err(ApiError::Validation(
            "First name and last name are required".to_string(),
        ));
    }
    Ok(email)
}

#[utoipa::path(
    post,
    path = "/api/v1/admin/auth/login",
    request_body = AdminLoginRequest,
    responses(
        (status = 200, description = "Signed in", body = AdminAuthResponse),
        (status = 401, description = "Invalid credentials", body = ErrorBody)
    ),
    tag = "admin"
)]
#[instrument(skip(auth, headers, request))]
pub async fn login(
    Extension(auth): Extension<Arc<AuthState>>,
    headers: HeaderMap,
    Json(request): Json<AdminLoginRequest>,
) -> ApiResult<Json<AdminAuthResponse>> {
    if request.email.trim().is_empty() || request.password.is_empty() {
        return Err(ApiError::Validation(
            "Email and password are required".to_string(),
        ));
    }
    let principal = verify_password(
        auth.admin(),
        auth.verifier(),
        &request.email,
        &request.password,
        INVALID_CREDENTIALS,
    )
    .await?;
    let session = auth
        .admin()
        .start_session(&principal, session_meta(&headers))
        .await?;
    Ok(Json(AdminAuthResponse {
        admin: (&principal).into(),
        access_token: session.tokens.access_token,
        refresh_token: session.tokens.refresh_token,
        expires_in: session.tokens.expires_in,
    }))
}

#[utoipa::path(
    post,
    path = "/api/v1/admin/auth/signup",
    request_body = AdminSignupRequest,
    responses(
        (status = 201, description = "First super admin created", body = AdminAuthResponse),
        (status = 400, description = "Validation error", body = ErrorBody),
        (status = 403, description = "Signup disabled", body = ErrorBody),
        (status = 409, description = "Email already registered", body = ErrorBody)
    ),
    tag = "admin"
)]
#[instrument(skip(auth, headers, request))]
pub async fn signup(
    Extension(auth): Extension<Arc<AuthState>>,
    headers: HeaderMap,
    Json(request): Json<AdminSignupRequest>,
) -> ApiResult<(StatusCode, Json<AdminAuthResponse>)> {
    let store = auth.admin_accounts();
    if store
        .super_admin_exists()
        .await
        .map_err(|err| ApiError::internal("Database error", err))?
    {
        return Err(ApiError::Forbidden(SIGNUP_DISABLED.to_string()));
    }

    let email = validate_admin_identity(&request.email, &request.first_name, &request.last_name)?;
    if request.password.chars().count() < MIN_ADMIN_PASSWORD_LEN {
        return Err(ApiError::Validation(format!(
            "Password must be at least {MIN_ADMIN_PASSWORD_LEN} characters"
        )));
    }

    let password_hash = auth
        .verifier()
        .hash(&request.password)
        .await
        .map_err(|err| ApiError::internal("Failed to hash password", err))?;
    let outcome = store
        .create(NewAdmin {
            email,
            password_hash,
            first_name: request.first_name.trim().to_string(),
            last_name: request.last_name.trim().to_string(),
            role: ROLE_SUPER_ADMIN.to_string(),
            invited_by: None,
        })
        .await
        .map_err(|err| ApiError::internal("Database error", err))?;

    let principal = match outcome {
        AdminOutcome::Created(principal) => principal,
        AdminOutcome::BootstrapTaken => {
            warn!("concurrent admin bootstrap lost the race");
            return Err(ApiError::Forbidden(SIGNUP_DISABLED.to_string()));
        }
        AdminOutcome::EmailTaken => {
            return Err(ApiError::Conflict("Email already registered".to_string()));
        }
    };
    info!(admin_id = %principal.id, "super admin bootstrapped");

    let session = auth
        .admin()
        .start_session(&principal, session_meta(&headers))
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(AdminAuthResponse {
            admin: (&principal).into(),
            access_token: session.tokens.access_token,
            refresh_token: session.tokens.refresh_token,
            expires_in: session.tokens.expires_in,
        }),
    ))
}

#[utoipa::path(
    post,
    path = "/api/v1/admin/auth/refresh",
    request_body = RefreshRequest,
    responses(
        (status = 200, description = "Rotated token pair", body = TokenResponse),
        (status = 401, description = "Unauthorized", body = ErrorBody)
    ),
    tag = "admin"
)]
#[instrument(skip(auth, request))]
pub async fn refresh(
    Extension(auth): Extension<Arc<AuthState>>,
    Json(request): Json<RefreshRequest>,
) -> ApiResult<Json<TokenResponse>> {
    let session = auth.admin().refresh(&request.refresh_token).await?;
    Ok(Json(session.tokens.into()))
}

#[utoipa::path(
    post,
    path = "/api/v1/admin/auth/logout",
    responses(
        (status = 200, description = "Session revoked", body = MessageResponse),
        (status = 401, description = "Unauthorized", body = ErrorBody)
    ),
    security(("bearer" = [])),
    tag = "admin"
)]
#[instrument(skip(auth, context), fields(session_id = %context.session_id))]
pub async fn logout(
    Extension(auth): Extension<Arc<AuthState>>,
    Extension(context): Extension<AuthContext>,
) -> ApiResult<Json<MessageResponse>> {
    auth.admin().logout(context.session_id).await?;
    Ok(Json(MessageResponse {
        message: "Logged out successfully".to_string(),
    }))
}

#[utoipa::path(
    post,
    path = "/api/v1/admin/auth/invite",
    request_body = AdminInviteRequest,
    responses(
        (status = 201, description = "Admin invited", body = AdminInviteResponse),
        (status = 400, description = "Validation error", body = ErrorBody),
        (status = 401, description = "Unauthorized", body = ErrorBody),
        (status = 403, description = "Insufficient permissions", body = ErrorBody),
        (status = 409, description = "Email already registered", body = ErrorBody)
    ),
    security(("bearer" = [])),
    tag = "admin"
)]
#[instrument(skip(auth, context, request), fields(inviter = %context.principal_id))]
pub async fn invite(
    Extension(auth): Extension<Arc<AuthState>>,
    Extension(context): Extension<AuthContext>,
    Json(request): Json<AdminInviteRequest>,
) -> ApiResult<(StatusCode, Json<AdminInviteResponse>)> {
    require_manager(&context)?;

    let role = request
        .role
        .as_deref()
        .map(str::trim)
        .filter(|role| !role.is_empty())
        .unwrap_or(ROLE_SUPPORT_AGENT)
        .to_string();
    if !is_admin_role(&role) {
        return Err(ApiError::Validation("Invalid admin role".to_string()));
    }
    if role == ROLE_SUPER_ADMIN && context.role != ROLE_SUPER_ADMIN {
        return Err(ApiError::Forbidden(
            "Only a super admin can invite a super admin".to_string(),
        ));
    }
    let email = validate_admin_identity(&request.email, &request.first_name, &request.last_name)?;

    let temp_password = temporary_password();
    let password_hash = auth
        .verifier()
        .hash(&temp_password)
        .await
        .map_err(|err| ApiError::internal("Failed to hash password", err))?;

    let outcome = auth
        .admin_accounts()
        .create(NewAdmin {
            email,
            password_hash,
            first_name: request.first_name.trim().to_string(),
            last_name: request.last_name.trim().to_string(),
            role,
            invited_by: Some(context.principal_id),
        })
        .await
        .map_err(|err| ApiError::internal("Database error", err))?;

    let principal = match outcome {
        AdminOutcome::Created(principal) => principal,
        AdminOutcome::EmailTaken => {
            return Err(ApiError::Conflict("Email already registered".to_string()));
        }
        AdminOutcome::BootstrapTaken => {
            return Err(ApiError::internal(
                "Database error",
                anyhow::anyhow!("invited admin hit the bootstrap index"),
            ));
        }
    };
    info!(admin_id = %principal.id, role = %principal.role, "admin invited");

    Ok((
        StatusCode::CREATED,
        Json(AdminInviteResponse {
            admin: (&principal).into(),
            temp_password,
            invited_at: Utc::now(),
            message: "Admin invited. Share the temporary password securely.".to_string(),
        }),
    ))
}

#[utoipa::path(
    get,
    path = "/api/v1/admin/users",
    responses(
        (status = 200, description = "Admins, newest first", body = AdminListResponse),
        (status = 401, description = "Unauthorized", body = ErrorBody),
        (status = 403, description = "Insufficient permissions", body = ErrorBody)
    ),
    security(("bearer" = [])),
    tag = "admin"
)]
#[instrument(skip(auth, context))]
pub async fn list(
    Extension(auth): Extension<Arc<AuthState>>,
    Extension(context): Extension<AuthContext>,
) -> ApiResult<Json<AdminListResponse>> {
    require_manager(&context)?;
    let admins: Vec<AdminListItem> = auth
        .admin_accounts()
        .list()
        .await
        .map_err(|err| ApiError::internal("Database error", err))?
        .into_iter()
        .map(Into::into)
        .collect();
    Ok(Json(AdminListResponse {
        total: admins.len(),
        admins,
    }))
}
