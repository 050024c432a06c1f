//! Request/response types for customer auth endpoints.

use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::identity::Registration;
use crate::realm::{AuthContext, PrincipalRecord};
use crate::token::TokenPair;

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct CheckUserRequest {
    pub identifier: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct CheckUserResponse {
    pub exists: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    #[serde(default)]
    pub identifier: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub business_name: Option<String>,
    #[serde(default)]
    pub tenant_id: Option<Uuid>,
    #[serde(default)]
    pub google_id: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub country_id: Option<String>,
    #[serde(default)]
    pub region_id: Option<String>,
    #[serde(default)]
    pub city_id: Option<String>,
}

impl From<RegisterRequest> for Registration {
    fn from(request: RegisterRequest) -> Self {
        Self {
            identifier: request.identifier,
            email: request.email,
            phone: request.phone,
            password: request.password,
            first_name: request.first_name,
            last_name: request.last_name,
            business_name: request.business_name,
            tenant_id: request.tenant_id,
            google_id: request.google_id,
            country: request.country,
            country_id: request.country_id,
            region_id: request.region_id,
            city_id: request.city_id,
        }
    }
}

/// Password login. `identifier` is accepted as an alias of `email` and may
/// hold a phone number.
#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct LoginRequest {
    #[serde(alias = "identifier")]
    pub email: String,
    pub password: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserBody {
    pub id: Uuid,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub first_name: String,
    pub last_name: String,
    pub role: String,
    pub tenant_id: Option<Uuid>,
}

impl From<&PrincipalRecord> for UserBody {
    fn from(principal: &PrincipalRecord) -> Self {
        Self {
            id: principal.id,
            email: principal.email.clone(),
            phone: principal.phone.clone(),
            first_name: principal.first_name.clone(),
            last_name: principal.last_name.clone(),
            role: principal.role.clone(),
            tenant_id: principal.tenant_id,
        }
    }
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    pub user: UserBody,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
}

impl AuthResponse {
    #[must_use]
    pub fn new(principal: &PrincipalRecord, tokens: TokenPair) -> Self {
        Self {
            user: principal.into(),
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            expires_in: tokens.expires_in,
        }
    }
}

/// Token pair without a user body, returned by refresh.
#[derive(ToSchema, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
}

impl From<TokenPair> for TokenResponse {
    fn from(tokens: TokenPair) -> Self {
        Self {
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            expires_in: tokens.expires_in,
        }
    }
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct MeResponse {
    pub user_id: Uuid,
    pub tenant_id: Option<Uuid>,
    pub email: Option<String>,
    pub role: String,
    pub session_id: Uuid,
}

impl From<AuthContext> for MeResponse {
    fn from(context: AuthContext) -> Self {
        Self {
            user_id: context.principal_id,
            tenant_id: context.tenant_id,
            email: context.email,
            role: context.role,
            session_id: context.session_id,
        }
    }
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct OtpSendRequest {
    pub identifier: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct OtpSendResponse {
    pub sent: bool,
    pub destination: String,
    pub expires_in: i64,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct OtpVerifyRequest {
    pub identifier: String,
    pub code: String,
}

/// Either a signed-in session or a prompt to finish registration.
#[derive(ToSchema, Serialize, Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct OtpVerifyResponse {
    pub verified: bool,
    pub user_exists: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<UserBody>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub needs_registration: Option<bool>,
}

#[derive(Deserialize, Debug, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct OAuthStartQuery {
    /// Frontend URL to land on after sign-in; must be an allowed origin.
    pub redirect_uri: Option<String>,
    pub lang: Option<String>,
}

#[derive(Deserialize, Debug, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct OAuthCallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

#[derive(ToSchema, Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct PasskeyLoginBeginResponse {
    /// `PublicKeyCredentialRequestOptions` for `navigator.credentials.get`.
    #[schema(value_type = Object)]
    pub public_key: serde_json::Value,
    pub session_key: Uuid,
}

#[derive(Deserialize, Debug, IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct PasskeyLoginFinishQuery {
    pub session_key: Uuid,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct PasskeyRegisterResponse {
    pub status: String,
    pub message: String,
}
