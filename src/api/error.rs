//! HTTP error taxonomy.
//!
//! Every handler failure ends up here. Internal causes are logged and replaced
//! by a fixed message so driver or library text never reaches a client.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::{Map, Value, json};
use thiserror::Error;
use tracing::error;

use crate::identity::IdentityError;
use crate::oauth::OAuthError;
use crate::otp::OtpError;
use crate::realm::AuthError;
use crate::webauthn::CeremonyError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    RateLimited(String),
    #[error("{0}")]
    NotConfigured(String),
    /// Unauthorized with extra JSON fields, e.g. `remainingAttempts`.
    #[error("{message}")]
    Rejected {
        message: String,
        extra: Map<String, Value>,
    },
    #[error("{message}")]
    Internal {
        message: String,
        #[source]
        source: anyhow::Error,
    },
}

impl ApiError {
    pub fn internal(message: &str, source: impl Into<anyhow::Error>) -> Self {
        Self::Internal {
            message: message.to_string(),
            source: source.into(),
        }
    }

    #[must_use]
    pub fn unauthorized() -> Self {
        Self::Unauthorized("Unauthorized".to_string())
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) | Self::Rejected { .. } => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::NotConfigured(_) => StatusCode::NOT_IMPLEMENTED,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match self {
            Self::Internal { message, source } => {
                error!("{message}: {source:#}");
                json!({ "error": message })
            }
            Self::Rejected { message, mut extra } => {
                extra.insert("error".to_string(), Value::String(message));
                Value::Object(extra)
            }
            other => json!({ "error": other.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Signing(source) => Self::internal("Failed to issue tokens", source),
            AuthError::Storage(source) => Self::internal("Database error", source),
            AuthError::MissingToken
            | AuthError::InvalidToken
            | AuthError::SessionRevoked
            | AuthError::PrincipalInactive => Self::unauthorized(),
        }
    }
}

impl From<OtpError> for ApiError {
    fn from(err: OtpError) -> Self {
        match err {
            OtpError::RateLimited => {
                Self::RateLimited("Too many OTP requests. Please wait before trying again.".to_string())
            }
            OtpError::NoChallenge => {
                Self::Unauthorized("No valid OTP found. Please request a new code.".to_string())
            }
            OtpError::TooManyAttempts => Self::RateLimited(
                "Too many attempts. Please request a new code.".to_string(),
            ),
            OtpError::InvalidCode { remaining_attempts } => {
                let mut extra = Map::new();
                extra.insert("remainingAttempts".to_string(), json!(remaining_attempts));
                Self::Rejected {
                    message: "Invalid OTP code".to_string(),
                    extra,
                }
            }
            OtpError::Delivery(source) => Self::internal("Failed to send OTP", source),
            OtpError::Hash(source) => Self::internal("Failed to generate OTP", source),
            OtpError::Storage(source) => Self::internal("Database error", source),
        }
    }
}

impl From<IdentityError> for ApiError {
    fn from(err: IdentityError) -> Self {
        match err {
            IdentityError::MissingIdentifier
            | IdentityError::InvalidIdentifier
            | IdentityError::WeakPassword => Self::Validation(err.to_string()),
            IdentityError::TenantNotFound => Self::NotFound(err.to_string()),
            IdentityError::TenantInactive => Self::Forbidden(err.to_string()),
            IdentityError::AlreadyExists => Self::Conflict(err.to_string()),
            IdentityError::Hash(source) => Self::internal("Failed to hash password", source),
            IdentityError::Storage(source) => Self::internal("Database error", source),
        }
    }
}

impl From<CeremonyError> for ApiError {
    fn from(err: CeremonyError) -> Self {
        match err {
            CeremonyError::NoSessionFound => {
                Self::Validation("Passkey session expired. Please try again.".to_string())
            }
            CeremonyError::AuthenticationFailed => {
                Self::Unauthorized("Passkey authentication failed".to_string())
            }
            CeremonyError::RegistrationFailed => {
                Self::Validation("Passkey registration failed".to_string())
            }
            CeremonyError::Setup(source) => Self::internal("Failed to start passkey ceremony", source),
            CeremonyError::Storage(source) => Self::internal("Database error", source),
        }
    }
}

impl From<OAuthError> for ApiError {
    fn from(err: OAuthError) -> Self {
        match err {
            OAuthError::NotConfigured => Self::NotConfigured(err.to_string()),
            OAuthError::InvalidState => Self::Validation("Invalid OAuth state".to_string()),
            OAuthError::Exchange(source) => {
                Self::internal("Failed to exchange authorization code", source)
            }
            OAuthError::Profile(source) => {
                Self::internal("Failed to get user info from Google", source)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{Context, Result, anyhow};

    async fn body_of(err: ApiError) -> Result<(StatusCode, Value)> {
        let response = err.into_response();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await?;
        Ok((status, serde_json::from_slice(&bytes)?))
    }

    #[tokio::test]
    async fn internal_errors_hide_their_cause() -> Result<()> {
        let (status, body) = body_of(ApiError::internal(
            "Database error",
            anyhow!("relation \"users\" does not exist"),
        ))
        .await?;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, json!({ "error": "Database error" }));
        Ok(())
    }

    #[tokio::test]
    async fn invalid_code_reports_remaining_attempts() -> Result<()> {
        let (status, body) = body_of(OtpError::InvalidCode { remaining_attempts: 2 }.into()).await?;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(
            body.get("remainingAttempts").and_then(Value::as_i64),
            Some(2)
        );
        assert_eq!(
            body.get("error").and_then(Value::as_str).context("missing error")?,
            "Invalid OTP code"
        );
        Ok(())
    }

    #[test]
    fn refused_credentials_share_one_shape() {
        for err in [
            AuthError::MissingToken,
            AuthError::InvalidToken,
            AuthError::SessionRevoked,
            AuthError::PrincipalInactive,
        ] {
            let api: ApiError = err.into();
            assert_eq!(api.status(), StatusCode::UNAUTHORIZED);
            assert_eq!(api.to_string(), "Unauthorized");
        }
    }

    #[test]
    fn identity_errors_map_to_taxonomy() {
        let cases = [
            (IdentityError::MissingIdentifier, StatusCode::BAD_REQUEST),
            (IdentityError::WeakPassword, StatusCode::BAD_REQUEST),
            (IdentityError::TenantNotFound, StatusCode::NOT_FOUND),
            (IdentityError::TenantInactive, StatusCode::FORBIDDEN),
            (IdentityError::AlreadyExists, StatusCode::CONFLICT),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
        assert_eq!(
            ApiError::from(OAuthError::NotConfigured).status(),
            StatusCode::NOT_IMPLEMENTED
        );
    }
}
