use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{PrincipalDirectory, PrincipalRecord, Realm};
use crate::session::{NewSession, SessionStore, hash_refresh_token};
use crate::token::{TokenCodec, TokenError, TokenPair};

/// Why a bearer or refresh credential was refused. Callers outside the realm
/// only ever see the HTTP mapping, which is the same for every variant except
/// the infrastructure ones.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,
    #[error("invalid token")]
    InvalidToken,
    #[error("session revoked or unknown")]
    SessionRevoked,
    #[error("principal is not active")]
    PrincipalInactive,
    #[error("token signing failed")]
    Signing(#[source] TokenError),
    #[error("storage failure")]
    Storage(#[source] anyhow::Error),
}

impl AuthError {
    #[must_use]
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::Signing(_) | Self::Storage(_))
    }
}

impl From<TokenError> for AuthError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Invalid => Self::InvalidToken,
            other => Self::Signing(other),
        }
    }
}

/// Request-scoped identity injected by the bearer middleware.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthContext {
    pub realm: Realm,
    pub principal_id: Uuid,
    pub tenant_id: Option<Uuid>,
    pub email: Option<String>,
    pub role: String,
    pub session_id: Uuid,
}

#[derive(Clone, Debug, Default)]
pub struct SessionMeta {
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
}

#[derive(Clone, Debug)]
pub struct IssuedSession {
    pub session_id: Uuid,
    pub tokens: TokenPair,
}

/// One realm instantiation: its codec, its session table, its principal table.
pub struct RealmAuth {
    codec: TokenCodec,
    sessions: Arc<dyn SessionStore>,
    directory: Arc<dyn PrincipalDirectory>,
}

impl RealmAuth {
    #[must_use]
    pub fn new(
        codec: TokenCodec,
        sessions: Arc<dyn SessionStore>,
        directory: Arc<dyn PrincipalDirectory>,
    ) -> Self {
        Self {
            codec,
            sessions,
            directory,
        }
    }

    #[must_use]
    pub fn realm(&self) -> Realm {
        self.codec.realm()
    }

    #[must_use]
    pub fn codec(&self) -> &TokenCodec {
        &self.codec
    }

    #[must_use]
    pub fn directory(&self) -> &dyn PrincipalDirectory {
        self.directory.as_ref()
    }

    /// Open a new session for `principal` and mint its first token pair.
    ///
    /// # Errors
    /// Returns [`AuthError::Signing`] or [`AuthError::Storage`].
    pub async fn start_session(
        &self,
        principal: &PrincipalRecord,
        meta: SessionMeta,
    ) -> Result<IssuedSession, AuthError> {
        let session_id = Uuid::new_v4();
        let tokens = self.codec.issue(&principal.subject(), session_id)?;

        self.sessions
            .create(NewSession {
                id: session_id,
                principal_id: principal.id,
                tenant_id: principal.tenant_id,
                refresh_token_hash: hash_refresh_token(&tokens.refresh_token),
                user_agent: meta.user_agent,
                ip_address: meta.ip_address,
            })
            .await
            .map_err(AuthError::Storage)?;

        debug!(realm = %self.realm(), %session_id, "session started");

        Ok(IssuedSession { session_id, tokens })
    }

    /// Verify an access token and confirm its session and principal are still live.
    ///
    /// # Errors
    /// Returns [`AuthError::InvalidToken`], [`AuthError::SessionRevoked`] or
    /// [`AuthError::PrincipalInactive`] for refused credentials,
    /// [`AuthError::Storage`] if the check itself failed.
    pub async fn authenticate(&self, access_token: &str) -> Result<AuthContext, AuthError> {
        let claims = self.codec.verify_access(access_token)?;

        if self
            .sessions
            .is_revoked(claims.sid)
            .await
            .map_err(AuthError::Storage)?
        {
            return Err(AuthError::SessionRevoked);
        }

        // A suspended principal or tenant loses access before its token expires.
        if self
            .directory
            .find_active(claims.sub)
            .await
            .map_err(AuthError::Storage)?
            .is_none()
        {
            return Err(AuthError::PrincipalInactive);
        }

        Ok(AuthContext {
            realm: self.realm(),
            principal_id: claims.sub,
            tenant_id: claims.tenant_id,
            email: claims.email,
            role: claims.role,
            session_id: claims.sid,
        })
    }

    /// Exchange a refresh token for a new pair on the same session.
    ///
    /// The principal is re-read so role and email changes apply, and the
    /// stored refresh hash is rotated so the presented token cannot be replayed.
    ///
    /// # Errors
    /// Returns an [`AuthError`] when the token, session or principal is no longer valid.
    pub async fn refresh(&self, refresh_token: &str) -> Result<IssuedSession, AuthError> {
        let claims = self.codec.verify_refresh(refresh_token)?;
        let session_id = claims.sub;

        if self
            .sessions
            .is_revoked(session_id)
            .await
            .map_err(AuthError::Storage)?
        {
            return Err(AuthError::SessionRevoked);
        }

        let principal = self
            .directory
            .find_active(claims.uid)
            .await
            .map_err(AuthError::Storage)?
            .ok_or(AuthError::PrincipalInactive)?;

        if principal.tenant_id != claims.tenant_id {
            warn!(realm = %self.realm(), %session_id, "refresh token tenant mismatch");
            return Err(AuthError::InvalidToken);
        }

        let tokens = self.codec.issue(&principal.subject(), session_id)?;
        let rotated = self
            .sessions
            .rotate(
                session_id,
                &hash_refresh_token(refresh_token),
                &hash_refresh_token(&tokens.refresh_token),
            )
            .await
            .map_err(AuthError::Storage)?;
        if !rotated {
            warn!(realm = %self.realm(), %session_id, "stale refresh token presented");
            return Err(AuthError::SessionRevoked);
        }

        Ok(IssuedSession { session_id, tokens })
    }

    /// Revoke a session. Revoking twice is not an error.
    ///
    /// # Errors
    /// Returns [`AuthError::Storage`] if the update fails.
    pub async fn logout(&self, session_id: Uuid) -> Result<(), AuthError> {
        self.sessions
            .revoke(session_id)
            .await
            .map_err(AuthError::Storage)
    }
}
