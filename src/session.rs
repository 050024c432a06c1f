//! Session store.
//!
//! A session is one refresh-token lineage. Only a SHA-256 hash of the current
//! refresh token is stored. A session can only move to revoked; it is never
//! reactivated.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::Instrument;
use uuid::Uuid;

use crate::realm::Realm;

pub const SESSION_TTL_SECONDS: i64 = 7 * 24 * 60 * 60;

#[derive(Clone, Debug)]
pub struct NewSession {
    pub id: Uuid,
    pub principal_id: Uuid,
    pub tenant_id: Option<Uuid>,
    pub refresh_token_hash: Vec<u8>,
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Persist an active session that expires after [`SESSION_TTL_SECONDS`].
    async fn create(&self, session: NewSession) -> Result<Uuid>;

    /// `true` unless the session exists, is unexpired and has not been revoked.
    async fn is_revoked(&self, session_id: Uuid) -> Result<bool>;

    /// Set the revocation timestamp once. Repeated calls are no-ops.
    async fn revoke(&self, session_id: Uuid) -> Result<()>;

    /// Swap the stored refresh hash if `presented` is the current one and the
    /// session is still active. Returns `false` when nothing was swapped.
    async fn rotate(&self, session_id: Uuid, presented: &[u8], next: &[u8]) -> Result<bool>;
}

/// Hash a refresh token so raw values never touch the database.
#[must_use]
pub fn hash_refresh_token(token: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.finalize().to_vec()
}

#[derive(Clone, Debug)]
pub struct PgSessionStore {
    pool: PgPool,
    realm: Realm,
}

impl PgSessionStore {
    #[must_use]
    pub fn new(pool: PgPool, realm: Realm) -> Self {
        Self { pool, realm }
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn create(&self, session: NewSession) -> Result<Uuid> {
        match self.realm {
            Realm::Customer => {
                let tenant_id = session
                    .tenant_id
                    .ok_or_else(|| anyhow!("customer sessions require a tenant"))?;
                let query = r"
                    INSERT INTO sessions
                        (id, user_id, tenant_id, refresh_token_hash, user_agent, ip_address, expires_at)
                    VALUES ($1, $2, $3, $4, $5, $6, NOW() + ($7 * INTERVAL '1 second'))
                ";
                let span = tracing::info_span!(
                    "db.query",
                    db.system = "postgresql",
                    db.operation = "INSERT",
                    db.statement = query
                );
                sqlx::query(query)
                    .bind(session.id)
                    .bind(session.principal_id)
                    .bind(tenant_id)
                    .bind(&session.refresh_token_hash)
                    .bind(session.user_agent.as_deref())
                    .bind(session.ip_address.as_deref())
                    .bind(SESSION_TTL_SECONDS)
                    .execute(&self.pool)
                    .instrument(span)
                    .await
                    .context("failed to insert session")?;
            }
            Realm::Admin => {
                let query = r"
                    INSERT INTO admin_sessions
                        (id, admin_id, refresh_token_hash, user_agent, ip_address, expires_at)
                    VALUES ($1, $2, $3, $4, $5, NOW() + ($6 * INTERVAL '1 second'))
                ";
                let span = tracing::info_span!(
                    "db.query",
                    db.system = "postgresql",
                    db.operation = "INSERT",
                    db.statement = query
                );
                sqlx::query(query)
                    .bind(session.id)
                    .bind(session.principal_id)
                    .bind(&session.refresh_token_hash)
                    .bind(session.user_agent.as_deref())
                    .bind(session.ip_address.as_deref())
                    .bind(SESSION_TTL_SECONDS)
                    .execute(&self.pool)
                    .instrument(span)
                    .await
                    .context("failed to insert admin session")?;
            }
        }

        Ok(session.id)
    }

    async fn is_revoked(&self, session_id: Uuid) -> Result<bool> {
        let query = match self.realm {
            Realm::Customer => {
                "SELECT (revoked_at IS NOT NULL OR expires_at <= NOW()) AS inactive FROM sessions WHERE id = $1"
            }
            Realm::Admin => {
                "SELECT (revoked_at IS NOT NULL OR expires_at <= NOW()) AS inactive FROM admin_sessions WHERE id = $1"
            }
        };
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(session_id)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to lookup session")?;

        // Missing rows cannot authorize anything.
        Ok(row.map_or(true, |row| row.get::<bool, _>("inactive")))
    }

    async fn revoke(&self, session_id: Uuid) -> Result<()> {
        let query = match self.realm {
            Realm::Customer => {
                "UPDATE sessions SET revoked_at = NOW() WHERE id = $1 AND revoked_at IS NULL"
            }
            Realm::Admin => {
                "UPDATE admin_sessions SET revoked_at = NOW() WHERE id = $1 AND revoked_at IS NULL"
            }
        };
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(session_id)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to revoke session")?;
        Ok(())
    }

    async fn rotate(&self, session_id: Uuid, presented: &[u8], next: &[u8]) -> Result<bool> {
        let query = match self.realm {
            Realm::Customer => {
                r"
                UPDATE sessions SET refresh_token_hash = $3
                WHERE id = $1 AND refresh_token_hash = $2
                  AND revoked_at IS NULL AND expires_at > NOW()
                "
            }
            Realm::Admin => {
                r"
                UPDATE admin_sessions SET refresh_token_hash = $3
                WHERE id = $1 AND refresh_token_hash = $2
                  AND revoked_at IS NULL AND expires_at > NOW()
                "
            }
        };
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(session_id)
            .bind(presented)
            .bind(next)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to rotate session")?;
        Ok(result.rows_affected() == 1)
    }
}

#[derive(Clone, Debug)]
struct MemorySession {
    principal_id: Uuid,
    refresh_token_hash: Vec<u8>,
    expires_at: DateTime<Utc>,
    revoked_at: Option<DateTime<Utc>>,
}

/// Process-local session store for tests and single-node development.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<Uuid, MemorySession>>,
}

impl MemorySessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn revoked_at(&self, session_id: Uuid) -> Option<DateTime<Utc>> {
        self.sessions
            .lock()
            .await
            .get(&session_id)
            .and_then(|session| session.revoked_at)
    }

    pub async fn principal_of(&self, session_id: Uuid) -> Option<Uuid> {
        self.sessions
            .lock()
            .await
            .get(&session_id)
            .map(|session| session.principal_id)
    }

    /// Force a session past its expiry.
    pub async fn expire(&self, session_id: Uuid) {
        if let Some(session) = self.sessions.lock().await.get_mut(&session_id) {
            session.expires_at = Utc::now() - Duration::seconds(1);
        }
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create(&self, session: NewSession) -> Result<Uuid> {
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(&session.id) {
            return Err(anyhow!("session {} already exists", session.id));
        }
        sessions.insert(
            session.id,
            MemorySession {
                principal_id: session.principal_id,
                refresh_token_hash: session.refresh_token_hash,
                expires_at: Utc::now() + Duration::seconds(SESSION_TTL_SECONDS),
                revoked_at: None,
            },
        );
        Ok(session.id)
    }

    async fn is_revoked(&self, session_id: Uuid) -> Result<bool> {
        let sessions = self.sessions.lock().await;
        Ok(sessions.get(&session_id).map_or(true, |session| {
            session.revoked_at.is_some() || session.expires_at <= Utc::now()
        }))
    }

    async fn revoke(&self, session_id: Uuid) -> Result<()> {
        if let Some(session) = self.sessions.lock().await.get_mut(&session_id) {
            session.revoked_at.get_or_insert_with(Utc::now);
        }
        Ok(())
    }

    async fn rotate(&self, session_id: Uuid, presented: &[u8], next: &[u8]) -> Result<bool> {
        let mut sessions = self.sessions.lock().await;
        let Some(session) = sessions.get_mut(&session_id) else {
            return Ok(false);
        };
        let active = session.revoked_at.is_none() && session.expires_at > Utc::now();
        if active && session.refresh_token_hash == presented {
            session.refresh_token_hash = next.to_vec();
            Ok(true)
        } else {
            Ok(false)
        }
    }
}
