use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{PgPool, Row};
use tokio::sync::Mutex;
use tracing::Instrument;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Challenge {
    pub id: Uuid,
    pub code_hash: String,
    pub attempts: i32,
    pub max_attempts: i32,
}

/// A challenge to store, subject to the per-identifier send window.
#[derive(Clone, Copy, Debug)]
pub struct NewChallenge<'a> {
    pub identifier: &'a str,
    pub code_hash: &'a str,
    pub purpose: &'a str,
    pub ttl_seconds: i64,
    pub max_attempts: i32,
    pub send_limit: i64,
    pub window_seconds: i64,
}

#[async_trait]
pub trait OtpStore: Send + Sync {
    /// Insert the challenge unless `send_limit` challenges were already created
    /// for the identifier within the trailing window. The count and the insert
    /// are atomic per identifier. `None` means the window is exhausted.
    async fn insert_within_limit(&self, challenge: NewChallenge<'_>) -> Result<Option<Uuid>>;

    /// Newest challenge that is neither verified nor expired.
    async fn latest_active(&self, identifier: &str, purpose: &str) -> Result<Option<Challenge>>;

    /// Burn one attempt. `None` when the bound was already reached.
    async fn increment_attempts(&self, id: Uuid) -> Result<Option<i32>>;

    /// Set `verified_at` if unset. `false` when another caller got there first.
    async fn mark_verified(&self, id: Uuid) -> Result<bool>;
}

#[derive(Clone, Debug)]
pub struct PgOtpStore {
    pool: PgPool,
}

impl PgOtpStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OtpStore for PgOtpStore {
    async fn insert_within_limit(&self, challenge: NewChallenge<'_>) -> Result<Option<Uuid>> {
        let mut tx = self.pool.begin().await.context("failed to begin transaction")?;

        // Serializes concurrent sends for one identifier until commit.
        let query = "SELECT pg_advisory_xact_lock(hashtext($1))";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        sqlx::query(query)
            .bind(challenge.identifier)
            .execute(&mut *tx)
            .instrument(span)
            .await
            .context("failed to lock otp identifier")?;

        let query = r"
            SELECT COUNT(*) AS recent FROM otp_codes
            WHERE identifier = $1 AND created_at > NOW() - ($2 * INTERVAL '1 second')
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let recent: i64 = sqlx::query(query)
            .bind(challenge.identifier)
            .bind(challenge.window_seconds)
            .fetch_one(&mut *tx)
            .instrument(span)
            .await
            .context("failed to count recent otp codes")?
            .get("recent");
        if recent >= challenge.send_limit {
            return Ok(None);
        }

        let query = r"
            INSERT INTO otp_codes (identifier, code_hash, purpose, max_attempts, expires_at)
            VALUES ($1, $2, $3, $4, NOW() + ($5 * INTERVAL '1 second'))
            RETURNING id
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        let id: Uuid = sqlx::query(query)
            .bind(challenge.identifier)
            .bind(challenge.code_hash)
            .bind(challenge.purpose)
            .bind(challenge.max_attempts)
            .bind(challenge.ttl_seconds)
            .fetch_one(&mut *tx)
            .instrument(span)
            .await
            .context("failed to insert otp code")?
            .get("id");

        tx.commit().await.context("failed to commit otp code")?;
        Ok(Some(id))
    }

    async fn latest_active(&self, identifier: &str, purpose: &str) -> Result<Option<Challenge>> {
        let query = r"
            SELECT id, code_hash, attempts, max_attempts FROM otp_codes
            WHERE identifier = $1 AND purpose = $2
              AND verified_at IS NULL AND expires_at > NOW()
            ORDER BY created_at DESC
            LIMIT 1
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(identifier)
            .bind(purpose)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to lookup otp code")?;
        Ok(row.map(|row| Challenge {
            id: row.get("id"),
            code_hash: row.get("code_hash"),
            attempts: row.get("attempts"),
            max_attempts: row.get("max_attempts"),
        }))
    }

    async fn increment_attempts(&self, id: Uuid) -> Result<Option<i32>> {
        let query = r"
            UPDATE otp_codes SET attempts = attempts + 1
            WHERE id = $1 AND attempts < max_attempts
            RETURNING attempts
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(id)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to increment otp attempts")?;
        Ok(row.map(|row| row.get("attempts")))
    }

    async fn mark_verified(&self, id: Uuid) -> Result<bool> {
        let query = "UPDATE otp_codes SET verified_at = NOW() WHERE id = $1 AND verified_at IS NULL";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(id)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to mark otp verified")?;
        Ok(result.rows_affected() == 1)
    }
}

#[derive(Clone, Debug)]
struct MemoryChallenge {
    id: Uuid,
    identifier: String,
    code_hash: String,
    purpose: String,
    attempts: i32,
    max_attempts: i32,
    expires_at: DateTime<Utc>,
    verified_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

/// Process-local store used by tests.
#[derive(Debug, Default)]
pub struct MemoryOtpStore {
    challenges: Mutex<Vec<MemoryChallenge>>,
}

impl MemoryOtpStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OtpStore for MemoryOtpStore {
    async fn insert_within_limit(&self, challenge: NewChallenge<'_>) -> Result<Option<Uuid>> {
        let now = Utc::now();
        let since = now - Duration::seconds(challenge.window_seconds);
        let mut challenges = self.challenges.lock().await;

        let recent = challenges
            .iter()
            .filter(|c| c.identifier == challenge.identifier && c.created_at > since)
            .count();
        if i64::try_from(recent)? >= challenge.send_limit {
            return Ok(None);
        }

        let id = Uuid::new_v4();
        challenges.push(MemoryChallenge {
            id,
            identifier: challenge.identifier.to_string(),
            code_hash: challenge.code_hash.to_string(),
            purpose: challenge.purpose.to_string(),
            attempts: 0,
            max_attempts: challenge.max_attempts,
            expires_at: now + Duration::seconds(challenge.ttl_seconds),
            verified_at: None,
            created_at: now,
        });
        Ok(Some(id))
    }

    async fn latest_active(&self, identifier: &str, purpose: &str) -> Result<Option<Challenge>> {
        let now = Utc::now();
        Ok(self
            .challenges
            .lock()
            .await
            .iter()
            .filter(|c| {
                c.identifier == identifier
                    && c.purpose == purpose
                    && c.verified_at.is_none()
                    && c.expires_at > now
            })
            .max_by_key(|c| c.created_at)
            .map(|c| Challenge {
                id: c.id,
                code_hash: c.code_hash.clone(),
                attempts: c.attempts,
                max_attempts: c.max_attempts,
            }))
    }

    async fn increment_attempts(&self, id: Uuid) -> Result<Option<i32>> {
        let mut challenges = self.challenges.lock().await;
        Ok(challenges
            .iter_mut()
            .find(|c| c.id == id && c.attempts < c.max_attempts)
            .map(|c| {
                c.attempts += 1;
                c.attempts
            }))
    }

    async fn mark_verified(&self, id: Uuid) -> Result<bool> {
        let mut challenges = self.challenges.lock().await;
        match challenges
            .iter_mut()
            .find(|c| c.id == id && c.verified_at.is_none())
        {
            Some(challenge) => {
                challenge.verified_at = Some(Utc::now());
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
