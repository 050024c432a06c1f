//! Principal lookups, one table per realm.
//!
//! A customer counts as active only while both the user row and its tenant
//! are `active`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{PgPool, Row, postgres::PgRow};
use std::collections::HashSet;
use tokio::sync::Mutex;
use tracing::Instrument;
use uuid::Uuid;

use super::Realm;
use crate::token::Subject;

const TENANT_INACTIVE: &str = "tenant_inactive";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PrincipalRecord {
    pub id: Uuid,
    pub tenant_id: Option<Uuid>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub first_name: String,
    pub last_name: String,
    pub role: String,
}

impl PrincipalRecord {
    #[must_use]
    pub fn subject(&self) -> Subject {
        Subject {
            principal_id: self.id,
            tenant_id: self.tenant_id,
            email: self.email.clone(),
            role: self.role.clone(),
        }
    }
}

/// Fields needed to check a password login, regardless of status. For
/// customers of an inactive tenant `status` reads `tenant_inactive`.
#[derive(Clone, Debug)]
pub struct LoginRecord {
    pub principal: PrincipalRecord,
    pub status: String,
    pub password_hash: Option<String>,
}

impl LoginRecord {
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == "active"
    }
}

#[async_trait]
pub trait PrincipalDirectory: Send + Sync {
    /// Active principal by id.
    async fn find_active(&self, id: Uuid) -> Result<Option<PrincipalRecord>>;

    /// Login data for an email or phone identifier, any status.
    async fn find_login(&self, identifier: &str) -> Result<Option<LoginRecord>>;

    /// Active principal by email or phone.
    async fn find_active_by_identifier(&self, identifier: &str) -> Result<Option<PrincipalRecord>>;

    async fn record_login(&self, id: Uuid) -> Result<()>;

    /// Stamp the phone as verified after an OTP proved possession.
    async fn mark_phone_verified(&self, _id: Uuid) -> Result<()> {
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct PgDirectory {
    pool: PgPool,
    realm: Realm,
}

impl PgDirectory {
    #[must_use]
    pub fn new(pool: PgPool, realm: Realm) -> Self {
        Self { pool, realm }
    }

    async fn fetch_principal(
        &self,
        query: &'static str,
        bind: &str,
        id: Option<Uuid>,
    ) -> Result<Option<PgRow>> {
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let statement = if let Some(id) = id {
            sqlx::query(query).bind(id)
        } else {
            sqlx::query(query).bind(bind.to_string())
        };
        statement
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .with_context(|| format!("failed to lookup {} principal", self.realm))
    }
}

fn principal_from_row(row: &PgRow) -> PrincipalRecord {
    PrincipalRecord {
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        email: row.get("email"),
        phone: row.get("phone"),
        first_name: row.get("first_name"),
        last_name: row.get("last_name"),
        role: row.get("role"),
    }
}

#[async_trait]
impl PrincipalDirectory for PgDirectory {
    async fn find_active(&self, id: Uuid) -> Result<Option<PrincipalRecord>> {
        let query = match self.realm {
            Realm::Customer => {
                r"
                SELECT u.id, u.tenant_id, u.email, u.phone, u.first_name, u.last_name, u.role
                FROM users u
                JOIN tenants t ON t.id = u.tenant_id AND t.status = 'active'
                WHERE u.id = $1 AND u.status = 'active'
                "
            }
            Realm::Admin => {
                r"
                SELECT id, NULL::uuid AS tenant_id, email, NULL::text AS phone,
                       first_name, last_name, role
                FROM admin_users WHERE id = $1 AND status = 'active'
                "
            }
        };
        let row = self.fetch_principal(query, "", Some(id)).await?;
        Ok(row.as_ref().map(principal_from_row))
    }

    async fn find_login(&self, identifier: &str) -> Result<Option<LoginRecord>> {
        let query = match self.realm {
            Realm::Customer => {
                r"
                SELECT u.id, u.tenant_id, u.email, u.phone, u.first_name, u.last_name, u.role,
                       CASE WHEN t.status = 'active' THEN u.status ELSE 'tenant_inactive' END
                           AS status,
                       u.password_hash
                FROM users u
                JOIN tenants t ON t.id = u.tenant_id
                WHERE u.email = $1 OR u.phone = $1
                LIMIT 1
                "
            }
            Realm::Admin => {
                r"
                SELECT id, NULL::uuid AS tenant_id, email, NULL::text AS phone,
                       first_name, last_name, role, status, password_hash
                FROM admin_users WHERE email = $1
                "
            }
        };
        let row = self.fetch_principal(query, identifier, None).await?;
        Ok(row.map(|row| LoginRecord {
            principal: principal_from_row(&row),
            status: row.get("status"),
            password_hash: row.get("password_hash"),
        }))
    }

    async fn find_active_by_identifier(&self, identifier: &str) -> Result<Option<PrincipalRecord>> {
        let query = match self.realm {
            Realm::Customer => {
                r"
                SELECT u.id, u.tenant_id, u.email, u.phone, u.first_name, u.last_name, u.role
                FROM users u
                JOIN tenants t ON t.id = u.tenant_id AND t.status = 'active'
                WHERE (u.email = $1 OR u.phone = $1) AND u.status = 'active'
                LIMIT 1
                "
            }
            Realm::Admin => {
                r"
                SELECT id, NULL::uuid AS tenant_id, email, NULL::text AS phone,
                       first_name, last_name, role
                FROM admin_users WHERE email = $1 AND status = 'active'
                "
            }
        };
        let row = self.fetch_principal(query, identifier, None).await?;
        Ok(row.as_ref().map(principal_from_row))
    }

    async fn record_login(&self, id: Uuid) -> Result<()> {
        let query = match self.realm {
            Realm::Customer => "UPDATE users SET last_login_at = NOW() WHERE id = $1",
            Realm::Admin => "UPDATE admin_users SET last_login_at = NOW() WHERE id = $1",
        };
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(id)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to record login")?;
        Ok(())
    }

    async fn mark_phone_verified(&self, id: Uuid) -> Result<()> {
        if self.realm == Realm::Admin {
            return Ok(());
        }
        let query =
            "UPDATE users SET phone_verified_at = COALESCE(phone_verified_at, NOW()) WHERE id = $1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(id)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to mark phone verified")?;
        Ok(())
    }
}

/// In-process directory for tests.
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    records: Mutex<Vec<LoginRecord>>,
    inactive_tenants: Mutex<HashSet<Uuid>>,
    logins: Mutex<Vec<Uuid>>,
    phone_verified: Mutex<Vec<Uuid>>,
}

impl MemoryDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, record: LoginRecord) {
        self.records.lock().await.push(record);
    }

    pub async fn set_role(&self, id: Uuid, role: &str) {
        for record in self.records.lock().await.iter_mut() {
            if record.principal.id == id {
                record.principal.role = role.to_string();
            }
        }
    }

    pub async fn set_status(&self, id: Uuid, status: &str) {
        for record in self.records.lock().await.iter_mut() {
            if record.principal.id == id {
                record.status = status.to_string();
            }
        }
    }

    /// Mirror a tenant status change for the principals it owns.
    pub async fn set_tenant_status(&self, tenant_id: Uuid, status: &str) {
        let mut inactive = self.inactive_tenants.lock().await;
        if status == "active" {
            inactive.remove(&tenant_id);
        } else {
            inactive.insert(tenant_id);
        }
    }

    /// Records as lookups see them, with the tenant status folded in.
    async fn snapshot(&self) -> Vec<LoginRecord> {
        let inactive = self.inactive_tenants.lock().await.clone();
        self.records
            .lock()
            .await
            .iter()
            .cloned()
            .map(|mut record| {
                if record.principal.tenant_id.is_some_and(|id| inactive.contains(&id)) {
                    record.status = TENANT_INACTIVE.to_string();
                }
                record
            })
            .collect()
    }

    pub async fn get(&self, id: Uuid) -> Option<LoginRecord> {
        self.records
            .lock()
            .await
            .iter()
            .find(|record| record.principal.id == id)
            .cloned()
    }

    pub async fn phone_verified(&self, id: Uuid) -> bool {
        self.phone_verified.lock().await.contains(&id)
    }

    pub async fn login_count(&self, id: Uuid) -> usize {
        self.logins.lock().await.iter().filter(|&&login| login == id).count()
    }
}

fn matches_identifier(principal: &PrincipalRecord, identifier: &str) -> bool {
    principal.email.as_deref() == Some(identifier) || principal.phone.as_deref() == Some(identifier)
}

#[async_trait]
impl PrincipalDirectory for MemoryDirectory {
    async fn find_active(&self, id: Uuid) -> Result<Option<PrincipalRecord>> {
        Ok(self
            .snapshot()
            .await
            .into_iter()
            .find(|record| record.principal.id == id && record.is_active())
            .map(|record| record.principal))
    }

    async fn find_login(&self, identifier: &str) -> Result<Option<LoginRecord>> {
        Ok(self
            .snapshot()
            .await
            .into_iter()
            .find(|record| matches_identifier(&record.principal, identifier)))
    }

    async fn find_active_by_identifier(&self, identifier: &str) -> Result<Option<PrincipalRecord>> {
        Ok(self
            .snapshot()
            .await
            .into_iter()
            .find(|record| record.is_active() && matches_identifier(&record.principal, identifier))
            .map(|record| record.principal))
    }

    async fn record_login(&self, id: Uuid) -> Result<()> {
        self.logins.lock().await.push(id);
        Ok(())
    }

    async fn mark_phone_verified(&self, id: Uuid) -> Result<()> {
        let mut verified = self.phone_verified.lock().await;
        if !verified.contains(&id) {
            verified.push(id);
        }
        Ok(())
    }
}
