//! Admin principals: bootstrap, invite and listing.
//!
//! Flow Overview:
//! 1) Signup is open only while no `super_admin` exists.
//! 2) The bootstrap admin is the only row with no `invited_by`; the unique
//!    partial index `admin_users_single_bootstrap` settles concurrent signups
//!    and the loser sees [`AdminOutcome::BootstrapTaken`].
//! 3) Every later admin, `super_admin` included, is invited by a
//!    `super_admin` or `system_admin`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::{Rng, distributions::Alphanumeric, rngs::OsRng};
use sqlx::{PgPool, Row};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::Instrument;
use uuid::Uuid;

use crate::realm::{LoginRecord, MemoryDirectory, PrincipalDirectory, PrincipalRecord};

pub const ROLE_SUPER_ADMIN: &str = "super_admin";
pub const ROLE_SYSTEM_ADMIN: &str = "system_admin";
pub const ROLE_SUPPORT_AGENT: &str = "support_agent";
pub const ROLE_FINANCE_ADMIN: &str = "finance_admin";
pub const ADMIN_ROLES: [&str; 4] = [
    ROLE_SUPER_ADMIN,
    ROLE_SYSTEM_ADMIN,
    ROLE_SUPPORT_AGENT,
    ROLE_FINANCE_ADMIN,
];

const BOOTSTRAP_INDEX: &str = "admin_users_single_bootstrap";
const TEMP_PASSWORD_LEN: usize = 16;

#[must_use]
pub fn is_admin_role(role: &str) -> bool {
    ADMIN_ROLES.contains(&role)
}

/// Roles allowed to invite and list admins.
#[must_use]
pub fn can_manage_admins(role: &str) -> bool {
    role == ROLE_SUPER_ADMIN || role == ROLE_SYSTEM_ADMIN
}

/// Random alphanumeric password handed to an invited admin once.
#[must_use]
pub fn temporary_password() -> String {
    OsRng
        .sample_iter(&Alphanumeric)
        .take(TEMP_PASSWORD_LEN)
        .map(char::from)
        .collect()
}

#[derive(Clone, Debug)]
pub struct NewAdmin {
    pub email: String,
    pub password_hash: String,
    pub first_name: String,
    pub last_name: String,
    pub role: String,
    pub invited_by: Option<Uuid>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AdminOutcome {
    Created(PrincipalRecord),
    EmailTaken,
    /// Another uninvited admin already holds the bootstrap slot.
    BootstrapTaken,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdminSummary {
    pub id: Uuid,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub role: String,
    pub status: String,
    pub last_login_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait AdminStore: Send + Sync {
    async fn super_admin_exists(&self) -> Result<bool>;

    async fn create(&self, admin: NewAdmin) -> Result<AdminOutcome>;

    /// Newest first, capped at 100.
    async fn list(&self) -> Result<Vec<AdminSummary>>;
}

#[derive(Clone, Debug)]
pub struct PgAdminStore {
    pool: PgPool,
}

impl PgAdminStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AdminStore for PgAdminStore {
    async fn super_admin_exists(&self) -> Result<bool> {
        let query = "SELECT EXISTS(SELECT 1 FROM admin_users WHERE role = 'super_admin') AS exists";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .fetch_one(&self.pool)
            .instrument(span)
            .await
            .context("failed to check for super admin")?;
        Ok(row.get("exists"))
    }

    async fn create(&self, admin: NewAdmin) -> Result<AdminOutcome> {
        let query = r"
            INSERT INTO admin_users
                (email, password_hash, first_name, last_name, role, status, invited_by)
            VALUES ($1, $2, $3, $4, $5, 'active', $6)
            RETURNING id
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(&admin.email)
            .bind(&admin.password_hash)
            .bind(&admin.first_name)
            .bind(&admin.last_name)
            .bind(&admin.role)
            .bind(admin.invited_by)
            .fetch_one(&self.pool)
            .instrument(span)
            .await;

        match result {
            Ok(row) => Ok(AdminOutcome::Created(PrincipalRecord {
                id: row.get("id"),
                tenant_id: None,
                email: Some(admin.email),
                phone: None,
                first_name: admin.first_name,
                last_name: admin.last_name,
                role: admin.role,
            })),
            Err(sqlx::Error::Database(db_err))
                if db_err.code().is_some_and(|code| code.as_ref() == "23505") =>
            {
                if db_err.constraint() == Some(BOOTSTRAP_INDEX) {
                    Ok(AdminOutcome::BootstrapTaken)
                } else {
                    Ok(AdminOutcome::EmailTaken)
                }
            }
            Err(err) => Err(err).context("failed to insert admin"),
        }
    }

    async fn list(&self) -> Result<Vec<AdminSummary>> {
        let query = r"
            SELECT id, email, first_name, last_name, role, status, last_login_at, created_at
            FROM admin_users
            ORDER BY created_at DESC
            LIMIT 100
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let rows = sqlx::query(query)
            .fetch_all(&self.pool)
            .instrument(span)
            .await
            .context("failed to list admins")?;
        Ok(rows
            .into_iter()
            .map(|row| AdminSummary {
                id: row.get("id"),
                email: row.get("email"),
                first_name: row.get("first_name"),
                last_name: row.get("last_name"),
                role: row.get("role"),
                status: row.get("status"),
                last_login_at: row.get("last_login_at"),
                created_at: row.get("created_at"),
            })
            .collect())
    }
}

/// In-process admin store backed by the admin realm's [`MemoryDirectory`].
#[derive(Debug)]
pub struct MemoryAdminStore {
    directory: Arc<MemoryDirectory>,
    admins: Mutex<MemoryAdmins>,
}

#[derive(Debug, Default)]
struct MemoryAdmins {
    rows: Vec<AdminSummary>,
    bootstrapped: bool,
}

impl MemoryAdminStore {
    #[must_use]
    pub fn new(directory: Arc<MemoryDirectory>) -> Self {
        Self {
            directory,
            admins: Mutex::new(MemoryAdmins::default()),
        }
    }
}

#[async_trait]
impl AdminStore for MemoryAdminStore {
    async fn super_admin_exists(&self) -> Result<bool> {
        Ok(self
            .admins
            .lock()
            .await
            .rows
            .iter()
            .any(|admin| admin.role == ROLE_SUPER_ADMIN))
    }

    async fn create(&self, admin: NewAdmin) -> Result<AdminOutcome> {
        let mut admins = self.admins.lock().await;
        if admin.invited_by.is_none() && admins.bootstrapped {
            return Ok(AdminOutcome::BootstrapTaken);
        }
        if self.directory.find_login(&admin.email).await?.is_some() {
            return Ok(AdminOutcome::EmailTaken);
        }

        let principal = PrincipalRecord {
            id: Uuid::new_v4(),
            tenant_id: None,
            email: Some(admin.email.clone()),
            phone: None,
            first_name: admin.first_name.clone(),
            last_name: admin.last_name.clone(),
            role: admin.role.clone(),
        };
        if admin.invited_by.is_none() {
            admins.bootstrapped = true;
        }
        admins.rows.push(AdminSummary {
            id: principal.id,
            email: admin.email,
            first_name: admin.first_name,
            last_name: admin.last_name,
            role: admin.role,
            status: "active".to_string(),
            last_login_at: None,
            created_at: Utc::now(),
        });
        self.directory
            .insert(LoginRecord {
                principal: principal.clone(),
                status: "active".to_string(),
                password_hash: Some(admin.password_hash),
            })
            .await;
        Ok(AdminOutcome::Created(principal))
    }

    async fn list(&self) -> Result<Vec<AdminSummary>> {
        let mut admins = self.admins.lock().await.rows.clone();
        admins.reverse();
        admins.truncate(100);
        Ok(admins)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn admin(email: &str, role: &str) -> NewAdmin {
        NewAdmin {
            email: email.to_string(),
            password_hash: "hash".to_string(),
            first_name: "Rory".to_string(),
            last_name: "Williams".to_string(),
            role: role.to_string(),
            invited_by: None,
        }
    }

    #[tokio::test]
    async fn only_one_uninvited_admin_is_ever_created() -> Result<()> {
        let store = MemoryAdminStore::new(Arc::new(MemoryDirectory::new()));

        let first = store.create(admin("root@berhot.com", ROLE_SUPER_ADMIN)).await?;
        assert!(matches!(first, AdminOutcome::Created(_)));
        assert!(store.super_admin_exists().await?);

        let second = store.create(admin("other@berhot.com", ROLE_SUPER_ADMIN)).await?;
        assert_eq!(second, AdminOutcome::BootstrapTaken);
        Ok(())
    }

    #[tokio::test]
    async fn invited_super_admins_are_not_bootstrap_locked() -> Result<()> {
        let store = MemoryAdminStore::new(Arc::new(MemoryDirectory::new()));
        let AdminOutcome::Created(root) =
            store.create(admin("root@berhot.com", ROLE_SUPER_ADMIN)).await?
        else {
            anyhow::bail!("bootstrap admin was not created");
        };

        let mut invited = admin("deputy@berhot.com", ROLE_SUPER_ADMIN);
        invited.invited_by = Some(root.id);
        let outcome = store.create(invited).await?;
        assert!(matches!(outcome, AdminOutcome::Created(ref p) if p.role == ROLE_SUPER_ADMIN));
        assert_eq!(store.list().await?.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_email_is_reported() -> Result<()> {
        let store = MemoryAdminStore::new(Arc::new(MemoryDirectory::new()));
        store.create(admin("agent@berhot.com", ROLE_SUPPORT_AGENT)).await?;

        let again = store.create(admin("agent@berhot.com", ROLE_FINANCE_ADMIN)).await?;
        assert_eq!(again, AdminOutcome::EmailTaken);
        Ok(())
    }

    #[tokio::test]
    async fn list_is_newest_first() -> Result<()> {
        let store = MemoryAdminStore::new(Arc::new(MemoryDirectory::new()));
        store.create(admin("first@berhot.com", ROLE_SUPER_ADMIN)).await?;
        store.create(admin("second@berhot.com", ROLE_SUPPORT_AGENT)).await?;

        let emails: Vec<_> = store.list().await?.into_iter().map(|a| a.email).collect();
        assert_eq!(emails, ["second@berhot.com", "first@berhot.com"]);
        Ok(())
    }

    #[test]
    fn management_roles() {
        assert!(can_manage_admins(ROLE_SUPER_ADMIN));
        assert!(can_manage_admins(ROLE_SYSTEM_ADMIN));
        assert!(!can_manage_admins(ROLE_SUPPORT_AGENT));
        assert!(is_admin_role(ROLE_FINANCE_ADMIN));
        assert!(!is_admin_role("tenant_owner"));
    }

    #[test]
    fn temporary_passwords_are_sixteen_alphanumerics() {
        let password = temporary_password();
        assert_eq!(password.len(), 16);
        assert!(password.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
