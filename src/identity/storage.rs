//! Customer account persistence.
//!
//! Flow Overview:
//! 1) Registration writes the tenant (when provisioned), the user and an
//!    optional Google link in one transaction; any failure rolls all of it back.
//! 2) A duplicate email or phone surfaces as [`CreateOutcome::Duplicate`], not an error.
//! 3) OAuth links are upserted on `(provider, provider_user_id)` and never
//!    move to a different user.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::Instrument;
use uuid::Uuid;

use crate::realm::{LoginRecord, MemoryDirectory, PrincipalDirectory, PrincipalRecord};

pub const TENANT_ACTIVE: &str = "active";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewTenant {
    pub id: Uuid,
    pub name: String,
    pub slug: String,
    pub country: String,
    pub country_id: Option<String>,
    pub region_id: Option<String>,
    pub city_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewUser {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub password_hash: Option<String>,
    pub first_name: String,
    pub last_name: String,
    pub role: String,
    pub auth_provider: String,
    pub email_verified: bool,
}

/// Provider identity attached to a user.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OAuthLink {
    pub provider: String,
    pub provider_user_id: String,
    pub provider_email: Option<String>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_in: Option<i64>,
    pub raw_profile: Option<serde_json::Value>,
}

#[derive(Clone, Debug)]
pub struct NewAccount {
    /// Present when registration provisions its own tenant.
    pub tenant: Option<NewTenant>,
    pub user: NewUser,
    pub link: Option<OAuthLink>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CreateOutcome {
    Created(PrincipalRecord),
    Duplicate,
}

/// Full user view for service-to-service lookups.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserProfile {
    pub principal: PrincipalRecord,
    pub status: String,
    pub email_verified: bool,
    pub phone_verified: bool,
    pub has_password: bool,
}

#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Status of a tenant, `None` when it does not exist.
    async fn tenant_status(&self, tenant_id: Uuid) -> Result<Option<String>>;

    async fn create_account(&self, account: NewAccount) -> Result<CreateOutcome>;

    /// Active user linked to a provider identity.
    async fn find_by_link(&self, provider: &str, provider_user_id: &str)
    -> Result<Option<PrincipalRecord>>;

    /// Attach or refresh a provider link. Returns `false` when the identity
    /// already belongs to another user.
    async fn upsert_link(&self, user_id: Uuid, link: &OAuthLink) -> Result<bool>;

    /// Auth provider tag of the active user holding `identifier`.
    async fn auth_provider(&self, identifier: &str) -> Result<Option<String>>;

    async fn profile(&self, user_id: Uuid) -> Result<Option<UserProfile>>;
}

#[derive(Clone, Debug)]
pub struct PgIdentityStore {
    pool: PgPool,
}

impl PgIdentityStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| code.as_ref() == "23505"),
        _ => false,
    }
}

fn token_expiry(expires_in: Option<i64>) -> Option<DateTime<Utc>> {
    expires_in.map(|seconds| Utc::now() + Duration::seconds(seconds))
}

async fn insert_tenant(tx: &mut Transaction<'_, Postgres>, tenant: &NewTenant) -> Result<()> {
    let query = r"
        INSERT INTO tenants (id, name, slug, status, plan, country, country_id, region_id, city_id)
        VALUES ($1, $2, $3, 'active', 'free', $4, $5, $6, $7)
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(tenant.id)
        .bind(&tenant.name)
        .bind(&tenant.slug)
        .bind(&tenant.country)
        .bind(&tenant.country_id)
        .bind(&tenant.region_id)
        .bind(&tenant.city_id)
        .execute(&mut **tx)
        .instrument(span)
        .await
        .context("failed to insert tenant")?;
    Ok(())
}

async fn insert_user(
    tx: &mut Transaction<'_, Postgres>,
    user: &NewUser,
) -> std::result::Result<(), sqlx::Error> {
    let query = r"
        INSERT INTO users
            (id, tenant_id, email, phone, password_hash, first_name, last_name, role,
             status, auth_provider, email_verified_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'active', $9,
                CASE WHEN $10 THEN NOW() ELSE NULL END)
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user.id)
        .bind(user.tenant_id)
        .bind(&user.email)
        .bind(&user.phone)
        .bind(&user.password_hash)
        .bind(&user.first_name)
        .bind(&user.last_name)
        .bind(&user.role)
        .bind(&user.auth_provider)
        .bind(user.email_verified)
        .execute(&mut **tx)
        .instrument(span)
        .await?;
    Ok(())
}

const UPSERT_LINK: &str = r"
    INSERT INTO oauth_accounts
        (user_id, provider, provider_user_id, provider_email, access_token, refresh_token,
         token_expires_at, raw_profile)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
    ON CONFLICT (provider, provider_user_id) DO UPDATE
    SET access_token = EXCLUDED.access_token,
        refresh_token = COALESCE(EXCLUDED.refresh_token, oauth_accounts.refresh_token),
        token_expires_at = EXCLUDED.token_expires_at,
        raw_profile = COALESCE(EXCLUDED.raw_profile, oauth_accounts.raw_profile),
        provider_email = COALESCE(EXCLUDED.provider_email, oauth_accounts.provider_email)
    WHERE oauth_accounts.user_id = EXCLUDED.user_id
";

#[async_trait]
impl IdentityStore for PgIdentityStore {
    async fn tenant_status(&self, tenant_id: Uuid) -> Result<Option<String>> {
        let query = "SELECT status FROM tenants WHERE id = $1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to lookup tenant")?;
        Ok(row.map(|row| row.get("status")))
    }

    async fn create_account(&self, account: NewAccount) -> Result<CreateOutcome> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin registration transaction")?;

        if let Some(tenant) = &account.tenant {
            insert_tenant(&mut tx, tenant).await?;
        }

        match insert_user(&mut tx, &account.user).await {
            Ok(()) => {}
            Err(err) if is_unique_violation(&err) => {
                tx.rollback()
                    .await
                    .context("failed to rollback registration transaction")?;
                return Ok(CreateOutcome::Duplicate);
            }
            Err(err) => return Err(err).context("failed to insert user"),
        }

        if let Some(link) = &account.link {
            let span = tracing::info_span!(
                "db.query",
                db.system = "postgresql",
                db.operation = "INSERT",
                db.statement = UPSERT_LINK
            );
            let result = sqlx::query(UPSERT_LINK)
                .bind(account.user.id)
                .bind(&link.provider)
                .bind(&link.provider_user_id)
                .bind(&link.provider_email)
                .bind(&link.access_token)
                .bind(&link.refresh_token)
                .bind(token_expiry(link.expires_in))
                .bind(&link.raw_profile)
                .execute(&mut *tx)
                .instrument(span)
                .await
                .context("failed to link oauth account")?;
            if result.rows_affected() == 0 {
                tx.rollback()
                    .await
                    .context("failed to rollback registration transaction")?;
                return Ok(CreateOutcome::Duplicate);
            }
        }

        tx.commit()
            .await
            .context("failed to commit registration transaction")?;

        let user = account.user;
        Ok(CreateOutcome::Created(PrincipalRecord {
            id: user.id,
            tenant_id: Some(user.tenant_id),
            email: user.email,
            phone: user.phone,
            first_name: user.first_name,
            last_name: user.last_name,
            role: user.role,
        }))
    }

    async fn find_by_link(
        &self,
        provider: &str,
        provider_user_id: &str,
    ) -> Result<Option<PrincipalRecord>> {
        let query = r"
            SELECT u.id, u.tenant_id, u.email, u.phone, u.first_name, u.last_name, u.role
            FROM oauth_accounts o
            JOIN users u ON u.id = o.user_id
            JOIN tenants t ON t.id = u.tenant_id AND t.status = 'active'
            WHERE o.provider = $1 AND o.provider_user_id = $2 AND u.status = 'active'
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(provider)
            .bind(provider_user_id)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to lookup oauth link")?;
        Ok(row.map(|row| PrincipalRecord {
            id: row.get("id"),
            tenant_id: row.get("tenant_id"),
            email: row.get("email"),
            phone: row.get("phone"),
            first_name: row.get("first_name"),
            last_name: row.get("last_name"),
            role: row.get("role"),
        }))
    }

    async fn upsert_link(&self, user_id: Uuid, link: &OAuthLink) -> Result<bool> {
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = UPSERT_LINK
        );
        let result = sqlx::query(UPSERT_LINK)
            .bind(user_id)
            .bind(&link.provider)
            .bind(&link.provider_user_id)
            .bind(&link.provider_email)
            .bind(&link.access_token)
            .bind(&link.refresh_token)
            .bind(token_expiry(link.expires_in))
            .bind(&link.raw_profile)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to upsert oauth link")?;
        Ok(result.rows_affected() > 0)
    }

    async fn auth_provider(&self, identifier: &str) -> Result<Option<String>> {
        let query = r"
            SELECT auth_provider FROM users
            WHERE (email = $1 OR phone = $1) AND status = 'active'
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
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to lookup auth provider")?;
        Ok(row.map(|row| row.get("auth_provider")))
    }

    async fn profile(&self, user_id: Uuid) -> Result<Option<UserProfile>> {
        let query = r"
            SELECT id, tenant_id, email, phone, first_name, last_name, role, status,
                   email_verified_at IS NOT NULL AS email_verified,
                   phone_verified_at IS NOT NULL AS phone_verified,
                   COALESCE(password_hash, '') <> '' AS has_password
            FROM users WHERE id = $1
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to lookup user profile")?;
        Ok(row.map(|row| UserProfile {
            principal: PrincipalRecord {
                id: row.get("id"),
                tenant_id: row.get("tenant_id"),
                email: row.get("email"),
                phone: row.get("phone"),
                first_name: row.get("first_name"),
                last_name: row.get("last_name"),
                role: row.get("role"),
            },
            status: row.get("status"),
            email_verified: row.get("email_verified"),
            phone_verified: row.get("phone_verified"),
            has_password: row.get("has_password"),
        }))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoryTenant {
    pub name: String,
    pub slug: String,
    pub status: String,
    pub plan: String,
    pub country: String,
}

#[derive(Clone, Debug, Default)]
struct MemoryExtras {
    auth_provider: String,
    email_verified: bool,
}

#[derive(Debug, Default)]
struct MemoryState {
    tenants: HashMap<Uuid, MemoryTenant>,
    extras: HashMap<Uuid, MemoryExtras>,
    links: HashMap<(String, String), (Uuid, OAuthLink)>,
}

/// In-process store for tests. Users land in the shared [`MemoryDirectory`]
/// so they can log in through the realm afterwards.
#[derive(Debug)]
pub struct MemoryIdentityStore {
    directory: Arc<MemoryDirectory>,
    state: Mutex<MemoryState>,
}

impl MemoryIdentityStore {
    #[must_use]
    pub fn new(directory: Arc<MemoryDirectory>) -> Self {
        Self {
            directory,
            state: Mutex::new(MemoryState::default()),
        }
    }

    pub async fn insert_tenant(&self, id: Uuid, name: &str, status: &str) {
        self.directory.set_tenant_status(id, status).await;
        self.state.lock().await.tenants.insert(
            id,
            MemoryTenant {
                name: name.to_string(),
                slug: crate::identity::unique_slug(name),
                status: status.to_string(),
                plan: "free".to_string(),
                country: "SA".to_string(),
            },
        );
    }

    pub async fn set_tenant_status(&self, id: Uuid, status: &str) {
        if let Some(tenant) = self.state.lock().await.tenants.get_mut(&id) {
            tenant.status = status.to_string();
        }
        self.directory.set_tenant_status(id, status).await;
    }

    pub async fn tenant(&self, id: Uuid) -> Option<MemoryTenant> {
        self.state.lock().await.tenants.get(&id).cloned()
    }

    pub async fn tenant_count(&self) -> usize {
        self.state.lock().await.tenants.len()
    }

    pub async fn link_of(&self, provider: &str, provider_user_id: &str) -> Option<(Uuid, OAuthLink)> {
        self.state
            .lock()
            .await
            .links
            .get(&(provider.to_string(), provider_user_id.to_string()))
            .cloned()
    }
}

impl MemoryState {
    fn upsert_link(&mut self, user_id: Uuid, link: &OAuthLink) -> bool {
        let key = (link.provider.clone(), link.provider_user_id.clone());
        match self.links.get(&key) {
            Some((owner, _)) if *owner != user_id => false,
            _ => {
                self.links.insert(key, (user_id, link.clone()));
                true
            }
        }
    }
}

#[async_trait]
impl IdentityStore for MemoryIdentityStore {
    async fn tenant_status(&self, tenant_id: Uuid) -> Result<Option<String>> {
        Ok(self
            .state
            .lock()
            .await
            .tenants
            .get(&tenant_id)
            .map(|tenant| tenant.status.clone()))
    }

    async fn create_account(&self, account: NewAccount) -> Result<CreateOutcome> {
        let mut state = self.state.lock().await;
        let user = account.user;

        for identifier in [user.email.as_deref(), user.phone.as_deref()].into_iter().flatten() {
            if self.directory.find_login(identifier).await?.is_some() {
                return Ok(CreateOutcome::Duplicate);
            }
        }
        if let Some(link) = &account.link {
            let key = (link.provider.clone(), link.provider_user_id.clone());
            if state.links.contains_key(&key) {
                return Ok(CreateOutcome::Duplicate);
            }
        }

        if let Some(tenant) = account.tenant {
            state.tenants.insert(
                tenant.id,
                MemoryTenant {
                    name: tenant.name,
                    slug: tenant.slug,
                    status: TENANT_ACTIVE.to_string(),
                    plan: "free".to_string(),
                    country: tenant.country,
                },
            );
        }
        if let Some(link) = &account.link {
            state.upsert_link(user.id, link);
        }
        state.extras.insert(
            user.id,
            MemoryExtras {
                auth_provider: user.auth_provider.clone(),
                email_verified: user.email_verified,
            },
        );

        let principal = PrincipalRecord {
            id: user.id,
            tenant_id: Some(user.tenant_id),
            email: user.email,
            phone: user.phone,
            first_name: user.first_name,
            last_name: user.last_name,
            role: user.role,
        };
        self.directory
            .insert(LoginRecord {
                principal: principal.clone(),
                status: "active".to_string(),
                password_hash: user.password_hash,
            })
            .await;
        Ok(CreateOutcome::Created(principal))
    }

    async fn find_by_link(
        &self,
        provider: &str,
        provider_user_id: &str,
    ) -> Result<Option<PrincipalRecord>> {
        let owner = self
            .state
            .lock()
            .await
            .links
            .get(&(provider.to_string(), provider_user_id.to_string()))
            .map(|(owner, _)| *owner);
        match owner {
            Some(id) => self.directory.find_active(id).await,
            None => Ok(None),
        }
    }

    async fn upsert_link(&self, user_id: Uuid, link: &OAuthLink) -> Result<bool> {
        Ok(self.state.lock().await.upsert_link(user_id, link))
    }

    async fn auth_provider(&self, identifier: &str) -> Result<Option<String>> {
        let Some(principal) = self.directory.find_active_by_identifier(identifier).await? else {
            return Ok(None);
        };
        let provider = self
            .state
            .lock()
            .await
            .extras
            .get(&principal.id)
            .map(|extras| extras.auth_provider.clone());
        Ok(Some(provider.unwrap_or_else(|| {
            if principal.email.is_some() { "email" } else { "phone" }.to_string()
        })))
    }

    async fn profile(&self, user_id: Uuid) -> Result<Option<UserProfile>> {
        let Some(record) = self.directory.get(user_id).await else {
            return Ok(None);
        };
        let extras = self
            .state
            .lock()
            .await
            .extras
            .get(&user_id)
            .cloned()
            .unwrap_or_default();
        Ok(Some(UserProfile {
            has_password: record.password_hash.as_deref().is_some_and(|hash| !hash.is_empty()),
            status: record.status,
            email_verified: extras.email_verified,
            phone_verified: self.directory.phone_verified(user_id).await,
            principal: record.principal,
        }))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn new_user(tenant_id: Uuid, email: Option<&str>, phone: Option<&str>) -> NewUser {
        NewUser {
            id: Uuid::new_v4(),
            tenant_id,
            email: email.map(ToString::to_string),
            phone: phone.map(ToString::to_string),
            password_hash: None,
            first_name: "Amy".to_string(),
            last_name: "Pond".to_string(),
            role: "tenant_owner".to_string(),
            auth_provider: "email".to_string(),
            email_verified: email.is_some(),
        }
    }

    fn google_link(subject: &str) -> OAuthLink {
        OAuthLink {
            provider: "google".to_string(),
            provider_user_id: subject.to_string(),
            ..OAuthLink::default()
        }
    }

    #[tokio::test]
    async fn duplicate_identifier_creates_nothing() -> Result<()> {
        let directory = Arc::new(MemoryDirectory::new());
        let store = MemoryIdentityStore::new(directory.clone());
        let tenant_id = Uuid::new_v4();
        store.insert_tenant(tenant_id, "Pond Bakery", "active").await;

        let first = store
            .create_account(NewAccount {
                tenant: None,
                user: new_user(tenant_id, Some("amy@example.com"), None),
                link: None,
            })
            .await?;
        assert!(matches!(first, CreateOutcome::Created(_)));

        let provisioned = NewTenant {
            id: Uuid::new_v4(),
            name: "Other".to_string(),
            slug: "other-abcdefgh".to_string(),
            country: "SA".to_string(),
            country_id: None,
            region_id: None,
            city_id: None,
        };
        let second = store
            .create_account(NewAccount {
                tenant: Some(provisioned.clone()),
                user: new_user(provisioned.id, Some("amy@example.com"), None),
                link: None,
            })
            .await?;
        assert_eq!(second, CreateOutcome::Duplicate);
        assert!(store.tenant(provisioned.id).await.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn links_never_move_between_users() -> Result<()> {
        let store = MemoryIdentityStore::new(Arc::new(MemoryDirectory::new()));
        let owner = Uuid::new_v4();

        assert!(store.upsert_link(owner, &google_link("1089")).await?);
        assert!(store.upsert_link(owner, &google_link("1089")).await?);
        assert!(!store.upsert_link(Uuid::new_v4(), &google_link("1089")).await?);
        assert_eq!(store.link_of("google", "1089").await.map(|(id, _)| id), Some(owner));
        Ok(())
    }

    #[tokio::test]
    async fn profile_reports_verification_and_password() -> Result<()> {
        let directory = Arc::new(MemoryDirectory::new());
        let store = MemoryIdentityStore::new(directory.clone());
        let tenant_id = Uuid::new_v4();
        store.insert_tenant(tenant_id, "Pond Bakery", "active").await;
        let mut user = new_user(tenant_id, None, Some("+966500000001"));
        user.auth_provider = "phone".to_string();
        let id = user.id;
        store
            .create_account(NewAccount {
                tenant: None,
                user,
                link: None,
            })
            .await?;

        let profile = store.profile(id).await?.unwrap();
        assert!(!profile.email_verified);
        assert!(!profile.phone_verified);
        assert!(!profile.has_password);

        directory.mark_phone_verified(id).await?;
        assert!(store.profile(id).await?.unwrap().phone_verified);
        assert_eq!(
            store.auth_provider("+966500000001").await?.as_deref(),
            Some("phone")
        );
        Ok(())
    }
}
