//! Passkey persistence.
//!
//! Stores keep the serialized [`Passkey`] as JSON, exactly as the
//! `webauthn_credentials.passkey` column does; decoding into
//! [`StoredPasskey`] happens on the way out.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_cbor_2::Value as Cbor;
use sqlx::{PgPool, Row};
use tokio::sync::Mutex;
use tracing::{Instrument, warn};
use uuid::Uuid;
use webauthn_rs::prelude::{Passkey, RegisterPublicKeyCredential};

pub const DEFAULT_FRIENDLY_NAME: &str = "Passkey";
const ATTESTATION_NONE: &str = "none";
// rpIdHash (32) + flags (1) + signCount (4)
const AUTH_DATA_AAGUID_OFFSET: usize = 37;
const FLAG_ATTESTED_CREDENTIAL: u8 = 0x40;

/// A credential row as stored.
#[derive(Clone, Debug, PartialEq)]
pub struct PasskeyRecord {
    pub credential_id: Vec<u8>,
    pub sign_count: i64,
    pub passkey: serde_json::Value,
}

/// A registered credential as loaded for verification.
#[derive(Clone, Debug)]
pub struct StoredPasskey {
    pub credential_id: Vec<u8>,
    pub sign_count: i64,
    pub passkey: Passkey,
}

impl StoredPasskey {
    /// Decode `records`, skipping rows whose passkey no longer deserializes.
    #[must_use]
    pub fn decode_all(user_id: Uuid, records: Vec<PasskeyRecord>) -> Vec<Self> {
        records
            .into_iter()
            .filter_map(|record| {
                match serde_json::from_value::<Passkey>(record.passkey) {
                    Ok(passkey) => Some(Self {
                        credential_id: record.credential_id,
                        sign_count: record.sign_count,
                        passkey,
                    }),
                    Err(err) => {
                        warn!(%user_id, "skipping unreadable passkey: {err}");
                        None
                    }
                }
            })
            .collect()
    }
}

/// What the authenticator said about itself at registration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthenticatorDetails {
    /// Attestation statement format (`none`, `packed`, `tpm`, ...).
    pub attestation_type: String,
    /// `None` when absent or all zeros.
    pub aaguid: Option<Uuid>,
}

impl Default for AuthenticatorDetails {
    fn default() -> Self {
        Self {
            attestation_type: ATTESTATION_NONE.to_string(),
            aaguid: None,
        }
    }
}

/// Read the format and AAGUID out of a CBOR attestation object. An object that
/// does not parse yields the defaults; it has already passed verification.
#[must_use]
pub fn authenticator_details(attestation_object: &[u8]) -> AuthenticatorDetails {
    let Ok(Cbor::Map(entries)) = serde_cbor_2::from_slice::<Cbor>(attestation_object) else {
        return AuthenticatorDetails::default();
    };

    let mut details = AuthenticatorDetails::default();
    for (key, value) in entries {
        match (key, value) {
            (Cbor::Text(key), Cbor::Text(fmt)) if key == "fmt" && !fmt.is_empty() => {
                details.attestation_type = fmt;
            }
            (Cbor::Text(key), Cbor::Bytes(auth_data)) if key == "authData" => {
                details.aaguid = aaguid_from_auth_data(&auth_data);
            }
            _ => {}
        }
    }
    details
}

fn aaguid_from_auth_data(auth_data: &[u8]) -> Option<Uuid> {
    let flags = *auth_data.get(AUTH_DATA_AAGUID_OFFSET - 5)?;
    if flags & FLAG_ATTESTED_CREDENTIAL == 0 {
        return None;
    }
    let bytes = auth_data.get(AUTH_DATA_AAGUID_OFFSET..AUTH_DATA_AAGUID_OFFSET + 16)?;
    let aaguid = Uuid::from_slice(bytes).ok()?;
    (!aaguid.is_nil()).then_some(aaguid)
}

/// A freshly verified registration, ready to insert.
#[derive(Clone, Debug, PartialEq)]
pub struct NewPasskey {
    pub user_id: Uuid,
    pub credential_id: Vec<u8>,
    pub public_key: Vec<u8>,
    pub passkey: serde_json::Value,
    pub transports: serde_json::Value,
    pub details: AuthenticatorDetails,
}

impl NewPasskey {
    /// # Errors
    /// Returns error if the passkey or its transports cannot be serialized.
    pub fn from_registration(
        user_id: Uuid,
        passkey: &Passkey,
        credential: &RegisterPublicKeyCredential,
    ) -> Result<Self> {
        Ok(Self {
            user_id,
            credential_id: passkey.cred_id().as_slice().to_vec(),
            public_key: serde_json::to_vec(passkey.get_public_key())
                .context("Failed to serialize public key")?,
            passkey: serde_json::to_value(passkey).context("Failed to serialize passkey")?,
            transports: serde_json::to_value(&credential.response.transports)
                .context("Failed to serialize passkey transports")?,
            details: authenticator_details(credential.response.attestation_object.as_slice()),
        })
    }
}

#[async_trait]
pub trait PasskeyStore: Send + Sync {
    /// Every passkey registered by `user_id`, oldest first.
    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<PasskeyRecord>>;

    async fn insert(&self, passkey: NewPasskey) -> Result<()>;

    /// Store the advanced counter and credential state, provided the stored
    /// counter still equals `previous_count`. Returns `false` when another
    /// login moved it first.
    async fn record_use(
        &self,
        credential_id: &[u8],
        previous_count: i64,
        sign_count: i64,
        passkey: serde_json::Value,
    ) -> Result<bool>;
}

#[derive(Clone, Debug)]
pub struct PgPasskeyStore {
    pool: PgPool,
}

impl PgPasskeyStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PasskeyStore for PgPasskeyStore {
    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<PasskeyRecord>> {
        let query = r"
            SELECT credential_id, sign_count, passkey FROM webauthn_credentials
            WHERE user_id = $1
            ORDER BY created_at
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let rows = sqlx::query(query)
            .bind(user_id)
            .fetch_all(&self.pool)
            .instrument(span)
            .await
            .context("Failed to list passkeys")?;

        Ok(rows
            .into_iter()
            .map(|row| PasskeyRecord {
                credential_id: row.get("credential_id"),
                sign_count: row.get("sign_count"),
                passkey: row.get("passkey"),
            })
            .collect())
    }

    async fn insert(&self, passkey: NewPasskey) -> Result<()> {
        let query = r"
            INSERT INTO webauthn_credentials
                (user_id, credential_id, public_key, attestation_type, aaguid, sign_count,
                 transports, friendly_name, passkey)
            VALUES ($1, $2, $3, $4, $5, 0, $6, $7, $8)
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        sqlx::query(query)
            .bind(passkey.user_id)
            .bind(&passkey.credential_id)
            .bind(&passkey.public_key)
            .bind(&passkey.details.attestation_type)
            .bind(passkey.details.aaguid.map(|aaguid| aaguid.as_bytes().to_vec()))
            .bind(&passkey.transports)
            .bind(DEFAULT_FRIENDLY_NAME)
            .bind(&passkey.passkey)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("Failed to insert passkey")?;
        Ok(())
    }

    async fn record_use(
        &self,
        credential_id: &[u8],
        previous_count: i64,
        sign_count: i64,
        passkey: serde_json::Value,
    ) -> Result<bool> {
        let query = r"
            UPDATE webauthn_credentials
            SET sign_count = $1, passkey = $2, last_used_at = NOW()
            WHERE credential_id = $3 AND sign_count = $4
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(sign_count)
            .bind(passkey)
            .bind(credential_id)
            .bind(previous_count)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("Failed to update passkey usage")?;
        Ok(result.rows_affected() == 1)
    }
}

/// In-process store for tests.
#[derive(Debug, Default)]
pub struct MemoryPasskeyStore {
    rows: Mutex<Vec<NewPasskey>>,
    counters: Mutex<Vec<(Vec<u8>, i64)>>,
}

impl MemoryPasskeyStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows as inserted, for inspection.
    pub async fn rows(&self) -> Vec<NewPasskey> {
        self.rows.lock().await.clone()
    }

    async fn counter_of(&self, credential_id: &[u8]) -> i64 {
        self.counters
            .lock()
            .await
            .iter()
            .find(|(id, _)| id.as_slice() == credential_id)
            .map_or(0, |(_, count)| *count)
    }
}

#[async_trait]
impl PasskeyStore for MemoryPasskeyStore {
    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<PasskeyRecord>> {
        let rows: Vec<NewPasskey> = self
            .rows
            .lock()
            .await
            .iter()
            .filter(|row| row.user_id == user_id)
            .cloned()
            .collect();
        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            records.push(PasskeyRecord {
                sign_count: self.counter_of(&row.credential_id).await,
                credential_id: row.credential_id,
                passkey: row.passkey,
            });
        }
        Ok(records)
    }

    async fn insert(&self, passkey: NewPasskey) -> Result<()> {
        let mut rows = self.rows.lock().await;
        if rows.iter().any(|row| row.credential_id == passkey.credential_id) {
            anyhow::bail!("duplicate credential id");
        }
        rows.push(passkey);
        Ok(())
    }

    async fn record_use(
        &self,
        credential_id: &[u8],
        previous_count: i64,
        sign_count: i64,
        passkey: serde_json::Value,
    ) -> Result<bool> {
        let mut rows = self.rows.lock().await;
        let Some(row) = rows.iter_mut().find(|row| row.credential_id == credential_id) else {
            return Ok(false);
        };
        let mut counters = self.counters.lock().await;
        let current = counters
            .iter()
            .find(|(id, _)| id.as_slice() == credential_id)
            .map_or(0, |(_, count)| *count);
        if current != previous_count {
            return Ok(false);
        }
        counters.retain(|(id, _)| id.as_slice() != credential_id);
        counters.push((credential_id.to_vec(), sign_count));
        row.passkey = passkey;
        Ok(true)
    }
}
