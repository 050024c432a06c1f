//! Password hashing with bcrypt.
//!
//! Hashing and comparison are CPU bound, so both run on the blocking pool.

use thiserror::Error;

pub const DEFAULT_COST: u32 = 12;
// bcrypt 0.15 keeps its cost bounds private; these mirror its `MIN_COST`/`MAX_COST`.
const BCRYPT_MIN_COST: u32 = 4;
const BCRYPT_MAX_COST: u32 = 31;
/// Work factor reserved for server-generated throwaway secrets such as OTP codes.
pub const THROWAWAY_COST: u32 = BCRYPT_MIN_COST;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("bcrypt failure")]
    Hash(#[from] bcrypt::BcryptError),
    #[error("hashing task failed")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Clone, Copy, Debug)]
pub struct CredentialVerifier {
    cost: u32,
}

impl Default for CredentialVerifier {
    fn default() -> Self {
        Self::new(DEFAULT_COST)
    }
}

impl CredentialVerifier {
    #[must_use]
    pub fn new(cost: u32) -> Self {
        Self {
            cost: cost.clamp(BCRYPT_MIN_COST, BCRYPT_MAX_COST),
        }
    }

    #[must_use]
    pub fn cost(&self) -> u32 {
        self.cost
    }

    /// Hash a user-chosen password at the configured cost.
    ///
    /// # Errors
    /// Returns an error if bcrypt fails or the blocking task panics.
    pub async fn hash(&self, password: &str) -> Result<String, CredentialError> {
        hash_with_cost(password, self.cost).await
    }

    /// Compare `password` against a stored hash. A malformed hash compares as `false`.
    ///
    /// # Errors
    /// Returns an error only if the blocking task cannot complete.
    pub async fn verify(&self, password: &str, hash: &str) -> Result<bool, CredentialError> {
        let password = password.to_string();
        let hash = hash.to_string();
        let matched =
            tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash).unwrap_or(false))
                .await?;
        Ok(matched)
    }
}

/// Hash a server-generated secret at the minimum cost.
///
/// # Errors
/// Returns an error if bcrypt fails or the blocking task panics.
pub async fn hash_throwaway(secret: &str) -> Result<String, CredentialError> {
    hash_with_cost(secret, THROWAWAY_COST).await
}

async fn hash_with_cost(secret: &str, cost: u32) -> Result<String, CredentialError> {
    let secret = secret.to_string();
    let hashed = tokio::task::spawn_blocking(move || bcrypt::hash(secret, cost)).await??;
    Ok(hashed)
}
