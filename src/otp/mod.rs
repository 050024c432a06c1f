//! One-time passcodes for passwordless login.
//!
//! Flow Overview:
//! 1) `send` stores a bcrypt hash of a fresh 6-digit code, atomically with the
//!    per-identifier window check, and hands the plaintext to an [`OtpSender`].
//! 2) `verify` takes the newest live challenge, refuses it once the attempt
//!    bound is reached, burns one attempt, then compares the code.
//! 3) A matching code marks the challenge verified; it can never match again.

mod sender;
mod store;

pub use sender::{ConsoleSender, MultiSender, OtpSender, SmtpSender};
pub use store::{Challenge, MemoryOtpStore, NewChallenge, OtpStore, PgOtpStore};

use rand::{Rng, rngs::OsRng};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::credential::{self, CredentialError, CredentialVerifier};

pub const PURPOSE_LOGIN: &str = "login";

#[derive(Debug, Error)]
pub enum OtpError {
    #[error("too many codes requested for this identifier")]
    RateLimited,
    #[error("no active code for this identifier")]
    NoChallenge,
    #[error("too many attempts")]
    TooManyAttempts,
    #[error("invalid code")]
    InvalidCode { remaining_attempts: i32 },
    #[error("code delivery failed")]
    Delivery(#[source] anyhow::Error),
    #[error("code hashing failed")]
    Hash(#[from] CredentialError),
    #[error("storage failure")]
    Storage(#[source] anyhow::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OtpPolicy {
    pub code_ttl_seconds: i64,
    pub max_attempts: i32,
    pub send_limit: i64,
    pub send_window_seconds: i64,
}

impl Default for OtpPolicy {
    fn default() -> Self {
        Self {
            code_ttl_seconds: 5 * 60,
            max_attempts: 5,
            send_limit: 3,
            send_window_seconds: 10 * 60,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SentChallenge {
    pub destination: String,
    pub expires_in: i64,
}

pub struct OtpEngine {
    store: Arc<dyn OtpStore>,
    sender: Arc<dyn OtpSender>,
    policy: OtpPolicy,
}

impl OtpEngine {
    #[must_use]
    pub fn new(store: Arc<dyn OtpStore>, sender: Arc<dyn OtpSender>) -> Self {
        Self {
            store,
            sender,
            policy: OtpPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_policy(mut self, policy: OtpPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn policy(&self) -> OtpPolicy {
        self.policy
    }

    /// Issue and deliver a new code for `identifier`.
    ///
    /// # Errors
    /// [`OtpError::RateLimited`] when the window is exhausted; storage, hashing
    /// or delivery failures otherwise.
    pub async fn send(&self, identifier: &str) -> Result<SentChallenge, OtpError> {
        let code = generate_code();
        let code_hash = credential::hash_throwaway(&code).await?;

        let stored = self
            .store
            .insert_within_limit(NewChallenge {
                identifier,
                code_hash: &code_hash,
                purpose: PURPOSE_LOGIN,
                ttl_seconds: self.policy.code_ttl_seconds,
                max_attempts: self.policy.max_attempts,
                send_limit: self.policy.send_limit,
                window_seconds: self.policy.send_window_seconds,
            })
            .await
            .map_err(OtpError::Storage)?;
        if stored.is_none() {
            info!(destination = %mask_destination(identifier), "otp send rate limited");
            return Err(OtpError::RateLimited);
        }

        self.sender
            .send(identifier, &code)
            .await
            .map_err(OtpError::Delivery)?;

        let destination = mask_destination(identifier);
        debug!(%destination, "otp issued");

        Ok(SentChallenge {
            destination,
            expires_in: self.policy.code_ttl_seconds,
        })
    }

    /// Check `code` against the newest live challenge for `identifier`.
    ///
    /// # Errors
    /// [`OtpError::NoChallenge`], [`OtpError::TooManyAttempts`] or
    /// [`OtpError::InvalidCode`] for refused codes.
    pub async fn verify(&self, identifier: &str, code: &str) -> Result<(), OtpError> {
        let challenge = self
            .store
            .latest_active(identifier, PURPOSE_LOGIN)
            .await
            .map_err(OtpError::Storage)?
            .ok_or(OtpError::NoChallenge)?;

        if challenge.attempts >= challenge.max_attempts {
            return Err(OtpError::TooManyAttempts);
        }

        // The increment is bounded in storage, so concurrent guesses cannot overrun it.
        let attempts = self
            .store
            .increment_attempts(challenge.id)
            .await
            .map_err(OtpError::Storage)?
            .ok_or(OtpError::TooManyAttempts)?;

        let matched = CredentialVerifier::default()
            .verify(code.trim(), &challenge.code_hash)
            .await?;
        if !matched {
            return Err(OtpError::InvalidCode {
                remaining_attempts: (challenge.max_attempts - attempts).max(0),
            });
        }

        // A concurrent verify may have consumed it first.
        if !self
            .store
            .mark_verified(challenge.id)
            .await
            .map_err(OtpError::Storage)?
        {
            return Err(OtpError::NoChallenge);
        }

        Ok(())
    }
}

/// Uniform 6-digit code from the OS RNG.
#[must_use]
pub fn generate_code() -> String {
    let value: u32 = OsRng.gen_range(0..1_000_000);
    format!("{value:06}")
}

/// Display form of a destination: `am***@example.com` or `****1234`.
#[must_use]
pub fn mask_destination(identifier: &str) -> String {
    if let Some((local, domain)) = identifier.split_once('@') {
        let visible: String = local.chars().take(2).collect();
        return format!("{visible}***@{domain}");
    }
    let digits: Vec<char> = identifier.chars().collect();
    let tail: String = digits[digits.len().saturating_sub(4)..].iter().collect();
    format!("****{tail}")
}
