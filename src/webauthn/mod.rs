//! Passkey (`WebAuthn`) ceremonies.
//!
//! Flow Overview:
//! 1) Registration requires an authenticated customer. `begin` excludes the
//!    user's existing credentials and parks the ceremony under the user id.
//! 2) Registration `finish` takes the parked state, verifies the attestation
//!    and hands back a [`Passkey`](webauthn_rs::prelude::Passkey) to persist.
//! 3) Discoverable login `begin` parks the ceremony under a fresh session key
//!    returned to the client.
//! 4) Login `finish` resolves the user from the assertion's user handle,
//!    verifies it against that user's stored passkeys and checks the counter.
//!    The store then records the new counter only if no other login moved it.
//!
//! Origin and RP ID validation is enforced by `webauthn-rs`. Ceremony state
//! lives only in memory; a restart invalidates every in-flight ceremony.

mod ceremony;
mod service;
mod store;

pub use ceremony::{CEREMONY_TTL, CeremonyStore};
pub use service::{
    PasskeyConfig, PasskeyLogin, PasskeyService, PendingLogin, VerifiedPasskey, counter_advanced,
};
pub use store::{
    AuthenticatorDetails, MemoryPasskeyStore, NewPasskey, PasskeyRecord, PasskeyStore,
    PgPasskeyStore, StoredPasskey, authenticator_details,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CeremonyError {
    /// Missing or expired ceremony state; the client must start again.
    #[error("no ceremony found")]
    NoSessionFound,
    #[error("passkey authentication failed")]
    AuthenticationFailed,
    #[error("passkey registration failed")]
    RegistrationFailed,
    #[error("webauthn setup failed")]
    Setup(#[source] webauthn_rs::prelude::WebauthnError),
    #[error("storage failure")]
    Storage(#[source] anyhow::Error),
}
