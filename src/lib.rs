//! # Identity and access (Berhot authentication core)
//!
//! Authentication for a multi-tenant platform with two isolated realms:
//!
//! - **Customer realm:** tenant members who sign in with a password, a one-time
//!   code sent by SMS or email, Google, or a discoverable passkey. First contact
//!   through any method can auto-provision a tenant and an owner account.
//! - **Admin realm:** platform staff. The first account bootstraps as
//!   `super_admin`; afterwards admins are only created by invitation.
//!
//! Each realm stamps and checks its own issuer and keeps its own session
//! table, so a token minted in one realm never authenticates in the other.
//! Every access token names a live session row; revoking the row revokes the
//! token immediately, regardless of its remaining lifetime.
//!
//! Other services introspect tokens through `/internal/validate-token`.

pub mod api;
pub mod cli;
pub mod credential;
pub mod identity;
pub mod oauth;
pub mod otp;
pub mod realm;
pub mod session;
pub mod token;
pub mod webauthn;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
