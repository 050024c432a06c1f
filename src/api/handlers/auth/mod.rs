//! Customer realm handlers and the shared auth state.
//!
//! ## Sign-in methods
//!
//! Password, one-time code, Google OAuth and passkeys all end the same way:
//! a new row in `sessions` and an access/refresh pair whose `sid` claim
//! points at it. Refresh and the bearer middleware both check that row, so
//! logout takes effect immediately for every token of the session.
//!
//! ## Enumeration resistance
//!
//! Login failures share one message whether the account is unknown, inactive,
//! passwordless or the password is wrong.

pub(crate) mod login;
pub(crate) mod middleware;
pub(crate) mod oauth;
pub(crate) mod otp;
pub(crate) mod passkeys;
pub(crate) mod register;
mod state;
pub(crate) mod types;
pub(crate) mod utils;

pub use middleware::{require_admin, require_customer, require_realm};
pub use state::{AuthConfig, AuthState, Passkeys, SmtpConfig, Stores};
