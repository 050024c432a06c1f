//! Authentication realms.
//!
//! The customer and admin realms share every mechanism (token codec, session
//! store, principal directory, bearer middleware) but never share state: each
//! has its own issuer string, principal table and session table. A token
//! minted for one realm is rejected by the other even when both are signed
//! with the same secret, because the issuer is part of every verification.

mod directory;
mod service;

pub use directory::{
    LoginRecord, MemoryDirectory, PgDirectory, PrincipalDirectory, PrincipalRecord,
};
pub use service::{AuthContext, AuthError, IssuedSession, RealmAuth, SessionMeta};

use std::fmt;

pub const CUSTOMER_ISSUER: &str = "berhot-identity";
pub const ADMIN_ISSUER: &str = "berhot-admin";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Realm {
    Customer,
    Admin,
}

impl Realm {
    #[must_use]
    pub const fn issuer(self) -> &'static str {
        match self {
            Self::Customer => CUSTOMER_ISSUER,
            Self::Admin => ADMIN_ISSUER,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Customer => "customer",
            Self::Admin => "admin",
        }
    }
}

impl fmt::Display for Realm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
