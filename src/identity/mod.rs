//! Identity resolution and tenant provisioning for the customer realm.
//!
//! Flow Overview:
//! 1) Classify the login identifier into an email or a phone number.
//! 2) Without a `tenant_id`, provision a fresh `free` tenant named after the
//!    business (or the first name) and make the new user its `tenant_owner`.
//! 3) With a `tenant_id`, the tenant must exist and be `active`.
//! 4) Google sign-in resolves a principal by link first, then by verified email.

pub mod admin;
mod classify;
mod storage;

pub use classify::{
    Identifier, business_name, classify, clean_phone, is_email, is_phone, normalize_email,
    slugify, unique_slug,
};
pub use storage::{
    CreateOutcome, IdentityStore, MemoryIdentityStore, MemoryTenant, NewAccount, NewTenant,
    NewUser, OAuthLink, PgIdentityStore, TENANT_ACTIVE, UserProfile,
};

use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::credential::{CredentialError, CredentialVerifier};
use crate::oauth::{GoogleProfile, PROVIDER_GOOGLE, ProviderTokens};
use crate::otp::mask_destination;
use crate::realm::{PrincipalDirectory, PrincipalRecord};

pub const ROLE_TENANT_OWNER: &str = "tenant_owner";
pub const MIN_PASSWORD_LEN: usize = 8;
pub const DEFAULT_COUNTRY: &str = "SA";

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Email or phone is required")]
    MissingIdentifier,
    #[error("Invalid email or phone number")]
    InvalidIdentifier,
    #[error("Password must be at least 8 characters")]
    WeakPassword,
    #[error("Tenant not found")]
    TenantNotFound,
    #[error("Tenant is not active")]
    TenantInactive,
    #[error("Account already exists")]
    AlreadyExists,
    #[error("password hashing failed")]
    Hash(#[from] CredentialError),
    #[error("storage failure")]
    Storage(#[source] anyhow::Error),
}

/// Self-registration input.
#[derive(Clone, Debug, Default)]
pub struct Registration {
    /// Email or phone, classified on arrival; wins over `email`/`phone`.
    pub identifier: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub password: Option<String>,
    pub first_name: String,
    pub last_name: String,
    pub business_name: Option<String>,
    pub tenant_id: Option<Uuid>,
    pub google_id: Option<String>,
    pub country: Option<String>,
    pub country_id: Option<String>,
    pub region_id: Option<String>,
    pub city_id: Option<String>,
}

/// Result of a check-user lookup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UserLookup {
    Unknown,
    Known {
        method: LoginMethod,
        destination: Option<String>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoginMethod {
    Password,
    Otp,
}

impl LoginMethod {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Password => "password",
            Self::Otp => "otp",
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Resolve `(email, phone)` from the explicit fields and the free-form identifier.
///
/// # Errors
/// [`IdentityError::InvalidIdentifier`] for malformed values,
/// [`IdentityError::MissingIdentifier`] when neither resolves.
pub fn resolve_contact(
    registration: &Registration,
) -> Result<(Option<String>, Option<String>), IdentityError> {
    let mut email = match non_empty(registration.email.as_deref()) {
        Some(raw) if is_email(raw) => Some(normalize_email(raw)),
        Some(_) => return Err(IdentityError::InvalidIdentifier),
        None => None,
    };
    let mut phone = match non_empty(registration.phone.as_deref()) {
        Some(raw) if is_phone(raw) => Some(clean_phone(raw)),
        Some(_) => return Err(IdentityError::InvalidIdentifier),
        None => None,
    };

    if let Some(raw) = non_empty(registration.identifier.as_deref()) {
        match classify(raw).ok_or(IdentityError::InvalidIdentifier)? {
            Identifier::Email(value) => email = Some(value),
            Identifier::Phone(value) => phone = Some(value),
        }
    }

    if email.is_none() && phone.is_none() {
        return Err(IdentityError::MissingIdentifier);
    }
    Ok((email, phone))
}

/// The tenant created for a registration that names none.
#[must_use]
pub fn provision_tenant(registration: &Registration, default_country: &str) -> NewTenant {
    let name = business_name(registration.business_name.as_deref(), &registration.first_name);
    NewTenant {
        id: Uuid::new_v4(),
        slug: unique_slug(&name),
        name,
        country: non_empty(registration.country.as_deref())
            .unwrap_or(default_country)
            .to_uppercase(),
        country_id: non_empty(registration.country_id.as_deref()).map(ToString::to_string),
        region_id: non_empty(registration.region_id.as_deref()).map(ToString::to_string),
        city_id: non_empty(registration.city_id.as_deref()).map(ToString::to_string),
    }
}

pub struct Provisioner {
    store: Arc<dyn IdentityStore>,
    directory: Arc<dyn PrincipalDirectory>,
    verifier: CredentialVerifier,
    default_country: String,
}

impl Provisioner {
    #[must_use]
    pub fn new(
        store: Arc<dyn IdentityStore>,
        directory: Arc<dyn PrincipalDirectory>,
        verifier: CredentialVerifier,
    ) -> Self {
        Self {
            store,
            directory,
            verifier,
            default_country: DEFAULT_COUNTRY.to_string(),
        }
    }

    #[must_use]
    pub fn with_default_country(mut self, country: String) -> Self {
        self.default_country = country;
        self
    }

    #[must_use]
    pub fn store(&self) -> &dyn IdentityStore {
        self.store.as_ref()
    }

    /// Create a customer principal, provisioning a tenant when none is named.
    ///
    /// # Errors
    /// Validation, tenant and duplicate failures as [`IdentityError`] variants;
    /// [`IdentityError::Storage`] when persistence fails.
    pub async fn register(&self, registration: Registration) -> Result<PrincipalRecord, IdentityError> {
        let (email, phone) = resolve_contact(&registration)?;

        let password = registration.password.as_deref().filter(|p| !p.is_empty());
        if password.is_some_and(|p| p.chars().count() < MIN_PASSWORD_LEN) {
            return Err(IdentityError::WeakPassword);
        }

        let (tenant, tenant_id) = match registration.tenant_id {
            Some(tenant_id) => {
                let status = self
                    .store
                    .tenant_status(tenant_id)
                    .await
                    .map_err(IdentityError::Storage)?
                    .ok_or(IdentityError::TenantNotFound)?;
                if status != TENANT_ACTIVE {
                    return Err(IdentityError::TenantInactive);
                }
                (None, tenant_id)
            }
            None => {
                let tenant = provision_tenant(&registration, &self.default_country);
                let id = tenant.id;
                (Some(tenant), id)
            }
        };

        let password_hash = match password {
            Some(password) => Some(self.verifier.hash(password).await?),
            None => None,
        };

        let google_id = non_empty(registration.google_id.as_deref()).map(ToString::to_string);
        let auth_provider = if google_id.is_some() {
            PROVIDER_GOOGLE
        } else if email.is_none() {
            "phone"
        } else {
            "email"
        };
        let link = google_id.map(|provider_user_id| OAuthLink {
            provider: PROVIDER_GOOGLE.to_string(),
            provider_user_id,
            provider_email: email.clone(),
            ..OAuthLink::default()
        });

        let user = NewUser {
            id: Uuid::new_v4(),
            tenant_id,
            email_verified: email.is_some(),
            email,
            phone,
            password_hash,
            first_name: registration.first_name.trim().to_string(),
            last_name: registration.last_name.trim().to_string(),
            role: ROLE_TENANT_OWNER.to_string(),
            auth_provider: auth_provider.to_string(),
        };
        let provisioned = tenant.as_ref().map(|t| t.id);

        match self
            .store
            .create_account(NewAccount { tenant, user, link })
            .await
            .map_err(IdentityError::Storage)?
        {
            CreateOutcome::Created(principal) => {
                info!(user_id = %principal.id, %tenant_id, provisioned = provisioned.is_some(), "customer registered");
                Ok(principal)
            }
            CreateOutcome::Duplicate => Err(IdentityError::AlreadyExists),
        }
    }

    /// Existing principal for a Google profile, linking the identity when it
    /// matches a verified email. `None` means the caller should start registration.
    ///
    /// # Errors
    /// [`IdentityError::Storage`] when a lookup or link write fails.
    pub async fn resolve_google(
        &self,
        profile: &GoogleProfile,
        tokens: &ProviderTokens,
        raw_profile: serde_json::Value,
    ) -> Result<Option<PrincipalRecord>, IdentityError> {
        let link = OAuthLink {
            provider: PROVIDER_GOOGLE.to_string(),
            provider_user_id: profile.id.clone(),
            provider_email: non_empty(Some(profile.email.as_str())).map(normalize_email),
            access_token: Some(tokens.access_token.clone()),
            refresh_token: tokens.refresh_token.clone(),
            expires_in: tokens.expires_in,
            raw_profile: Some(raw_profile),
        };

        if let Some(principal) = self
            .store
            .find_by_link(PROVIDER_GOOGLE, &profile.id)
            .await
            .map_err(IdentityError::Storage)?
        {
            self.store
                .upsert_link(principal.id, &link)
                .await
                .map_err(IdentityError::Storage)?;
            return Ok(Some(principal));
        }

        let Some(email) = link.provider_email.as_deref().filter(|_| profile.verified_email) else {
            return Ok(None);
        };
        let Some(principal) = self
            .directory
            .find_active_by_identifier(email)
            .await
            .map_err(IdentityError::Storage)?
        else {
            return Ok(None);
        };

        if self
            .store
            .upsert_link(principal.id, &link)
            .await
            .map_err(IdentityError::Storage)?
        {
            debug!(user_id = %principal.id, "google identity linked by verified email");
            Ok(Some(principal))
        } else {
            Ok(None)
        }
    }

    /// Whether an active account holds `identifier`, and how it signs in.
    ///
    /// # Errors
    /// [`IdentityError::Storage`] when the lookup fails.
    pub async fn check_user(&self, identifier: &str) -> Result<UserLookup, IdentityError> {
        let Some(identifier) = classify(identifier) else {
            return Ok(UserLookup::Unknown);
        };
        let Some(provider) = self
            .store
            .auth_provider(identifier.as_str())
            .await
            .map_err(IdentityError::Storage)?
        else {
            return Ok(UserLookup::Unknown);
        };

        let method = if identifier.is_phone() || provider == "phone" {
            LoginMethod::Otp
        } else {
            LoginMethod::Password
        };
        let destination = (method == LoginMethod::Otp && identifier.is_phone())
            .then(|| mask_destination(identifier.as_str()));
        Ok(UserLookup::Known { method, destination })
    }
}
