//! Auth configuration and the shared state every handler reads.

use anyhow::{Context, Result};
use secrecy::{ExposeSecret, SecretString};
use subtle::ConstantTimeEq;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{info, warn};

use crate::credential::{CredentialVerifier, DEFAULT_COST};
use crate::identity::{
    DEFAULT_COUNTRY, IdentityStore, PgIdentityStore, Provisioner,
    admin::{AdminStore, PgAdminStore},
};
use crate::oauth::{GoogleConfig, GoogleProvider, RedirectPolicy, StateCodec};
use crate::otp::{ConsoleSender, MultiSender, OtpEngine, OtpSender, OtpStore, PgOtpStore, SmtpSender};
use crate::realm::{PgDirectory, PrincipalDirectory, Realm, RealmAuth};
use crate::session::{PgSessionStore, SessionStore};
use crate::token::{DEFAULT_ACCESS_TTL_SECONDS, DEFAULT_REFRESH_TTL_SECONDS, TokenCodec};
use crate::webauthn::{PasskeyConfig, PasskeyService, PasskeyStore, PgPasskeyStore};

const DEFAULT_FRONTEND_URL: &str = "http://localhost:3000";
const DEFAULT_RP_ID: &str = "localhost";
const DEFAULT_RP_NAME: &str = "Berhot";

#[derive(Clone, Debug)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub from: String,
}

#[derive(Clone, Debug)]
pub struct AuthConfig {
    jwt_secret: SecretString,
    access_ttl_seconds: i64,
    refresh_ttl_seconds: i64,
    bcrypt_cost: u32,
    default_country: String,
    frontend_url: String,
    cors_origins: Vec<String>,
    rp_id: String,
    rp_name: String,
    rp_origins: Vec<String>,
    google: Option<GoogleConfig>,
    smtp: Option<SmtpConfig>,
    internal_api_key: Option<SecretString>,
}

impl AuthConfig {
    #[must_use]
    pub fn new(jwt_secret: SecretString) -> Self {
        Self {
            jwt_secret,
            access_ttl_seconds: DEFAULT_ACCESS_TTL_SECONDS,
            refresh_ttl_seconds: DEFAULT_REFRESH_TTL_SECONDS,
            bcrypt_cost: DEFAULT_COST,
            default_country: DEFAULT_COUNTRY.to_string(),
            frontend_url: DEFAULT_FRONTEND_URL.to_string(),
            cors_origins: vec![DEFAULT_FRONTEND_URL.to_string()],
            rp_id: DEFAULT_RP_ID.to_string(),
            rp_name: DEFAULT_RP_NAME.to_string(),
            rp_origins: vec![DEFAULT_FRONTEND_URL.to_string()],
            google: None,
            smtp: None,
            internal_api_key: None,
        }
    }

    #[must_use]
    pub fn with_access_ttl_seconds(mut self, seconds: i64) -> Self {
        self.access_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_refresh_ttl_seconds(mut self, seconds: i64) -> Self {
        self.refresh_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_bcrypt_cost(mut self, cost: u32) -> Self {
        self.bcrypt_cost = cost;
        self
    }

    #[must_use]
    pub fn with_default_country(mut self, country: String) -> Self {
        self.default_country = country;
        self
    }

    #[must_use]
    pub fn with_frontend_url(mut self, url: String) -> Self {
        self.frontend_url = url;
        self
    }

    #[must_use]
    pub fn with_cors_origins(mut self, origins: Vec<String>) -> Self {
        self.cors_origins = origins;
        self
    }

    #[must_use]
    pub fn with_webauthn(mut self, rp_id: String, rp_name: String, origins: Vec<String>) -> Self {
        self.rp_id = rp_id;
        self.rp_name = rp_name;
        self.rp_origins = origins;
        self
    }

    #[must_use]
    pub fn with_google(mut self, google: Option<GoogleConfig>) -> Self {
        self.google = google;
        self
    }

    #[must_use]
    pub fn with_smtp(mut self, smtp: Option<SmtpConfig>) -> Self {
        self.smtp = smtp;
        self
    }

    #[must_use]
    pub fn with_internal_api_key(mut self, key: Option<SecretString>) -> Self {
        self.internal_api_key = key;
        self
    }

    #[must_use]
    pub fn access_ttl_seconds(&self) -> i64 {
        self.access_ttl_seconds
    }

    #[must_use]
    pub fn refresh_ttl_seconds(&self) -> i64 {
        self.refresh_ttl_seconds
    }

    #[must_use]
    pub fn bcrypt_cost(&self) -> u32 {
        self.bcrypt_cost
    }

    #[must_use]
    pub fn frontend_url(&self) -> &str {
        &self.frontend_url
    }

    #[must_use]
    pub fn cors_origins(&self) -> &[String] {
        &self.cors_origins
    }

    #[must_use]
    pub fn smtp(&self) -> Option<&SmtpConfig> {
        self.smtp.as_ref()
    }

    #[must_use]
    pub fn has_internal_api_key(&self) -> bool {
        self.internal_api_key.is_some()
    }

    /// `true` when `presented` matches the configured key, or no key is configured.
    #[must_use]
    pub fn internal_key_matches(&self, presented: Option<&str>) -> bool {
        match &self.internal_api_key {
            None => true,
            Some(expected) => {
                let expected = expected.expose_secret().as_bytes();
                presented.is_some_and(|p| bool::from(p.as_bytes().ct_eq(expected)))
            }
        }
    }
}

/// Storage and delivery collaborators, Postgres-backed in production.
pub struct Stores {
    pub customer_sessions: Arc<dyn SessionStore>,
    pub admin_sessions: Arc<dyn SessionStore>,
    pub customers: Arc<dyn PrincipalDirectory>,
    pub admins: Arc<dyn PrincipalDirectory>,
    pub identities: Arc<dyn IdentityStore>,
    pub admin_accounts: Arc<dyn AdminStore>,
    pub otp: Arc<dyn OtpStore>,
    pub otp_sender: Arc<dyn OtpSender>,
    pub passkeys: Option<Arc<dyn PasskeyStore>>,
}

impl Stores {
    #[must_use]
    pub fn postgres(pool: &PgPool, config: &AuthConfig) -> Self {
        let email_sender: Arc<dyn OtpSender> = match config.smtp() {
            Some(smtp) => Arc::new(SmtpSender::new(smtp.host.clone(), smtp.port, smtp.from.clone())),
            None => Arc::new(ConsoleSender),
        };
        Self {
            customer_sessions: Arc::new(PgSessionStore::new(pool.clone(), Realm::Customer)),
            admin_sessions: Arc::new(PgSessionStore::new(pool.clone(), Realm::Admin)),
            customers: Arc::new(PgDirectory::new(pool.clone(), Realm::Customer)),
            admins: Arc::new(PgDirectory::new(pool.clone(), Realm::Admin)),
            identities: Arc::new(PgIdentityStore::new(pool.clone())),
            admin_accounts: Arc::new(PgAdminStore::new(pool.clone())),
            otp: Arc::new(PgOtpStore::new(pool.clone())),
            otp_sender: Arc::new(MultiSender::new(email_sender, Arc::new(ConsoleSender))),
            passkeys: Some(Arc::new(PgPasskeyStore::new(pool.clone()))),
        }
    }
}

/// Passkey ceremonies plus the table their credentials live in.
pub struct Passkeys {
    pub service: PasskeyService,
    pub store: Arc<dyn PasskeyStore>,
}

pub struct AuthState {
    config: AuthConfig,
    customer: RealmAuth,
    admin: RealmAuth,
    provisioner: Provisioner,
    admin_accounts: Arc<dyn AdminStore>,
    otp: OtpEngine,
    verifier: CredentialVerifier,
    passkeys: Option<Passkeys>,
    google: Option<GoogleProvider>,
    oauth_state: StateCodec,
    redirects: RedirectPolicy,
}

impl AuthState {
    /// Wire both realms and every flow onto `stores`.
    ///
    /// Passkeys and Google sign-in are optional: a `WebAuthn` setup failure or
    /// missing Google credentials disable those routes instead of failing start-up.
    ///
    /// # Errors
    /// Returns error if the signing secret is unusable.
    pub fn new(config: AuthConfig, stores: Stores) -> Result<Self> {
        let codec = |realm| {
            TokenCodec::new(realm, &config.jwt_secret)
                .map(|codec| {
                    codec
                        .with_access_ttl_seconds(config.access_ttl_seconds)
                        .with_refresh_ttl_seconds(config.refresh_ttl_seconds)
                })
                .with_context(|| format!("Failed to build {realm} token codec"))
        };
        let customer = RealmAuth::new(
            codec(Realm::Customer)?,
            stores.customer_sessions,
            stores.customers.clone(),
        );
        let admin = RealmAuth::new(codec(Realm::Admin)?, stores.admin_sessions, stores.admins);

        let verifier = CredentialVerifier::new(config.bcrypt_cost);
        let provisioner = Provisioner::new(stores.identities, stores.customers, verifier)
            .with_default_country(config.default_country.clone());
        let otp = OtpEngine::new(stores.otp, stores.otp_sender);

        let passkeys = match stores.passkeys {
            Some(store) => {
                match PasskeyConfig::new(config.rp_id.clone(), config.rp_name.clone(), &config.rp_origins)
                    .and_then(PasskeyService::new)
                {
                    Ok(service) => Some(Passkeys { service, store }),
                    Err(err) => {
                        warn!("WebAuthn initialization failed, passkey endpoints disabled: {err:#}");
                        None
                    }
                }
            }
            None => None,
        };

        let google = match config.google.clone() {
            Some(google) => Some(GoogleProvider::new(google)?),
            None => {
                info!("Google OAuth is not configured");
                None
            }
        };

        let oauth_state =
            StateCodec::new(&config.jwt_secret).context("Failed to build OAuth state codec")?;
        let redirects = RedirectPolicy::new(&config.frontend_url, &config.cors_origins);

        Ok(Self {
            config,
            customer,
            admin,
            provisioner,
            admin_accounts: stores.admin_accounts,
            otp,
            verifier,
            passkeys,
            google,
            oauth_state,
            redirects,
        })
    }

    #[must_use]
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    #[must_use]
    pub fn realm(&self, realm: Realm) -> &RealmAuth {
        match realm {
            Realm::Customer => &self.customer,
            Realm::Admin => &self.admin,
        }
    }

    #[must_use]
    pub fn customer(&self) -> &RealmAuth {
        &self.customer
    }

    #[must_use]
    pub fn admin(&self) -> &RealmAuth {
        &self.admin
    }

    #[must_use]
    pub fn provisioner(&self) -> &Provisioner {
        &self.provisioner
    }

    #[must_use]
    pub fn admin_accounts(&self) -> &dyn AdminStore {
        self.admin_accounts.as_ref()
    }

    #[must_use]
    pub fn otp(&self) -> &OtpEngine {
        &self.otp
    }

    #[must_use]
    pub fn verifier(&self) -> CredentialVerifier {
        self.verifier
    }

    #[must_use]
    pub fn passkeys(&self) -> Option<&Passkeys> {
        self.passkeys.as_ref()
    }

    #[must_use]
    pub fn google(&self) -> Option<&GoogleProvider> {
        self.google.as_ref()
    }

    #[must_use]
    pub fn oauth_state(&self) -> &StateCodec {
        &self.oauth_state
    }

    #[must_use]
    pub fn redirects(&self) -> &RedirectPolicy {
        &self.redirects
    }
}
