use crate::{
    api::{self, AuthConfig, SmtpConfig},
    oauth::GoogleConfig,
};
use anyhow::Result;
use secrecy::SecretString;
use tracing::{debug, info};

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: String,
    pub jwt_secret: SecretString,
    pub access_ttl_seconds: i64,
    pub refresh_ttl_seconds: i64,
    pub bcrypt_cost: u32,
    pub default_country: String,
    pub frontend_url: String,
    pub cors_origins: Vec<String>,
    pub internal_api_key: Option<SecretString>,
    pub google: Option<GoogleConfig>,
    pub rp_id: String,
    pub rp_name: String,
    pub rp_origins: Vec<String>,
    pub smtp: Option<SmtpConfig>,
}

impl Args {
    fn auth_config(self) -> (u16, String, AuthConfig) {
        let config = AuthConfig::new(self.jwt_secret)
            .with_access_ttl_seconds(self.access_ttl_seconds)
            .with_refresh_ttl_seconds(self.refresh_ttl_seconds)
            .with_bcrypt_cost(self.bcrypt_cost)
            .with_default_country(self.default_country)
            .with_frontend_url(self.frontend_url)
            .with_cors_origins(self.cors_origins)
            .with_webauthn(self.rp_id, self.rp_name, self.rp_origins)
            .with_google(self.google)
            .with_smtp(self.smtp)
            .with_internal_api_key(self.internal_api_key);
        (self.port, self.dsn, config)
    }
}

/// Execute the server action.
/// # Errors
/// Returns an error if the database is unreachable or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    let (port, dsn, config) = args.auth_config();

    if config.smtp().is_none() {
        info!("SMTP_HOST not set, email codes will be written to the log");
    }
    if !config.has_internal_api_key() {
        info!("INTERNAL_API_KEY not set, /internal routes rely on network isolation");
    }

    debug!(port, "starting server");

    api::new(port, dsn, config).await
}
