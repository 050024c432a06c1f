//! Maps validated CLI matches to the action the binary runs.

use crate::cli::actions::{Action, server::Args};
use crate::cli::commands::{self, auth, google, smtp, webauthn};
use anyhow::{Context, Result};

/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches
        .get_one::<u16>(commands::ARG_PORT)
        .copied()
        .unwrap_or(8080);
    let dsn = matches
        .get_one::<String>(commands::ARG_DSN)
        .cloned()
        .context("missing required argument: --dsn")?;

    let auth_opts = auth::Options::parse(matches)?;
    let google_opts = google::Options::parse(matches)?;
    let webauthn_opts = webauthn::Options::parse(matches)?;
    let smtp_opts = smtp::Options::parse(matches);

    Ok(Action::Server(Args {
        port,
        dsn,
        jwt_secret: auth_opts.jwt_secret,
        access_ttl_seconds: auth_opts.access_ttl_seconds,
        refresh_ttl_seconds: auth_opts.refresh_ttl_seconds,
        bcrypt_cost: auth_opts.bcrypt_cost,
        default_country: auth_opts.default_country,
        frontend_url: auth_opts.frontend_url,
        cors_origins: auth_opts.cors_origins,
        internal_api_key: auth_opts.internal_api_key,
        google: google_opts.google,
        rp_id: webauthn_opts.rp_id,
        rp_name: webauthn_opts.rp_name,
        rp_origins: webauthn_opts.rp_origins,
        smtp: smtp_opts.smtp,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_server_action_from_env() -> Result<()> {
        temp_env::with_vars(
            [
                ("APP_PORT", Some("9000")),
                ("DATABASE_URL", Some("postgres://berhot@localhost:5432/berhot")),
                ("JWT_SECRET", Some("s3cret")),
                ("GOOGLE_CLIENT_ID", None),
                ("GOOGLE_CLIENT_SECRET", None),
                ("SMTP_HOST", None),
                ("FRONTEND_URL", Some("https://app.berhot.com")),
            ],
            || {
                let matches = commands::new().get_matches_from(vec!["identity-access"]);
                let Action::Server(args) = handler(&matches)?;
                assert_eq!(args.port, 9000);
                assert_eq!(args.frontend_url, "https://app.berhot.com");
                assert!(args.google.is_none());
                assert!(args.smtp.is_none());
                assert_eq!(args.rp_id, "localhost");
                Ok(())
            },
        )
    }

    #[test]
    fn debug_output_hides_secrets() -> Result<()> {
        temp_env::with_vars(
            [
                ("DATABASE_URL", Some("postgres://berhot@localhost:5432/berhot")),
                ("JWT_SECRET", Some("very-secret-signing-key")),
                ("INTERNAL_API_KEY", Some("very-secret-service-key")),
            ],
            || {
                let matches = commands::new().get_matches_from(vec!["identity-access"]);
                let action = handler(&matches)?;
                let rendered = format!("{action:?}");
                assert!(!rendered.contains("very-secret-signing-key"));
                assert!(!rendered.contains("very-secret-service-key"));
                Ok(())
            },
        )
    }
}
