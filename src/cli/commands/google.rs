use clap::{Arg, ArgMatches, Command};
use secrecy::SecretString;

use crate::oauth::GoogleConfig;

pub const ARG_GOOGLE_CLIENT_ID: &str = "google-client-id";
pub const ARG_GOOGLE_CLIENT_SECRET: &str = "google-client-secret";
pub const ARG_GOOGLE_REDIRECT_URL: &str = "google-redirect-url";

const DEFAULT_REDIRECT_URL: &str = "http://localhost:8080/api/v1/auth/oauth/google/callback";

#[derive(Debug, Clone, Default)]
pub struct Options {
    pub google: Option<GoogleConfig>,
}

impl Options {
    /// Google sign-in is enabled only when both the client id and secret are set.
    ///
    /// # Errors
    /// Returns an error if only one of the client id and secret is provided.
    pub fn parse(matches: &ArgMatches) -> anyhow::Result<Self> {
        let get_non_empty = |id: &str| {
            matches
                .get_one::<String>(id)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let google = match (
            get_non_empty(ARG_GOOGLE_CLIENT_ID),
            get_non_empty(ARG_GOOGLE_CLIENT_SECRET),
        ) {
            (Some(client_id), Some(client_secret)) => Some(GoogleConfig {
                client_id,
                client_secret: SecretString::from(client_secret),
                redirect_url: get_non_empty(ARG_GOOGLE_REDIRECT_URL)
                    .unwrap_or_else(|| DEFAULT_REDIRECT_URL.to_string()),
            }),
            (None, None) => None,
            _ => anyhow::bail!(
                "--{ARG_GOOGLE_CLIENT_ID} and --{ARG_GOOGLE_CLIENT_SECRET} must be set together"
            ),
        };

        Ok(Self { google })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_GOOGLE_CLIENT_ID)
                .long(ARG_GOOGLE_CLIENT_ID)
                .help("Google OAuth client id (unset: Google sign-in is disabled)")
                .env("GOOGLE_CLIENT_ID"),
        )
        .arg(
            Arg::new(ARG_GOOGLE_CLIENT_SECRET)
                .long(ARG_GOOGLE_CLIENT_SECRET)
                .help("Google OAuth client secret")
                .env("GOOGLE_CLIENT_SECRET")
                .hide_env_values(true),
        )
        .arg(
            Arg::new(ARG_GOOGLE_REDIRECT_URL)
                .long(ARG_GOOGLE_REDIRECT_URL)
                .help("Callback URL registered with Google")
                .env("GOOGLE_REDIRECT_URL"),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    const VARS: [&str; 3] = ["GOOGLE_CLIENT_ID", "GOOGLE_CLIENT_SECRET", "GOOGLE_REDIRECT_URL"];

    fn cleared() -> Vec<(&'static str, Option<&'static str>)> {
        VARS.iter().map(|name| (*name, None)).collect()
    }

    #[test]
    fn disabled_without_credentials() -> anyhow::Result<()> {
        temp_env::with_vars(cleared(), || {
            let matches = with_args(Command::new("t")).get_matches_from(vec!["t"]);
            assert!(Options::parse(&matches)?.google.is_none());
            Ok(())
        })
    }

    #[test]
    fn enabled_with_default_redirect() -> anyhow::Result<()> {
        temp_env::with_vars(cleared(), || {
            let matches = with_args(Command::new("t")).get_matches_from(vec![
                "t",
                "--google-client-id",
                "client",
                "--google-client-secret",
                "secret",
            ]);
            let google = Options::parse(&matches)?
                .google
                .ok_or_else(|| anyhow::anyhow!("expected google config"))?;
            assert_eq!(google.client_id, "client");
            assert_eq!(google.redirect_url, DEFAULT_REDIRECT_URL);
            Ok(())
        })
    }

    #[test]
    fn half_configured_is_an_error() {
        temp_env::with_vars(cleared(), || {
            let matches = with_args(Command::new("t"))
                .get_matches_from(vec!["t", "--google-client-id", "client"]);
            assert!(Options::parse(&matches).is_err());
        });
    }
}
