use clap::{Arg, ArgAction, ArgMatches, Command};
use secrecy::SecretString;

pub const ARG_JWT_SECRET: &str = "jwt-secret";
pub const ARG_ACCESS_TTL: &str = "jwt-access-ttl-seconds";
pub const ARG_REFRESH_TTL: &str = "jwt-refresh-ttl-seconds";
pub const ARG_BCRYPT_COST: &str = "bcrypt-cost";
pub const ARG_DEFAULT_COUNTRY: &str = "default-country";
pub const ARG_FRONTEND_URL: &str = "frontend-url";
pub const ARG_CORS_ORIGINS: &str = "cors-origins";
pub const ARG_INTERNAL_API_KEY: &str = "internal-api-key";

#[derive(Debug, Clone)]
pub struct Options {
    pub jwt_secret: SecretString,
    pub access_ttl_seconds: i64,
    pub refresh_ttl_seconds: i64,
    pub bcrypt_cost: u32,
    pub default_country: String,
    pub frontend_url: String,
    pub cors_origins: Vec<String>,
    pub internal_api_key: Option<SecretString>,
}

impl Options {
    /// # Errors
    /// Returns an error if the signing secret is missing or a TTL is not positive.
    pub fn parse(matches: &ArgMatches) -> anyhow::Result<Self> {
        let get_non_empty = |id: &str| {
            matches
                .get_one::<String>(id)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let jwt_secret = get_non_empty(ARG_JWT_SECRET)
            .map(SecretString::from)
            .ok_or_else(|| anyhow::anyhow!("missing required argument: --{ARG_JWT_SECRET}"))?;

        let access_ttl_seconds = matches.get_one::<i64>(ARG_ACCESS_TTL).copied().unwrap_or(900);
        let refresh_ttl_seconds = matches
            .get_one::<i64>(ARG_REFRESH_TTL)
            .copied()
            .unwrap_or(604_800);
        if access_ttl_seconds <= 0 || refresh_ttl_seconds <= 0 {
            anyhow::bail!("token lifetimes must be positive");
        }

        let cors_origins = matches
            .get_many::<String>(ARG_CORS_ORIGINS)
            .map(|values| {
                values
                    .map(|value| value.trim().to_string())
                    .filter(|value| !value.is_empty())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        Ok(Self {
            jwt_secret,
            access_ttl_seconds,
            refresh_ttl_seconds,
            bcrypt_cost: matches.get_one::<u32>(ARG_BCRYPT_COST).copied().unwrap_or(12),
            default_country: get_non_empty(ARG_DEFAULT_COUNTRY)
                .unwrap_or_else(|| "SA".to_string())
                .to_uppercase(),
            frontend_url: get_non_empty(ARG_FRONTEND_URL)
                .unwrap_or_else(|| "http://localhost:3000".to_string()),
            cors_origins,
            internal_api_key: get_non_empty(ARG_INTERNAL_API_KEY).map(SecretString::from),
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    let command = with_token_args(command);
    with_surface_args(command)
}

fn with_token_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_JWT_SECRET)
                .long(ARG_JWT_SECRET)
                .help("HMAC secret used to sign access and refresh tokens")
                .env("JWT_SECRET")
                .hide_env_values(true)
                .required(true),
        )
        .arg(
            Arg::new(ARG_ACCESS_TTL)
                .long(ARG_ACCESS_TTL)
                .help("Access token lifetime in seconds")
                .env("JWT_ACCESS_TTL")
                .default_value("900")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new(ARG_REFRESH_TTL)
                .long(ARG_REFRESH_TTL)
                .help("Refresh token and session lifetime in seconds")
                .env("JWT_REFRESH_TTL")
                .default_value("604800")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new(ARG_BCRYPT_COST)
                .long(ARG_BCRYPT_COST)
                .help("bcrypt work factor for password hashes")
                .env("BCRYPT_COST")
                .default_value("12")
                .value_parser(clap::value_parser!(u32).range(4..=31)),
        )
}

fn with_surface_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_DEFAULT_COUNTRY)
                .long(ARG_DEFAULT_COUNTRY)
                .help("ISO country used when a phone number has no international prefix")
                .env("DEFAULT_COUNTRY")
                .default_value("SA"),
        )
        .arg(
            Arg::new(ARG_FRONTEND_URL)
                .long(ARG_FRONTEND_URL)
                .help("Frontend base URL, used for OAuth landing pages")
                .env("FRONTEND_URL")
                .default_value("http://localhost:3000"),
        )
        .arg(
            Arg::new(ARG_CORS_ORIGINS)
                .long(ARG_CORS_ORIGINS)
                .help("Comma separated list of allowed CORS origins")
                .env("CORS_ORIGINS")
                .default_value("http://localhost:3000")
                .value_delimiter(',')
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new(ARG_INTERNAL_API_KEY)
                .long(ARG_INTERNAL_API_KEY)
                .help("Shared key required on /internal routes (unset: routes are open)")
                .env("INTERNAL_API_KEY")
                .hide_env_values(true),
        )
}
