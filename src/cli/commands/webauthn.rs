use clap::{Arg, ArgAction, ArgMatches, Command};

pub const ARG_RP_ID: &str = "webauthn-rp-id";
pub const ARG_RP_DISPLAY_NAME: &str = "webauthn-rp-display-name";
pub const ARG_RP_ORIGINS: &str = "webauthn-rp-origins";

#[derive(Debug, Clone)]
pub struct Options {
    pub rp_id: String,
    pub rp_name: String,
    pub rp_origins: Vec<String>,
}

impl Options {
    /// # Errors
    /// Returns an error if no relying party origin remains after trimming.
    pub fn parse(matches: &ArgMatches) -> anyhow::Result<Self> {
        let get_non_empty = |id: &str| {
            matches
                .get_one::<String>(id)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let rp_origins: Vec<String> = matches
            .get_many::<String>(ARG_RP_ORIGINS)
            .map(|values| {
                values
                    .map(|value| value.trim().to_string())
                    .filter(|value| !value.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        if rp_origins.is_empty() {
            anyhow::bail!("--{ARG_RP_ORIGINS} needs at least one origin");
        }

        Ok(Self {
            rp_id: get_non_empty(ARG_RP_ID).unwrap_or_else(|| "localhost".to_string()),
            rp_name: get_non_empty(ARG_RP_DISPLAY_NAME).unwrap_or_else(|| "Berhot".to_string()),
            rp_origins,
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_RP_ID)
                .long(ARG_RP_ID)
                .help("WebAuthn relying party id (the registrable domain)")
                .env("WEBAUTHN_RP_ID")
                .default_value("localhost"),
        )
        .arg(
            Arg::new(ARG_RP_DISPLAY_NAME)
                .long(ARG_RP_DISPLAY_NAME)
                .help("Relying party name shown by authenticators")
                .env("WEBAUTHN_RP_DISPLAY_NAME")
                .default_value("Berhot"),
        )
        .arg(
            Arg::new(ARG_RP_ORIGINS)
                .long(ARG_RP_ORIGINS)
                .help("Comma separated origins allowed to run passkey ceremonies")
                .env("WEBAUTHN_RP_ORIGINS")
                .default_value("http://localhost:3000")
                .value_delimiter(',')
                .action(ArgAction::Append),
        )
}
