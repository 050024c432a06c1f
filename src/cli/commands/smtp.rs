use clap::{Arg, ArgMatches, Command};

use crate::api::SmtpConfig;

pub const ARG_SMTP_HOST: &str = "smtp-host";
pub const ARG_SMTP_PORT: &str = "smtp-port";
pub const ARG_SMTP_FROM: &str = "smtp-from";

#[derive(Debug, Clone, Default)]
pub struct Options {
    pub smtp: Option<SmtpConfig>,
}

impl Options {
    /// Without a host, email codes are written to the log.
    #[must_use]
    pub fn parse(matches: &ArgMatches) -> Self {
        let host = matches
            .get_one::<String>(ARG_SMTP_HOST)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        let smtp = host.map(|host| SmtpConfig {
            host,
            port: matches.get_one::<u16>(ARG_SMTP_PORT).copied().unwrap_or(1025),
            from: matches
                .get_one::<String>(ARG_SMTP_FROM)
                .cloned()
                .unwrap_or_else(|| "noreply@berhot.com".to_string()),
        });

        Self { smtp }
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_SMTP_HOST)
                .long(ARG_SMTP_HOST)
                .help("SMTP relay host for email codes (unset: codes are logged)")
                .env("SMTP_HOST"),
        )
        .arg(
            Arg::new(ARG_SMTP_PORT)
                .long(ARG_SMTP_PORT)
                .help("SMTP relay port")
                .env("SMTP_PORT")
                .default_value("1025")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new(ARG_SMTP_FROM)
                .long(ARG_SMTP_FROM)
                .help("Sender address for email codes")
                .env("SMTP_FROM")
                .default_value("noreply@berhot.com"),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_host_means_console_delivery() {
        temp_env::with_vars([("SMTP_HOST", None::<&str>)], || {
            let matches = with_args(Command::new("t")).get_matches_from(vec!["t"]);
            assert!(Options::parse(&matches).smtp.is_none());
        })
    }

    #[test]
    fn host_enables_relay() -> anyhow::Result<()> {
        temp_env::with_vars(
            [("SMTP_HOST", Some("mail.internal")), ("SMTP_PORT", Some("2525"))],
            || {
                let matches = with_args(Command::new("t")).get_matches_from(vec!["t"]);
                let smtp = Options::parse(&matches)
                    .smtp
                    .ok_or_else(|| anyhow::anyhow!("expected smtp config"))?;
                assert_eq!(smtp.host, "mail.internal");
                assert_eq!(smtp.port, 2525);
                Ok(())
            },
        )
    }
}
