use crate::mailer::SmtpConfig;
use clap::{Arg, ArgMatches, Command};
use secrecy::SecretString;

pub const ARG_SMTP_HOST: &str = "smtp-host";
pub const ARG_SMTP_PORT: &str = "smtp-port";
pub const ARG_SMTP_USER: &str = "smtp-user";
pub const ARG_SMTP_PASS: &str = "smtp-pass";
pub const ARG_MAIL_FROM: &str = "mail-from";
pub const ARG_RECIPIENT_EMAIL: &str = "recipient-email";

#[derive(Debug, Clone)]
pub struct Options {
    /// `None` selects the logging mailer.
    pub smtp: Option<SmtpConfig>,
    pub recipient: String,
}

impl Options {
    /// Parse mail delivery arguments from matches.
    ///
    /// # Errors
    /// Returns an error if the recipient is missing or SMTP is only partly
    /// configured.
    pub fn parse(matches: &ArgMatches) -> anyhow::Result<Self> {
        let get_non_empty = |id: &str| {
            matches
                .get_one::<String>(id)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let Some(recipient) = get_non_empty(ARG_RECIPIENT_EMAIL) else {
            anyhow::bail!("missing required argument: --{ARG_RECIPIENT_EMAIL}");
        };

        let smtp = match (
            get_non_empty(ARG_SMTP_HOST),
            get_non_empty(ARG_SMTP_USER),
            get_non_empty(ARG_SMTP_PASS),
        ) {
            (None, None, None) => None,
            (Some(host), Some(user), Some(pass)) => {
                let port = matches
                    .get_one::<u16>(ARG_SMTP_PORT)
                    .copied()
                    .unwrap_or(587);
                let config = SmtpConfig::new(host, port, user, SecretString::from(pass));
                Some(match get_non_empty(ARG_MAIL_FROM) {
                    Some(from) => config.with_from(from),
                    None => config,
                })
            }
            _ => anyhow::bail!(
                "--{ARG_SMTP_HOST}, --{ARG_SMTP_USER} and --{ARG_SMTP_PASS} must be set together"
            ),
        };

        Ok(Self { smtp, recipient })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_SMTP_HOST)
                .long(ARG_SMTP_HOST)
                .help("SMTP relay host; without it emails are only logged")
                .env("CONTACTGATE_SMTP_HOST"),
        )
        .arg(
            Arg::new(ARG_SMTP_PORT)
                .long(ARG_SMTP_PORT)
                .help("SMTP relay port (465 uses implicit TLS, others STARTTLS)")
                .env("CONTACTGATE_SMTP_PORT")
                .default_value("587")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new(ARG_SMTP_USER)
                .long(ARG_SMTP_USER)
                .help("SMTP username")
                .env("CONTACTGATE_SMTP_USER"),
        )
        .arg(
            Arg::new(ARG_SMTP_PASS)
                .long(ARG_SMTP_PASS)
                .help("SMTP password")
                .env("CONTACTGATE_SMTP_PASS")
                .hide_env_values(true),
        )
        .arg(
            Arg::new(ARG_MAIL_FROM)
                .long(ARG_MAIL_FROM)
                .help("Sender address (defaults to the SMTP username)")
                .env("CONTACTGATE_MAIL_FROM"),
        )
        .arg(
            Arg::new(ARG_RECIPIENT_EMAIL)
                .long(ARG_RECIPIENT_EMAIL)
                .help("Address that receives verified submissions")
                .env("CONTACTGATE_RECIPIENT_EMAIL"),
        )
}
