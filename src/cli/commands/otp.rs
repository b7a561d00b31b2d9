use clap::{Arg, ArgMatches, Command};

pub const ARG_OTP_TTL_SECONDS: &str = "otp-ttl-seconds";
pub const ARG_OTP_MAX_ATTEMPTS: &str = "otp-max-attempts";
pub const ARG_OTP_RESEND_COOLDOWN_SECONDS: &str = "otp-resend-cooldown-seconds";
pub const ARG_SESSION_TTL_SECONDS: &str = "session-ttl-seconds";

#[derive(Debug, Clone)]
pub struct Options {
    pub ttl_seconds: u64,
    pub max_attempts: u32,
    pub resend_cooldown_seconds: u64,
    pub session_ttl_seconds: u64,
}

impl Options {
    /// Parse code and session lifetime arguments from matches.
    ///
    /// # Errors
    /// Returns an error if a lifetime or the attempt budget is zero.
    pub fn parse(matches: &ArgMatches) -> anyhow::Result<Self> {
        let get = |id: &str, default: u64| matches.get_one::<u64>(id).copied().unwrap_or(default);

        let options = Self {
            ttl_seconds: get(ARG_OTP_TTL_SECONDS, 300),
            max_attempts: matches
                .get_one::<u32>(ARG_OTP_MAX_ATTEMPTS)
                .copied()
                .unwrap_or(3),
            resend_cooldown_seconds: get(ARG_OTP_RESEND_COOLDOWN_SECONDS, 30),
            session_ttl_seconds: get(ARG_SESSION_TTL_SECONDS, 86400),
        };

        if options.ttl_seconds == 0 {
            anyhow::bail!("--{ARG_OTP_TTL_SECONDS} must be greater than 0");
        }
        if options.max_attempts == 0 {
            anyhow::bail!("--{ARG_OTP_MAX_ATTEMPTS} must be greater than 0");
        }
        if options.session_ttl_seconds == 0 {
            anyhow::bail!("--{ARG_SESSION_TTL_SECONDS} must be greater than 0");
        }
        Ok(options)
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_OTP_TTL_SECONDS)
                .long(ARG_OTP_TTL_SECONDS)
                .help("Verification code lifetime in seconds")
                .env("CONTACTGATE_OTP_TTL_SECONDS")
                .default_value("300")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_OTP_MAX_ATTEMPTS)
                .long(ARG_OTP_MAX_ATTEMPTS)
                .help("Wrong guesses allowed before a code is locked")
                .env("CONTACTGATE_OTP_MAX_ATTEMPTS")
                .default_value("3")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new(ARG_OTP_RESEND_COOLDOWN_SECONDS)
                .long(ARG_OTP_RESEND_COOLDOWN_SECONDS)
                .help("Seconds a new code must wait after the previous one")
                .env("CONTACTGATE_OTP_RESEND_COOLDOWN_SECONDS")
                .default_value("30")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_SESSION_TTL_SECONDS)
                .long(ARG_SESSION_TTL_SECONDS)
                .help("Lifetime of a pending submission and its cookie in seconds")
                .env("CONTACTGATE_SESSION_TTL_SECONDS")
                .default_value("86400")
                .value_parser(clap::value_parser!(u64)),
        )
}
