use crate::rate_limit::RateLimitPolicy;
use clap::{Arg, ArgMatches, Command};

pub const ARG_FORM_RATE_LIMIT: &str = "form-rate-limit";
pub const ARG_FORM_RATE_WINDOW_SECONDS: &str = "form-rate-window-seconds";
pub const ARG_VERIFY_RATE_LIMIT: &str = "verify-rate-limit";
pub const ARG_VERIFY_RATE_WINDOW_SECONDS: &str = "verify-rate-window-seconds";

#[derive(Debug, Clone, Copy)]
pub struct Options {
    pub form_submit: RateLimitPolicy,
    pub otp_verify: RateLimitPolicy,
}

impl Options {
    /// Parse per-client rate limit arguments from matches.
    ///
    /// # Errors
    /// Returns an error if a window is zero seconds long.
    pub fn parse(matches: &ArgMatches) -> anyhow::Result<Self> {
        let get = |id: &str, default: u64| matches.get_one::<u64>(id).copied().unwrap_or(default);

        for window in [ARG_FORM_RATE_WINDOW_SECONDS, ARG_VERIFY_RATE_WINDOW_SECONDS] {
            if get(window, 1) == 0 {
                anyhow::bail!("--{window} must be greater than 0");
            }
        }

        Ok(Self {
            form_submit: RateLimitPolicy::new(
                get(ARG_FORM_RATE_LIMIT, 10),
                get(ARG_FORM_RATE_WINDOW_SECONDS, 3600),
            ),
            otp_verify: RateLimitPolicy::new(
                get(ARG_VERIFY_RATE_LIMIT, 15),
                get(ARG_VERIFY_RATE_WINDOW_SECONDS, 300),
            ),
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_FORM_RATE_LIMIT)
                .long(ARG_FORM_RATE_LIMIT)
                .help("Form submissions allowed per client within the window")
                .env("CONTACTGATE_FORM_RATE_LIMIT")
                .default_value("10")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_FORM_RATE_WINDOW_SECONDS)
                .long(ARG_FORM_RATE_WINDOW_SECONDS)
                .help("Form submission rate limit window in seconds")
                .env("CONTACTGATE_FORM_RATE_WINDOW_SECONDS")
                .default_value("3600")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_VERIFY_RATE_LIMIT)
                .long(ARG_VERIFY_RATE_LIMIT)
                .help("Code verification attempts allowed per client within the window")
                .env("CONTACTGATE_VERIFY_RATE_LIMIT")
                .default_value("15")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_VERIFY_RATE_WINDOW_SECONDS)
                .long(ARG_VERIFY_RATE_WINDOW_SECONDS)
                .help("Code verification rate limit window in seconds")
                .env("CONTACTGATE_VERIFY_RATE_WINDOW_SECONDS")
                .default_value("300")
                .value_parser(clap::value_parser!(u64)),
        )
}
