use clap::{Arg, ArgMatches, Command};
use secrecy::SecretString;
use std::time::Duration;

pub const ARG_REDIS_URL: &str = "redis-url";
pub const ARG_STORE_TIMEOUT_MS: &str = "store-timeout-ms";
pub const ARG_STORE_PROBE_SECONDS: &str = "store-probe-seconds";
pub const ARG_SWEEP_INTERVAL_SECONDS: &str = "sweep-interval-seconds";

#[derive(Debug, Clone)]
pub struct Options {
    pub redis_url: Option<SecretString>,
    pub command_timeout: Duration,
    pub probe_interval: Duration,
    pub sweep_interval: Duration,
}

impl Options {
    /// Parse ephemeral store arguments from matches.
    ///
    /// # Errors
    /// Returns an error if the command timeout or the sweep interval is zero.
    pub fn parse(matches: &ArgMatches) -> anyhow::Result<Self> {
        let redis_url = matches
            .get_one::<String>(ARG_REDIS_URL)
            .filter(|v| !v.trim().is_empty())
            .map(|v| SecretString::from(v.trim().to_string()));

        let sweep_seconds = matches
            .get_one::<u64>(ARG_SWEEP_INTERVAL_SECONDS)
            .copied()
            .unwrap_or(60);
        if sweep_seconds == 0 {
            anyhow::bail!("--{ARG_SWEEP_INTERVAL_SECONDS} must be greater than 0");
        }

        let timeout_ms = matches
            .get_one::<u64>(ARG_STORE_TIMEOUT_MS)
            .copied()
            .unwrap_or(2000);
        if timeout_ms == 0 {
            anyhow::bail!("--{ARG_STORE_TIMEOUT_MS} must be greater than 0");
        }

        Ok(Self {
            redis_url,
            command_timeout: Duration::from_millis(timeout_ms),
            probe_interval: Duration::from_secs(
                matches
                    .get_one::<u64>(ARG_STORE_PROBE_SECONDS)
                    .copied()
                    .unwrap_or(5),
            ),
            sweep_interval: Duration::from_secs(sweep_seconds),
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_REDIS_URL)
                .long(ARG_REDIS_URL)
                .help("Redis URL for the shared ephemeral store")
                .long_help(
                    "Redis URL (redis:// or rediss://) for the shared ephemeral store.\n\nWhen omitted, codes, sessions and rate limits live in this process only.",
                )
                .env("CONTACTGATE_REDIS_URL")
                .hide_env_values(true),
        )
        .arg(
            Arg::new(ARG_STORE_TIMEOUT_MS)
                .long(ARG_STORE_TIMEOUT_MS)
                .help("Timeout for each Redis command in milliseconds")
                .env("CONTACTGATE_STORE_TIMEOUT_MS")
                .default_value("2000")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_STORE_PROBE_SECONDS)
                .long(ARG_STORE_PROBE_SECONDS)
                .help("Minimum seconds between Redis reconnect attempts")
                .env("CONTACTGATE_STORE_PROBE_SECONDS")
                .default_value("5")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_SWEEP_INTERVAL_SECONDS)
                .long(ARG_SWEEP_INTERVAL_SECONDS)
                .help("Seconds between sweeps of expired in-process entries")
                .env("CONTACTGATE_SWEEP_INTERVAL_SECONDS")
                .default_value("60")
                .value_parser(clap::value_parser!(u64)),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> anyhow::Result<Options> {
        temp_env::with_vars(
            [
                ("CONTACTGATE_STORE_TIMEOUT_MS", None::<&str>),
                ("CONTACTGATE_SWEEP_INTERVAL_SECONDS", None::<&str>),
                ("CONTACTGATE_REDIS_URL", None::<&str>),
            ],
            || {
                let matches = with_args(Command::new("test"))
                    .get_matches_from(std::iter::once("test").chain(args.iter().copied()));
                Options::parse(&matches)
            },
        )
    }

    #[test]
    fn defaults() -> anyhow::Result<()> {
        let options = parse(&[])?;
        assert!(options.redis_url.is_none());
        assert_eq!(options.command_timeout, Duration::from_millis(2000));
        assert_eq!(options.probe_interval, Duration::from_secs(5));
        assert_eq!(options.sweep_interval, Duration::from_secs(60));
        Ok(())
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let err = parse(&["--store-timeout-ms", "0"]).err();
        assert!(err.is_some_and(|err| err.to_string().contains(ARG_STORE_TIMEOUT_MS)));
    }

    #[test]
    fn zero_sweep_interval_is_rejected() {
        assert!(parse(&["--sweep-interval-seconds", "0"]).is_err());
    }
}
