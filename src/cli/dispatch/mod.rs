//! Map parsed CLI arguments to the action the binary runs.

use crate::cli::actions::{Action, server::Args};
use crate::cli::commands::{ARG_INSECURE_COOKIES, ARG_PORT, limits, mail, otp, store, submissions};
use anyhow::Result;

/// Map validated CLI matches to a server action.
///
/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>(ARG_PORT).copied().unwrap_or(8080);

    let store = store::Options::parse(matches)?;
    let otp = otp::Options::parse(matches)?;
    let limits = limits::Options::parse(matches)?;
    let mail = mail::Options::parse(matches)?;
    let submissions = submissions::Options::parse(matches);

    Ok(Action::Server(Args {
        port,
        redis_url: store.redis_url,
        store_command_timeout: store.command_timeout,
        store_probe_interval: store.probe_interval,
        sweep_interval: store.sweep_interval,
        otp_ttl_seconds: otp.ttl_seconds,
        otp_max_attempts: otp.max_attempts,
        otp_resend_cooldown_seconds: otp.resend_cooldown_seconds,
        session_ttl_seconds: otp.session_ttl_seconds,
        form_rate_limit: limits.form_submit,
        verify_rate_limit: limits.otp_verify,
        smtp: mail.smtp,
        recipient_email: mail.recipient,
        submissions_file: submissions.submissions_file,
        fallback_dir: submissions.fallback_dir,
        secure_cookies: !matches.get_flag(ARG_INSECURE_COOKIES),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use std::time::Duration;

    fn clean_env() -> [(&'static str, Option<&'static str>); 6] {
        [
            ("CONTACTGATE_REDIS_URL", None),
            ("CONTACTGATE_RECIPIENT_EMAIL", None),
            ("CONTACTGATE_SMTP_HOST", None),
            ("CONTACTGATE_SMTP_USER", None),
            ("CONTACTGATE_SMTP_PASS", None),
            ("CONTACTGATE_INSECURE_COOKIES", None),
        ]
    }

    #[test]
    fn recipient_email_required() {
        temp_env::with_vars(clean_env(), || {
            let matches = crate::cli::commands::new().get_matches_from(vec!["contactgate"]);
            let result = handler(&matches);
            assert!(
                result.is_err_and(|err| err
                    .to_string()
                    .contains("missing required argument: --recipient-email"))
            );
        });
    }

    #[test]
    fn defaults_select_memory_store_and_log_mailer() -> Result<()> {
        temp_env::with_vars(clean_env(), || {
            let matches = crate::cli::commands::new().get_matches_from(vec![
                "contactgate",
                "--recipient-email",
                "team@example.com",
            ]);
            let Action::Server(args) = handler(&matches)?;
            assert_eq!(args.port, 8080);
            assert!(args.redis_url.is_none());
            assert!(args.smtp.is_none());
            assert_eq!(args.recipient_email, "team@example.com");
            assert_eq!(args.store_command_timeout, Duration::from_millis(2000));
            assert_eq!(args.sweep_interval, Duration::from_secs(60));
            assert_eq!(args.otp_ttl_seconds, 300);
            assert_eq!(args.otp_resend_cooldown_seconds, 30);
            assert_eq!(args.session_ttl_seconds, 86400);
            assert_eq!(args.verify_rate_limit.limit, 15);
            assert_eq!(args.verify_rate_limit.window_seconds, 300);
            assert!(args.secure_cookies);
            Ok(())
        })
    }

    #[test]
    fn smtp_and_redis_from_env() -> Result<()> {
        temp_env::with_vars(
            [
                ("CONTACTGATE_REDIS_URL", Some("redis://:pw@cache:6379/0")),
                ("CONTACTGATE_RECIPIENT_EMAIL", Some("team@example.com")),
                ("CONTACTGATE_SMTP_HOST", Some("smtp.example.com")),
                ("CONTACTGATE_SMTP_USER", Some("mailer@example.com")),
                ("CONTACTGATE_SMTP_PASS", Some("secret")),
                ("CONTACTGATE_INSECURE_COOKIES", Some("true")),
            ],
            || {
                let matches = crate::cli::commands::new().get_matches_from(vec!["contactgate"]);
                let Action::Server(args) = handler(&matches)?;
                assert_eq!(
                    args.redis_url.as_ref().map(|url| url.expose_secret().to_string()),
                    Some("redis://:pw@cache:6379/0".to_string())
                );
                let smtp = args.smtp.as_ref().map(|smtp| (smtp.host(), smtp.port(), smtp.from()));
                assert_eq!(
                    smtp,
                    Some(("smtp.example.com", 587, "mailer@example.com"))
                );
                assert!(!args.secure_cookies);
                Ok(())
            },
        )
    }

    #[test]
    fn partial_smtp_rejected() {
        temp_env::with_vars(clean_env(), || {
            let matches = crate::cli::commands::new().get_matches_from(vec![
                "contactgate",
                "--recipient-email",
                "team@example.com",
                "--smtp-host",
                "smtp.example.com",
            ]);
            assert!(handler(&matches).is_err());
        });
    }

    #[test]
    fn zero_ttl_rejected() {
        temp_env::with_vars(clean_env(), || {
            let matches = crate::cli::commands::new().get_matches_from(vec![
                "contactgate",
                "--recipient-email",
                "team@example.com",
                "--otp-ttl-seconds",
                "0",
            ]);
            assert!(handler(&matches).is_err());
        });
    }
}
