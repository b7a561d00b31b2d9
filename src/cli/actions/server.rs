use crate::{
    api::{self, AppState},
    cli::telemetry,
    flow::ContactFlow,
    mailer::{LogMailer, Mailer, SmtpConfig, SmtpMailer},
    otp::{OtpConfig, OtpManager},
    rate_limit::{RateLimitPolicy, RateLimiter},
    session::SessionStore,
    store::{DualStore, EphemeralStore, MemoryStore, RedisStore, RedisStoreConfig},
    submissions::JsonFileSubmissionStore,
};
use anyhow::{Context, Result};
use secrecy::SecretString;
use std::{path::PathBuf, sync::Arc, time::Duration};
use tracing::info;

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub redis_url: Option<SecretString>,
    pub store_command_timeout: Duration,
    pub store_probe_interval: Duration,
    pub sweep_interval: Duration,
    pub otp_ttl_seconds: u64,
    pub otp_max_attempts: u32,
    pub otp_resend_cooldown_seconds: u64,
    pub session_ttl_seconds: u64,
    pub form_rate_limit: RateLimitPolicy,
    pub verify_rate_limit: RateLimitPolicy,
    pub smtp: Option<SmtpConfig>,
    pub recipient_email: String,
    pub submissions_file: PathBuf,
    pub fallback_dir: PathBuf,
    pub secure_cookies: bool,
}

/// Execute the server action.
/// # Errors
/// Returns an error if the Redis URL or SMTP settings are invalid, or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    log_startup_args(&args);

    let fallback = MemoryStore::new();
    let sweeper = fallback.spawn_sweeper(args.sweep_interval);

    let stores = match &args.redis_url {
        Some(url) => {
            let config = RedisStoreConfig::new(url.clone())
                .with_command_timeout(args.store_command_timeout)
                .with_probe_interval(args.store_probe_interval);
            let primary: Arc<dyn EphemeralStore> = Arc::new(RedisStore::connect(config).await?);
            DualStore::new(primary, fallback)
        }
        None => DualStore::memory_only(fallback),
    };

    let mailer: Arc<dyn Mailer> = match &args.smtp {
        Some(config) => Arc::new(SmtpMailer::new(config).context("Invalid SMTP configuration")?),
        None => Arc::new(LogMailer),
    };

    let otp_config = OtpConfig::default()
        .with_ttl_seconds(args.otp_ttl_seconds)
        .with_max_attempts(args.otp_max_attempts)
        .with_resend_cooldown_seconds(args.otp_resend_cooldown_seconds);

    let flow = ContactFlow::new(
        stores.clone(),
        mailer,
        Arc::new(JsonFileSubmissionStore::new(args.submissions_file)),
        args.recipient_email,
    )
    .with_otp(OtpManager::new(stores.clone(), otp_config))
    .with_rate_limiter(
        RateLimiter::new(stores.clone())
            .with_form_submit(args.form_rate_limit)
            .with_otp_verify(args.verify_rate_limit),
    )
    .with_sessions(SessionStore::new(stores).with_ttl_seconds(args.session_ttl_seconds))
    .with_fallback_dir(args.fallback_dir);

    let state = AppState::new(flow).with_secure_cookies(args.secure_cookies);
    let result = api::new(args.port, state).await;

    sweeper.shutdown();
    telemetry::shutdown_tracer();

    result
}

fn log_startup_args(args: &Args) {
    let entries = [
        ("listen", format!("tcp:{}", args.port)),
        (
            "store",
            args.redis_url.as_ref().map_or_else(
                || "memory".to_string(),
                |url| RedisStoreConfig::new(url.clone()).redacted_url(),
            ),
        ),
        (
            "store_timeout",
            format!("{}ms", args.store_command_timeout.as_millis()),
        ),
        ("otp_ttl", format!("{}s", args.otp_ttl_seconds)),
        ("otp_max_attempts", args.otp_max_attempts.to_string()),
        (
            "otp_resend_cooldown",
            format!("{}s", args.otp_resend_cooldown_seconds),
        ),
        ("session_ttl", format!("{}s", args.session_ttl_seconds)),
        (
            "form_rate_limit",
            format!(
                "{}/{}s",
                args.form_rate_limit.limit, args.form_rate_limit.window_seconds
            ),
        ),
        (
            "verify_rate_limit",
            format!(
                "{}/{}s",
                args.verify_rate_limit.limit, args.verify_rate_limit.window_seconds
            ),
        ),
        (
            "mailer",
            args.smtp.as_ref().map_or_else(
                || "log".to_string(),
                |smtp| format!("smtp://{}:{}", smtp.host(), smtp.port()),
            ),
        ),
        ("recipient", args.recipient_email.clone()),
        ("submissions_file", args.submissions_file.display().to_string()),
        ("fallback_dir", args.fallback_dir.display().to_string()),
        ("secure_cookies", args.secure_cookies.to_string()),
    ];
    log_entries("Startup configuration", &entries);
}

fn log_entries(title: &str, entries: &[(&str, String)]) {
    let max_key_len = entries.iter().map(|(key, _)| key.len()).max().unwrap_or(0);
    let mut message = format!(
        "{} {} - {}\n\n{title}:",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        short_commit(crate::GIT_COMMIT_HASH)
    );
    for (key, value) in entries {
        let padding = " ".repeat(max_key_len.saturating_sub(key.len()));
        let _ =
            std::fmt::Write::write_fmt(&mut message, format_args!("\n  {key}:{padding} {value}"));
    }
    info!("{message}");
}

fn short_commit(hash: &str) -> String {
    let trimmed = hash.trim();
    if trimmed.len() > 7 {
        trimmed[..7].to_string()
    } else {
        trimmed.to_string()
    }
}
