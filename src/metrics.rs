//! Hourly and daily event counters kept in the primary store.
//!
//! Counters live under `metrics:{name}:{YYYY-MM-DD:HH}` (kept 7 days) and
//! `metrics:{name}:{YYYY-MM-DD}` (kept 30 days). They are best effort: when
//! the primary store is unavailable the event is dropped.

use crate::store::EphemeralStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::debug;

const HOUR_KEY_TTL_SECONDS: u64 = 7 * 24 * 60 * 60;
const DAY_KEY_TTL_SECONDS: u64 = 30 * 24 * 60 * 60;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Metric {
    OtpGenerated,
    OtpVerifiedSuccess,
    OtpVerificationFailed,
    OtpTooManyAttempts,
    OtpEmailSent,
    OtpEmailFailed,
    OtpResent,
    OtpResendFailed,
    FormToOtpSuccess,
    FormSubmissionSuccess,
    FormSubmissionFailed,
}

impl Metric {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::OtpGenerated => "otp_generated",
            Self::OtpVerifiedSuccess => "otp_verified_success",
            Self::OtpVerificationFailed => "otp_verification_failed",
            Self::OtpTooManyAttempts => "otp_too_many_attempts",
            Self::OtpEmailSent => "otp_email_sent",
            Self::OtpEmailFailed => "otp_email_failed",
            Self::OtpResent => "otp_resent",
            Self::OtpResendFailed => "otp_resend_failed",
            Self::FormToOtpSuccess => "form_to_otp_success",
            Self::FormSubmissionSuccess => "form_submission_success",
            Self::FormSubmissionFailed => "form_submission_failed",
        }
    }
}

fn keys(metric: Metric, at: DateTime<Utc>) -> (String, String) {
    (
        format!("metrics:{}:{}", metric.name(), at.format("%Y-%m-%d:%H")),
        format!("metrics:{}:{}", metric.name(), at.format("%Y-%m-%d")),
    )
}

#[derive(Clone)]
pub struct Metrics {
    store: Arc<dyn EphemeralStore>,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("store", &self.store.backend())
            .finish()
    }
}

impl Metrics {
    #[must_use]
    pub fn new(store: Arc<dyn EphemeralStore>) -> Self {
        Self { store }
    }

    pub async fn track(&self, metric: Metric) {
        let (hour_key, day_key) = keys(metric, Utc::now());
        for (key, ttl) in [(hour_key, HOUR_KEY_TTL_SECONDS), (day_key, DAY_KEY_TTL_SECONDS)] {
            let result = match self.store.increment(&key, 1).await {
                Ok(_) => self.store.expire(&key, ttl).await.map(|_| ()),
                Err(err) => Err(err),
            };
            if let Err(err) = result {
                debug!(metric = metric.name(), "metric dropped: {err}");
                return;
            }
        }
    }
}
