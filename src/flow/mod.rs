//! Contact form orchestration.
//!
//! ```text
//! Idle ──submit──▶ AwaitingCode ──verify(ok)──▶ Verified ──▶ saved + notified
//!                   │  ▲    │
//!                   │  └────┘ resend (new code, attempts reset, cooldown)
//!                   ├──verify(expired)──────▶ Idle (pending form discarded)
//!                   ├──verify(too many)─────▶ Idle (pending form discarded)
//!                   └──cancel───────────────▶ Idle
//! ```
//!
//! Rate limits are checked before any code work. Delivery and persistence
//! failures after a successful verification leave a copy of the rendered
//! notification in the fallback directory.

mod messages;

use crate::mailer::{DeliveryError, EmailMessage, Mailer};
use crate::metrics::{Metric, Metrics};
use crate::otp::{OtpManager, OtpConfig, ResendError, VerifyOutcome};
use crate::rate_limit::{RateLimitDecision, RateLimitScope, RateLimiter};
use crate::session::{ContactForm, SessionStore};
use crate::store::{DualStore, StoreError};
use crate::submissions::{PersistenceError, SubmissionStore};
use regex::Regex;
use secrecy::ExposeSecret;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

const DEFAULT_FALLBACK_DIR: &str = "submissions";
const MAX_COMMENT_CHARS: usize = 500;

#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    #[error("too many requests, please try again later")]
    RateLimited,
    #[error("{0}")]
    Invalid(String),
    #[error("the form has expired, please submit it again")]
    SessionExpired,
    #[error("please wait {remaining_seconds}s before requesting a new code")]
    Cooldown { remaining_seconds: u64 },
    #[error("{source}")]
    Delivery {
        source: DeliveryError,
        saved_locally: bool,
    },
    #[error("failed to record submission: {source}")]
    Persistence {
        source: PersistenceError,
        saved_locally: bool,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<ResendError> for FlowError {
    fn from(err: ResendError) -> Self {
        match err {
            ResendError::Cooldown { remaining_seconds } => Self::Cooldown { remaining_seconds },
            ResendError::Store(err) => Self::Store(err),
        }
    }
}

/// Result of a verification step that did not fail outright.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VerifyStep {
    Submitted { submission_id: String },
    InvalidCode { remaining: u32 },
    Expired,
    TooManyAttempts,
    NotFound,
}

#[derive(Clone)]
pub struct ContactFlow {
    stores: DualStore,
    otp: OtpManager,
    limiter: RateLimiter,
    sessions: SessionStore,
    mailer: Arc<dyn Mailer>,
    submissions: Arc<dyn SubmissionStore>,
    metrics: Metrics,
    recipient: String,
    fallback_dir: PathBuf,
}

impl std::fmt::Debug for ContactFlow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContactFlow")
            .field("stores", &self.stores)
            .field("mailer", &self.mailer.kind())
            .field("recipient", &self.recipient)
            .field("fallback_dir", &self.fallback_dir)
            .finish_non_exhaustive()
    }
}

impl ContactFlow {
    #[must_use]
    pub fn new(
        stores: DualStore,
        mailer: Arc<dyn Mailer>,
        submissions: Arc<dyn SubmissionStore>,
        recipient: String,
    ) -> Self {
        Self {
            otp: OtpManager::new(stores.clone(), OtpConfig::default()),
            limiter: RateLimiter::new(stores.clone()),
            sessions: SessionStore::new(stores.clone()),
            metrics: Metrics::new(stores.primary_handle()),
            stores,
            mailer,
            submissions,
            recipient,
            fallback_dir: PathBuf::from(DEFAULT_FALLBACK_DIR),
        }
    }

    #[must_use]
    pub fn with_otp(mut self, otp: OtpManager) -> Self {
        self.otp = otp;
        self
    }

    #[must_use]
    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    #[must_use]
    pub fn with_sessions(mut self, sessions: SessionStore) -> Self {
        self.sessions = sessions;
        self
    }

    #[must_use]
    pub fn with_fallback_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.fallback_dir = dir.into();
        self
    }

    #[must_use]
    pub fn stores(&self) -> &DualStore {
        &self.stores
    }

    #[must_use]
    pub fn mailer_kind(&self) -> &'static str {
        self.mailer.kind()
    }

    #[must_use]
    pub fn session_ttl_seconds(&self) -> u64 {
        self.sessions.ttl_seconds()
    }

    #[must_use]
    pub fn submissions(&self) -> &dyn SubmissionStore {
        self.submissions.as_ref()
    }

    async fn admit(&self, scope: RateLimitScope, client_ip: &str) -> Result<(), FlowError> {
        match self.limiter.check(scope, client_ip).await? {
            RateLimitDecision::Allowed => Ok(()),
            RateLimitDecision::Limited => {
                warn!(scope = %scope, client_ip, "rate limited");
                Err(FlowError::RateLimited)
            }
        }
    }

    /// Hold the form for `session_id` and email a fresh code to its address.
    ///
    /// # Errors
    /// [`FlowError::RateLimited`], [`FlowError::Invalid`] for missing fields,
    /// [`FlowError::Delivery`] when the code cannot be emailed.
    #[instrument(skip(self, form))]
    pub async fn submit(
        &self,
        client_ip: &str,
        session_id: &str,
        form: &ContactForm,
    ) -> Result<String, FlowError> {
        self.admit(RateLimitScope::FormSubmit, client_ip).await?;

        let form = form.trimmed();
        validate(&form)?;

        self.sessions.open(session_id).begin(&form).await?;
        let code = self.otp.issue(&form.email).await?;
        self.metrics.track(Metric::OtpGenerated).await;

        let message = messages::otp_email(
            &form.email,
            code.expose_secret(),
            self.otp.config().ttl_seconds(),
        );
        if let Err(source) = self.mailer.send(&message).await {
            error!("failed to send verification code: {source}");
            self.metrics.track(Metric::OtpEmailFailed).await;
            return Err(FlowError::Delivery {
                source,
                saved_locally: false,
            });
        }
        self.metrics.track(Metric::OtpEmailSent).await;
        self.metrics.track(Metric::FormToOtpSuccess).await;
        info!("verification code sent");
        Ok(form.email)
    }

    /// Check a code and, once verified, persist the pending form and notify
    /// the recipient.
    ///
    /// # Errors
    /// [`FlowError::RateLimited`], [`FlowError::Invalid`],
    /// [`FlowError::SessionExpired`] when no matching form is pending, and
    /// [`FlowError::Persistence`]/[`FlowError::Delivery`] after verification.
    #[instrument(skip(self, code))]
    pub async fn verify(
        &self,
        client_ip: &str,
        session_id: &str,
        email: &str,
        code: &str,
    ) -> Result<VerifyStep, FlowError> {
        self.admit(RateLimitScope::OtpVerify, client_ip).await?;

        let email = email.trim();
        let code = code.trim();
        if email.is_empty() || code.is_empty() {
            return Err(FlowError::Invalid(
                "email and verification code are required".to_string(),
            ));
        }

        let session = self.sessions.open(session_id);
        match self.otp.verify(email, code).await? {
            VerifyOutcome::Verified => {
                self.metrics.track(Metric::OtpVerifiedSuccess).await;
            }
            VerifyOutcome::InvalidCode { remaining } => {
                self.metrics.track(Metric::OtpVerificationFailed).await;
                return Ok(VerifyStep::InvalidCode { remaining });
            }
            VerifyOutcome::TooManyAttempts => {
                self.metrics.track(Metric::OtpTooManyAttempts).await;
                session.clear().await?;
                return Ok(VerifyStep::TooManyAttempts);
            }
            VerifyOutcome::Expired => {
                session.clear().await?;
                return Ok(VerifyStep::Expired);
            }
            VerifyOutcome::NotFound => return Ok(VerifyStep::NotFound),
        }

        let Some(form) = session.fetch_for(email).await? else {
            return Err(FlowError::SessionExpired);
        };
        let submission_id = self.finalize(&form).await?;
        session.clear().await?;
        Ok(VerifyStep::Submitted { submission_id })
    }

    async fn finalize(&self, form: &ContactForm) -> Result<String, FlowError> {
        let receipt = match self.submissions.save(form).await {
            Ok(receipt) => receipt,
            Err(source) => {
                error!("failed to record submission: {source}");
                self.metrics.track(Metric::FormSubmissionFailed).await;
                let message = messages::notification_email(&self.recipient, "unrecorded", form);
                let saved_locally = self.save_locally(form, &message).await;
                return Err(FlowError::Persistence {
                    source,
                    saved_locally,
                });
            }
        };

        let message = messages::notification_email(&self.recipient, &receipt.id, form);
        if let Err(source) = self.mailer.send(&message).await {
            error!(submission_id = %receipt.id, "failed to send notification: {source}");
            self.metrics.track(Metric::FormSubmissionFailed).await;
            let saved_locally = self.save_locally(form, &message).await;
            return Err(FlowError::Delivery {
                source,
                saved_locally,
            });
        }

        self.metrics.track(Metric::FormSubmissionSuccess).await;
        info!(submission_id = %receipt.id, storage = receipt.storage, "submission completed");
        Ok(receipt.id)
    }

    /// Write the rendered notification to the fallback directory.
    async fn save_locally(&self, form: &ContactForm, message: &EmailMessage) -> bool {
        let path = fallback_path(&self.fallback_dir, form);
        if let Err(err) = tokio::fs::create_dir_all(&self.fallback_dir).await {
            error!(dir = %self.fallback_dir.display(), "failed to create fallback directory: {err}");
            return false;
        }
        match tokio::fs::write(&path, &message.html_body).await {
            Ok(()) => {
                info!(path = %path.display(), "submission saved locally");
                true
            }
            Err(err) => {
                error!(path = %path.display(), "failed to save submission locally: {err}");
                false
            }
        }
    }

    /// Replace the pending code for the form held by `session_id`.
    ///
    /// # Errors
    /// [`FlowError::SessionExpired`] when no form is pending for `email`,
    /// [`FlowError::Cooldown`] inside the resend window,
    /// [`FlowError::Delivery`] when the code cannot be emailed.
    #[instrument(skip(self))]
    pub async fn resend(&self, session_id: &str, email: &str) -> Result<(), FlowError> {
        let email = email.trim();
        if email.is_empty() {
            return Err(FlowError::Invalid("email is required".to_string()));
        }
        if self.sessions.open(session_id).fetch_for(email).await?.is_none() {
            return Err(FlowError::SessionExpired);
        }

        let code = self.otp.resend(email).await?;
        self.metrics.track(Metric::OtpGenerated).await;

        let message = messages::otp_email(email, code.expose_secret(), self.otp.config().ttl_seconds());
        if let Err(source) = self.mailer.send(&message).await {
            error!("failed to resend verification code: {source}");
            self.metrics.track(Metric::OtpResendFailed).await;
            return Err(FlowError::Delivery {
                source,
                saved_locally: false,
            });
        }
        self.metrics.track(Metric::OtpEmailSent).await;
        self.metrics.track(Metric::OtpResent).await;
        Ok(())
    }

    /// Discard the pending form and any code issued for it.
    ///
    /// # Errors
    /// Returns a store error when both backends fail.
    #[instrument(skip(self))]
    pub async fn cancel(&self, session_id: &str) -> Result<(), FlowError> {
        let session = self.sessions.open(session_id);
        if let Some(form) = session.fetch().await? {
            self.otp.revoke(&form.email).await?;
        }
        session.clear().await?;
        Ok(())
    }

    /// Drop the pending form held by `session_id`, leaving any issued code alone.
    ///
    /// # Errors
    /// Returns a store error when both backends fail.
    pub async fn discard_session(&self, session_id: &str) -> Result<(), FlowError> {
        self.sessions.open(session_id).clear().await?;
        Ok(())
    }
}

fn validate(form: &ContactForm) -> Result<(), FlowError> {
    let mut problems = Vec::new();
    if form.first_name.is_empty() || form.last_name.is_empty() {
        problems.push("first and last name are required");
    }
    if form.email.is_empty() {
        problems.push("email is required");
    } else if !valid_email(&form.email) {
        problems.push("email is not valid");
    }
    if form.comments.is_empty() {
        problems.push("message is required");
    } else if form.comments.chars().count() > MAX_COMMENT_CHARS {
        problems.push("message must not exceed 500 characters");
    }
    if problems.is_empty() {
        Ok(())
    } else {
        Err(FlowError::Invalid(problems.join("; ")))
    }
}

fn valid_email(email: &str) -> bool {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").is_ok_and(|re| re.is_match(email))
}

fn file_safe(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

fn fallback_path(dir: &Path, form: &ContactForm) -> PathBuf {
    dir.join(format!(
        "comments_{}_{}.txt",
        file_safe(&form.first_name),
        file_safe(&form.last_name)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailer::MemoryMailer;
    use crate::otp::CodeGenerator;
    use crate::store::testing::FlakyStore;
    use crate::store::{EphemeralStore, MemoryStore};
    use crate::submissions::MemorySubmissionStore;

    struct FixedCode;

    impl CodeGenerator for FixedCode {
        fn generate(&self, _length: usize) -> String {
            "123456".to_string()
        }
    }

    struct Harness {
        flow: ContactFlow,
        mailer: MemoryMailer,
        submissions: MemorySubmissionStore,
        store: MemoryStore,
        fallback_dir: PathBuf,
    }

    fn harness() -> Harness {
        let store = MemoryStore::new();
        let stores = DualStore::memory_only(store.clone());
        let mailer = MemoryMailer::new();
        let submissions = MemorySubmissionStore::new();
        let fallback_dir = std::env::temp_dir().join(format!("contactgate-flow-{}", ulid::Ulid::new()));
        let flow = ContactFlow::new(
            stores.clone(),
            Arc::new(mailer.clone()),
            Arc::new(submissions.clone()),
            "team@x.com".to_string(),
        )
        .with_otp(OtpManager::new(stores, OtpConfig::default()).with_generator(Arc::new(FixedCode)))
        .with_fallback_dir(&fallback_dir);
        Harness {
            flow,
            mailer,
            submissions,
            store,
            fallback_dir,
        }
    }

    fn form() -> ContactForm {
        ContactForm {
            first_name: "Ada".to_string(),
            last_name: "Lovelace".to_string(),
            phone: "+302101234567".to_string(),
            email: "a@x.com".to_string(),
            comments: "Hello".to_string(),
        }
    }

    #[tokio::test]
    async fn happy_path_submits_once() {
        let h = harness();
        let email = h.flow.submit("1.2.3.4", "s1", &form()).await.expect("submit");
        assert_eq!(email, "a@x.com");
        let otp_mail = h.mailer.last_to("a@x.com").expect("otp email");
        assert!(otp_mail.html_body.contains("123456"));

        let step = h
            .flow
            .verify("1.2.3.4", "s1", "a@x.com", "123456")
            .await
            .expect("verify");
        assert_eq!(step, VerifyStep::Submitted {
            submission_id: "000001".to_string()
        });
        let notification = h.mailer.last_to("team@x.com").expect("notification");
        assert!(notification.subject.contains("#000001"));
        assert_eq!(h.submissions.len().await, 1);
        assert!(!h.store.exists("session:s1").await.expect("exists"));

        let replay = h
            .flow
            .verify("1.2.3.4", "s1", "a@x.com", "123456")
            .await
            .expect("verify");
        assert_eq!(replay, VerifyStep::NotFound);
        assert_eq!(h.submissions.len().await, 1);
    }

    #[tokio::test]
    async fn submit_requires_fields() {
        let h = harness();
        let mut incomplete = form();
        incomplete.last_name = "  ".to_string();
        incomplete.comments = String::new();
        let err = h.flow.submit("ip", "s1", &incomplete).await.expect_err("invalid");
        assert_eq!(
            err.to_string(),
            "first and last name are required; message is required"
        );
        assert!(h.mailer.outbox().is_empty());

        let mut malformed = form();
        malformed.email = "ada at example".to_string();
        let err = h.flow.submit("ip", "s1", &malformed).await.expect_err("invalid");
        assert_eq!(err.to_string(), "email is not valid");

        let mut long = form();
        long.comments = "x".repeat(501);
        assert!(matches!(
            h.flow.submit("ip", "s1", &long).await,
            Err(FlowError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn submit_is_rate_limited_per_ip() {
        let h = harness();
        for _ in 0..10 {
            h.flow.submit("9.9.9.9", "s1", &form()).await.expect("submit");
        }
        assert!(matches!(
            h.flow.submit("9.9.9.9", "s1", &form()).await,
            Err(FlowError::RateLimited)
        ));
        h.flow.submit("8.8.8.8", "s2", &form()).await.expect("other ip");
    }

    #[tokio::test]
    async fn otp_delivery_failure_is_reported() {
        let h = harness();
        h.mailer.set_failing(true);
        assert!(matches!(
            h.flow.submit("ip", "s1", &form()).await,
            Err(FlowError::Delivery {
                saved_locally: false,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn wrong_codes_then_lockout_clears_session() {
        let h = harness();
        h.flow.submit("ip", "s1", &form()).await.expect("submit");

        assert_eq!(
            h.flow.verify("ip", "s1", "a@x.com", "000000").await.expect("verify"),
            VerifyStep::InvalidCode { remaining: 2 }
        );
        assert_eq!(
            h.flow.verify("ip", "s1", "a@x.com", "000001").await.expect("verify"),
            VerifyStep::InvalidCode { remaining: 1 }
        );
        assert_eq!(
            h.flow.verify("ip", "s1", "a@x.com", "000002").await.expect("verify"),
            VerifyStep::TooManyAttempts
        );
        assert!(!h.store.exists("session:s1").await.expect("exists"));
        assert!(h.submissions.is_empty().await);
    }

    #[tokio::test]
    async fn verified_code_without_pending_form_expires_session() {
        let h = harness();
        h.flow.submit("ip", "s1", &form()).await.expect("submit");
        assert!(matches!(
            h.flow.verify("ip", "other-session", "a@x.com", "123456").await,
            Err(FlowError::SessionExpired)
        ));
        assert!(h.submissions.is_empty().await);
    }

    #[tokio::test]
    async fn verify_requires_email_and_code() {
        let h = harness();
        assert!(matches!(
            h.flow.verify("ip", "s1", "a@x.com", " ").await,
            Err(FlowError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn verify_is_rate_limited_per_ip() {
        let h = harness();
        for _ in 0..15 {
            h.flow
                .verify("ip", "s1", "a@x.com", "000000")
                .await
                .expect("verify");
        }
        assert!(matches!(
            h.flow.verify("ip", "s1", "a@x.com", "000000").await,
            Err(FlowError::RateLimited)
        ));
    }

    #[tokio::test]
    async fn notification_failure_writes_fallback_file() {
        let h = harness();
        h.flow.submit("ip", "s1", &form()).await.expect("submit");
        h.mailer.set_failing(true);

        let err = h
            .flow
            .verify("ip", "s1", "a@x.com", "123456")
            .await
            .expect_err("delivery");
        assert!(matches!(err, FlowError::Delivery {
            saved_locally: true,
            ..
        }));

        let path = h.fallback_dir.join("comments_Ada_Lovelace.txt");
        let body = tokio::fs::read_to_string(&path).await.expect("fallback file");
        assert!(body.starts_with("Submission ID: #000001"));
        let _ = tokio::fs::remove_dir_all(&h.fallback_dir).await;
    }

    #[tokio::test(start_paused = true)]
    async fn resend_enforces_session_and_cooldown() {
        let h = harness();
        assert!(matches!(
            h.flow.resend("s1", "a@x.com").await,
            Err(FlowError::SessionExpired)
        ));

        h.flow.submit("ip", "s1", &form()).await.expect("submit");
        assert!(matches!(
            h.flow.resend("s1", "b@x.com").await,
            Err(FlowError::SessionExpired)
        ));
        assert!(matches!(
            h.flow.resend("s1", "a@x.com").await,
            Err(FlowError::Cooldown { remaining_seconds }) if remaining_seconds > 0
        ));

        tokio::time::advance(std::time::Duration::from_secs(31)).await;
        h.flow.resend("s1", "a@x.com").await.expect("resend");
        assert_eq!(h.mailer.outbox().len(), 2);
    }

    #[tokio::test]
    async fn cancel_discards_form_and_code() {
        let h = harness();
        h.flow.submit("ip", "s1", &form()).await.expect("submit");
        h.flow.cancel("s1").await.expect("cancel");

        assert!(!h.store.exists("session:s1").await.expect("exists"));
        assert_eq!(
            h.flow.verify("ip", "s1", "a@x.com", "123456").await.expect("verify"),
            VerifyStep::NotFound
        );
    }

    #[tokio::test]
    async fn form_resubmitted_during_outage_is_verified_after_recovery() {
        let primary = FlakyStore::new();
        let stores = DualStore::new(Arc::new(primary.clone()), MemoryStore::new());
        let mailer = MemoryMailer::new();
        let submissions = MemorySubmissionStore::new();
        let flow = ContactFlow::new(
            stores.clone(),
            Arc::new(mailer.clone()),
            Arc::new(submissions.clone()),
            "team@x.com".to_string(),
        )
        .with_otp(OtpManager::new(stores, OtpConfig::default()).with_generator(Arc::new(FixedCode)));

        flow.submit("ip", "s1", &form()).await.expect("submit");
        primary.set_down(true);
        let mut second = form();
        second.email = "b@x.com".to_string();
        flow.submit("ip", "s1", &second).await.expect("submit during outage");
        primary.set_down(false);

        assert!(matches!(
            flow.verify("ip", "s1", "b@x.com", "123456").await,
            Ok(VerifyStep::Submitted { .. })
        ));
        assert_eq!(submissions.len().await, 1);
        assert!(mailer.last_to("team@x.com").is_some());
        assert!(!primary.exists("session:s1").await.expect("exists"));
    }

    #[tokio::test]
    async fn discarded_session_keeps_the_code() {
        let h = harness();
        h.flow.submit("ip", "s1", &form()).await.expect("submit");
        h.flow.discard_session("s1").await.expect("discard");

        assert!(!h.store.exists("session:s1").await.expect("exists"));
        assert!(h.store.exists("otp:a@x.com").await.expect("exists"));
    }

    #[test]
    fn fallback_path_is_file_safe() {
        let mut form = form();
        form.last_name = "../../etc/passwd".to_string();
        let path = fallback_path(Path::new("/srv/submissions"), &form);
        assert_eq!(
            path,
            PathBuf::from("/srv/submissions/comments_Ada_______etc_passwd.txt")
        );
    }
}
