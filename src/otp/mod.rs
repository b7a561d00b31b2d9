//! One-time code issuance and verification.
//!
//! A record lives under `otp:{email}` as a hash (`code`, `attempts`,
//! `created_at`, `expires_at`) with a TTL equal to the code lifetime. Every
//! issuance replaces the previous record and opens a resend cooldown window
//! under `otp_resend:{email}`.
//!
//! Successful verification deletes the record, and only the caller whose
//! delete removed it observes [`VerifyOutcome::Verified`].

mod code;

pub use code::{CodeGenerator, RandomDigits};

use crate::store::{DualStore, EphemeralStore, StoreError, StoreResult, with_fallback};
use chrono::Utc;
use secrecy::SecretString;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

const DEFAULT_TTL_SECONDS: u64 = 5 * 60;
const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_RESEND_COOLDOWN_SECONDS: u64 = 30;
const DEFAULT_CODE_LENGTH: usize = 6;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OtpConfig {
    ttl_seconds: u64,
    max_attempts: u32,
    resend_cooldown_seconds: u64,
    code_length: usize,
}

impl Default for OtpConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: DEFAULT_TTL_SECONDS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            resend_cooldown_seconds: DEFAULT_RESEND_COOLDOWN_SECONDS,
            code_length: DEFAULT_CODE_LENGTH,
        }
    }
}

impl OtpConfig {
    #[must_use]
    pub fn with_ttl_seconds(mut self, seconds: u64) -> Self {
        self.ttl_seconds = seconds;
        self
    }

    /// Values below 1 are raised to 1.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    #[must_use]
    pub fn with_resend_cooldown_seconds(mut self, seconds: u64) -> Self {
        self.resend_cooldown_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_code_length(mut self, length: usize) -> Self {
        self.code_length = length;
        self
    }

    #[must_use]
    pub fn ttl_seconds(&self) -> u64 {
        self.ttl_seconds
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    #[must_use]
    pub fn resend_cooldown_seconds(&self) -> u64 {
        self.resend_cooldown_seconds
    }

    #[must_use]
    pub fn code_length(&self) -> usize {
        self.code_length
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VerifyOutcome {
    Verified,
    InvalidCode { remaining: u32 },
    Expired,
    TooManyAttempts,
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResendError {
    #[error("a new code can be requested in {remaining_seconds}s")]
    Cooldown { remaining_seconds: u64 },
    #[error(transparent)]
    Store(#[from] StoreError),
}

fn record_key(email: &str) -> String {
    format!("otp:{email}")
}

fn cooldown_key(email: &str) -> String {
    format!("otp_resend:{email}")
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn seconds_to_millis(seconds: u64) -> i64 {
    i64::try_from(seconds)
        .unwrap_or(i64::MAX)
        .saturating_mul(1000)
}

fn parse_millis(raw: Option<String>) -> Option<i64> {
    raw.and_then(|value| value.parse::<i64>().ok())
}

/// Whole seconds left in a cooldown window, never less than 1 while the
/// window is still open in the store.
fn cooldown_remaining(issued_at: Option<i64>, now: i64, cooldown_seconds: u64) -> u64 {
    let Some(issued_at) = issued_at else {
        return cooldown_seconds.max(1);
    };
    let left = seconds_to_millis(cooldown_seconds).saturating_sub(now.saturating_sub(issued_at));
    let seconds = u64::try_from(left).unwrap_or(0).div_ceil(1000);
    seconds.max(1)
}

async fn issued_at(store: &dyn EphemeralStore, key: &str) -> StoreResult<Option<i64>> {
    Ok(parse_millis(store.hash_get(key, "created_at").await?))
}

#[derive(Clone)]
pub struct OtpManager {
    stores: DualStore,
    config: OtpConfig,
    generator: Arc<dyn CodeGenerator>,
}

impl std::fmt::Debug for OtpManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OtpManager")
            .field("stores", &self.stores)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl OtpManager {
    #[must_use]
    pub fn new(stores: DualStore, config: OtpConfig) -> Self {
        Self {
            stores,
            config,
            generator: Arc::new(RandomDigits),
        }
    }

    #[must_use]
    pub fn with_generator(mut self, generator: Arc<dyn CodeGenerator>) -> Self {
        self.generator = generator;
        self
    }

    #[must_use]
    pub fn config(&self) -> &OtpConfig {
        &self.config
    }

    /// Issue a fresh code for `email`, replacing any live one.
    ///
    /// # Errors
    /// Returns a [`StoreError`] only when both backends fail.
    #[instrument(skip(self))]
    pub async fn issue(&self, email: &str) -> StoreResult<SecretString> {
        let code = self.generator.generate(self.config.code_length);
        with_fallback!(self.stores, "otp.issue", |store| {
            self.issue_on(store, email, &code).await
        })?;
        debug!("one-time code issued");
        Ok(SecretString::from(code))
    }

    async fn issue_on(&self, store: &dyn EphemeralStore, email: &str, code: &str) -> StoreResult<()> {
        let key = record_key(email);
        let created_at = now_millis();
        let expires_at = created_at.saturating_add(seconds_to_millis(self.config.ttl_seconds));

        store.delete(&[&key]).await?;
        store
            .hash_set(
                &key,
                &[
                    ("code", code.to_string()),
                    ("attempts", "0".to_string()),
                    ("created_at", created_at.to_string()),
                    ("expires_at", expires_at.to_string()),
                ],
            )
            .await?;
        store.expire(&key, self.config.ttl_seconds).await?;

        let cooldown = cooldown_key(email);
        store
            .hash_set(
                &cooldown,
                &[
                    ("claims", "1".to_string()),
                    ("issued_at", created_at.to_string()),
                ],
            )
            .await?;
        store
            .expire(&cooldown, self.config.resend_cooldown_seconds)
            .await?;
        Ok(())
    }

    /// Issue a replacement code unless the cooldown window is still open.
    ///
    /// # Errors
    /// [`ResendError::Cooldown`] while the window is open, [`ResendError::Store`]
    /// when both backends fail.
    #[instrument(skip(self))]
    pub async fn resend(&self, email: &str) -> Result<SecretString, ResendError> {
        let remaining = with_fallback!(self.stores, "otp.resend", |store| {
            self.claim_resend_on(store, email).await
        })?;
        if let Some(remaining_seconds) = remaining {
            debug!(remaining_seconds, "resend refused during cooldown");
            return Err(ResendError::Cooldown { remaining_seconds });
        }
        Ok(self.issue(email).await?)
    }

    /// Claims the cooldown window atomically. Returns the seconds left when
    /// another issuance already holds it.
    ///
    /// A window whose TTL was lost is judged by `issued_at`: once it is older
    /// than the cooldown, exactly one caller renews it.
    async fn claim_resend_on(
        &self,
        store: &dyn EphemeralStore,
        email: &str,
    ) -> StoreResult<Option<u64>> {
        let key = cooldown_key(email);
        let cooldown_seconds = self.config.resend_cooldown_seconds;
        let claims = store.hash_increment(&key, "claims", 1).await?;
        if claims == 1 {
            self.open_window(store, &key).await?;
            return Ok(None);
        }

        let now = now_millis();
        let Some(issued_at) = parse_millis(store.hash_get(&key, "issued_at").await?) else {
            self.open_window(store, &key).await?;
            return Ok(Some(cooldown_seconds.max(1)));
        };
        if now.saturating_sub(issued_at) < seconds_to_millis(cooldown_seconds) {
            return Ok(Some(cooldown_remaining(Some(issued_at), now, cooldown_seconds)));
        }

        let renewal = format!("renewed_{issued_at}");
        if store.hash_increment(&key, &renewal, 1).await? == 1 {
            warn!("cooldown window outlived its ttl, renewing");
            store.hash_set(&key, &[("claims", "1".to_string())]).await?;
            self.open_window(store, &key).await?;
            return Ok(None);
        }
        let issued_at = parse_millis(store.hash_get(&key, "issued_at").await?);
        Ok(Some(cooldown_remaining(issued_at, now, cooldown_seconds)))
    }

    async fn open_window(&self, store: &dyn EphemeralStore, key: &str) -> StoreResult<()> {
        store
            .hash_set(key, &[("issued_at", now_millis().to_string())])
            .await?;
        store
            .expire(key, self.config.resend_cooldown_seconds)
            .await?;
        Ok(())
    }

    /// Check `submitted` against the live code for `email`.
    ///
    /// When both backends hold a record the newer one is authoritative and the
    /// older copy is discarded.
    ///
    /// # Errors
    /// Returns a [`StoreError`] only when both backends fail.
    #[instrument(skip(self, submitted))]
    pub async fn verify(&self, email: &str, submitted: &str) -> StoreResult<VerifyOutcome> {
        let key = record_key(email);
        let primary = self.stores.primary();
        let fallback: &dyn EphemeralStore = self.stores.fallback();
        let fallback_issued = issued_at(fallback, &key).await?;

        let primary_issued = match issued_at(primary, &key).await {
            Ok(value) => value,
            Err(StoreError::Unavailable(reason)) => {
                warn!(
                    operation = "otp.verify",
                    %reason,
                    "primary store unavailable, using in-process fallback"
                );
                return self.verify_on(fallback, &key, submitted).await;
            }
            Err(err) => return Err(err),
        };

        if fallback_issued > primary_issued {
            if primary_issued.is_some() {
                discard_stale(primary, &key).await;
            }
            return self.verify_on(fallback, &key, submitted).await;
        }
        if fallback_issued.is_some() && fallback_issued < primary_issued {
            discard_stale(fallback, &key).await;
        }

        match self.verify_on(primary, &key, submitted).await {
            Err(StoreError::Unavailable(reason)) => {
                warn!(
                    operation = "otp.verify",
                    %reason,
                    "primary store unavailable, using in-process fallback"
                );
                self.verify_on(fallback, &key, submitted).await
            }
            other => other,
        }
    }

    async fn verify_on(
        &self,
        store: &dyn EphemeralStore,
        key: &str,
        submitted: &str,
    ) -> StoreResult<VerifyOutcome> {
        let record = store.hash_get_all(key).await?;
        let Some(code) = record.get("code") else {
            if !record.is_empty() {
                store.delete(&[key]).await?;
            }
            return Ok(VerifyOutcome::NotFound);
        };

        let expires_at = parse_millis(record.get("expires_at").cloned());
        if expires_at.is_some_and(|deadline| now_millis() >= deadline) {
            store.delete(&[key]).await?;
            return Ok(VerifyOutcome::Expired);
        }

        if codes_match(code, submitted) {
            let removed = store.delete(&[key]).await?;
            return Ok(if removed > 0 {
                VerifyOutcome::Verified
            } else {
                VerifyOutcome::NotFound
            });
        }

        let attempts = store.hash_increment(key, "attempts", 1).await?;
        // the record may have been consumed or evicted between the read and the increment
        if store.hash_get(key, "code").await?.is_none() {
            store.delete(&[key]).await?;
            return Ok(VerifyOutcome::NotFound);
        }

        let max_attempts = i64::from(self.config.max_attempts);
        if attempts >= max_attempts {
            store.delete(&[key]).await?;
            return Ok(VerifyOutcome::TooManyAttempts);
        }
        let remaining = u32::try_from(max_attempts - attempts).unwrap_or(0);
        Ok(VerifyOutcome::InvalidCode { remaining })
    }

    /// Drop any pending code for `email` on both backends.
    ///
    /// # Errors
    /// Returns a [`StoreError`] when a backend reports anything other than
    /// being unavailable.
    #[instrument(skip(self))]
    pub async fn revoke(&self, email: &str) -> StoreResult<()> {
        let key = record_key(email);
        match self.stores.primary().delete(&[&key]).await {
            Ok(_) => {}
            Err(StoreError::Unavailable(reason)) => {
                warn!(operation = "otp.revoke", %reason, "primary store unavailable");
            }
            Err(err) => return Err(err),
        }
        self.stores.fallback().delete(&[&key]).await?;
        Ok(())
    }
}

/// Compares every byte regardless of where the first mismatch is.
fn codes_match(expected: &str, submitted: &str) -> bool {
    let (expected, submitted) = (expected.as_bytes(), submitted.as_bytes());
    expected.len() == submitted.len()
        && expected
            .iter()
            .zip(submitted)
            .fold(0u8, |diff, (a, b)| diff | (a ^ b))
            == 0
}

async fn discard_stale(store: &dyn EphemeralStore, key: &str) {
    if let Err(err) = store.delete(&[key]).await {
        warn!(backend = store.backend(), "failed to discard stale code: {err}");
    }
}
