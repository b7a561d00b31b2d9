//! Pending contact form payloads held between submission and code confirmation.
//!
//! Each client context (the session cookie) owns at most one pending form,
//! stored as JSON under `session:{id}`. Starting a new submission overwrites
//! whatever was pending before.

use crate::store::{DualStore, EphemeralStore, StoreError, StoreResult};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const DEFAULT_SESSION_TTL_SECONDS: u64 = 24 * 60 * 60;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactForm {
    pub first_name: String,
    pub last_name: String,
    #[serde(default)]
    pub phone: String,
    pub email: String,
    pub comments: String,
}

impl ContactForm {
    #[must_use]
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }

    /// Copy with surrounding whitespace removed from every field.
    #[must_use]
    pub fn trimmed(&self) -> Self {
        Self {
            first_name: self.first_name.trim().to_string(),
            last_name: self.last_name.trim().to_string(),
            phone: self.phone.trim().to_string(),
            email: self.email.trim().to_string(),
            comments: self.comments.trim().to_string(),
        }
    }
}

/// Opens [`VerificationSession`]s that share one storage policy.
#[derive(Clone, Debug)]
pub struct SessionStore {
    stores: DualStore,
    ttl_seconds: u64,
}

impl SessionStore {
    #[must_use]
    pub fn new(stores: DualStore) -> Self {
        Self {
            stores,
            ttl_seconds: DEFAULT_SESSION_TTL_SECONDS,
        }
    }

    #[must_use]
    pub fn with_ttl_seconds(mut self, seconds: u64) -> Self {
        self.ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn ttl_seconds(&self) -> u64 {
        self.ttl_seconds
    }

    #[must_use]
    pub fn open(&self, session_id: &str) -> VerificationSession {
        VerificationSession {
            stores: self.stores.clone(),
            key: format!("session:{session_id}"),
            ttl_seconds: self.ttl_seconds,
        }
    }
}

#[derive(Clone, Debug)]
pub struct VerificationSession {
    stores: DualStore,
    key: String,
    ttl_seconds: u64,
}

/// Stored form plus the wall-clock millis it was written at.
#[derive(Debug, Serialize, Deserialize)]
struct Pending {
    #[serde(default)]
    created_at: i64,
    form: ContactForm,
}

impl VerificationSession {
    /// Hold `form` as the pending submission, replacing any previous one.
    ///
    /// # Errors
    /// Returns a store error only when both backends fail.
    pub async fn begin(&self, form: &ContactForm) -> StoreResult<()> {
        let payload = serde_json::to_string(&Pending {
            created_at: Utc::now().timestamp_millis(),
            form: form.clone(),
        })
        .map_err(|err| {
            StoreError::Unavailable(format!("failed to encode pending submission: {err}"))
        })?;

        match self
            .stores
            .primary()
            .set(&self.key, &payload, Some(self.ttl_seconds))
            .await
        {
            // an older copy written during an outage must not outlive this one
            Ok(()) if self.stores.has_separate_fallback() => {
                self.stores.fallback().delete(&[&self.key]).await?;
            }
            Ok(()) => {}
            Err(StoreError::Unavailable(reason)) => {
                warn!(
                    operation = "session.begin",
                    %reason,
                    "primary store unavailable, using in-process fallback"
                );
                self.stores
                    .fallback()
                    .set(&self.key, &payload, Some(self.ttl_seconds))
                    .await?;
            }
            Err(err) => return Err(err),
        }
        debug!(key = %self.key, "pending submission stored");
        Ok(())
    }

    /// Pending form. When both backends hold one, the newer copy wins and the
    /// older one is discarded.
    ///
    /// # Errors
    /// Returns a store error only when both backends fail.
    pub async fn fetch(&self) -> StoreResult<Option<ContactForm>> {
        let primary = self.stores.primary();
        if !self.stores.has_separate_fallback() {
            return Ok(self.fetch_from(primary).await?.map(|pending| pending.form));
        }
        let fallback: &dyn EphemeralStore = self.stores.fallback();
        let in_fallback = self.fetch_from(fallback).await?;

        let in_primary = match self.fetch_from(primary).await {
            Ok(pending) => pending,
            Err(StoreError::Unavailable(reason)) => {
                warn!(
                    operation = "session.fetch",
                    %reason,
                    "primary store unavailable, using in-process fallback"
                );
                return Ok(in_fallback.map(|pending| pending.form));
            }
            Err(err) => return Err(err),
        };

        Ok(match (in_primary, in_fallback) {
            (Some(older), Some(newer)) if newer.created_at >= older.created_at => {
                self.discard_stale(primary).await;
                Some(newer.form)
            }
            (Some(newer), Some(_)) => {
                self.discard_stale(fallback).await;
                Some(newer.form)
            }
            (primary, fallback) => primary.or(fallback).map(|pending| pending.form),
        })
    }

    /// Pending form, only when it was started for `email`.
    ///
    /// # Errors
    /// Returns a store error only when both backends fail.
    pub async fn fetch_for(&self, email: &str) -> StoreResult<Option<ContactForm>> {
        Ok(self.fetch().await?.filter(|form| form.email == email))
    }

    async fn fetch_from(&self, store: &dyn EphemeralStore) -> StoreResult<Option<Pending>> {
        let Some(raw) = store.get(&self.key).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(pending) => Ok(Some(pending)),
            Err(err) => {
                warn!(key = %self.key, "discarding unreadable pending submission: {err}");
                store.delete(&[&self.key]).await?;
                Ok(None)
            }
        }
    }

    async fn discard_stale(&self, store: &dyn EphemeralStore) {
        if let Err(err) = store.delete(&[&self.key]).await {
            warn!(backend = store.backend(), "failed to discard stale pending submission: {err}");
        }
    }

    /// Discard the pending submission on both backends.
    ///
    /// # Errors
    /// Returns a store error when a backend fails for a reason other than
    /// being unavailable.
    pub async fn clear(&self) -> StoreResult<()> {
        match self.stores.primary().delete(&[&self.key]).await {
            Ok(_) => {}
            Err(StoreError::Unavailable(reason)) => {
                warn!(operation = "session.clear", %reason, "primary store unavailable");
            }
            Err(err) => return Err(err),
        }
        self.stores.fallback().delete(&[&self.key]).await?;
        Ok(())
    }
}
