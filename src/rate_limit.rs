//! Fixed-window rate limiting on top of the ephemeral store.
//!
//! The counter for `(scope, identifier)` is read first and only incremented
//! when still below the ceiling. Under concurrent load at the boundary the
//! read and the increment can interleave, so a window may admit slightly more
//! than its limit. Scopes never share counters.

use crate::store::{DualStore, EphemeralStore, StoreResult, with_fallback};
use tracing::{debug, instrument, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Limited,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimitScope {
    FormSubmit,
    OtpVerify,
}

impl RateLimitScope {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FormSubmit => "form-submit",
            Self::OtpVerify => "otp-verify",
        }
    }
}

impl std::fmt::Display for RateLimitScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ceiling and window length for one scope.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub limit: u64,
    pub window_seconds: u64,
}

impl RateLimitPolicy {
    #[must_use]
    pub const fn new(limit: u64, window_seconds: u64) -> Self {
        Self {
            limit,
            window_seconds,
        }
    }
}

const DEFAULT_FORM_SUBMIT: RateLimitPolicy = RateLimitPolicy::new(10, 60 * 60);
const DEFAULT_OTP_VERIFY: RateLimitPolicy = RateLimitPolicy::new(15, 5 * 60);

#[derive(Clone, Debug)]
pub struct RateLimiter {
    stores: DualStore,
    form_submit: RateLimitPolicy,
    otp_verify: RateLimitPolicy,
}

impl RateLimiter {
    #[must_use]
    pub fn new(stores: DualStore) -> Self {
        Self {
            stores,
            form_submit: DEFAULT_FORM_SUBMIT,
            otp_verify: DEFAULT_OTP_VERIFY,
        }
    }

    #[must_use]
    pub fn with_form_submit(mut self, policy: RateLimitPolicy) -> Self {
        self.form_submit = policy;
        self
    }

    #[must_use]
    pub fn with_otp_verify(mut self, policy: RateLimitPolicy) -> Self {
        self.otp_verify = policy;
        self
    }

    #[must_use]
    pub fn policy(&self, scope: RateLimitScope) -> RateLimitPolicy {
        match scope {
            RateLimitScope::FormSubmit => self.form_submit,
            RateLimitScope::OtpVerify => self.otp_verify,
        }
    }

    /// Admit one event for `identifier` under the configured policy of `scope`.
    ///
    /// # Errors
    /// Returns a store error only when both backends fail.
    pub async fn check(
        &self,
        scope: RateLimitScope,
        identifier: &str,
    ) -> StoreResult<RateLimitDecision> {
        let policy = self.policy(scope);
        self.admit(scope.as_str(), identifier, policy.limit, policy.window_seconds)
            .await
    }

    /// # Errors
    /// Returns a store error only when both backends fail.
    #[instrument(skip(self))]
    pub async fn admit(
        &self,
        scope: &str,
        identifier: &str,
        limit: u64,
        window_seconds: u64,
    ) -> StoreResult<RateLimitDecision> {
        if limit == 0 {
            return Ok(RateLimitDecision::Limited);
        }
        let key = format!("rate_limit:{scope}:{identifier}");
        let decision = with_fallback!(self.stores, "rate_limit.admit", |store| {
            admit_on(store, &key, limit, window_seconds).await
        })?;
        if decision == RateLimitDecision::Limited {
            debug!("rate limited");
        }
        Ok(decision)
    }
}

async fn admit_on(
    store: &dyn EphemeralStore,
    key: &str,
    limit: u64,
    window_seconds: u64,
) -> StoreResult<RateLimitDecision> {
    let Some(raw) = store.get(key).await? else {
        store.set(key, "1", Some(window_seconds)).await?;
        return Ok(RateLimitDecision::Allowed);
    };

    let Ok(count) = raw.parse::<u64>() else {
        warn!(key, "discarding unreadable rate limit counter");
        store.set(key, "1", Some(window_seconds)).await?;
        return Ok(RateLimitDecision::Allowed);
    };
    if count >= limit {
        return Ok(RateLimitDecision::Limited);
    }

    if store.increment(key, 1).await? == 1 {
        // window lapsed between the read and the increment
        store.expire(key, window_seconds).await?;
    }
    Ok(RateLimitDecision::Allowed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::store::testing::FlakyStore;
    use std::sync::Arc;
    use std::time::Duration;

    fn limiter() -> (RateLimiter, MemoryStore) {
        let store = MemoryStore::new();
        (
            RateLimiter::new(DualStore::memory_only(store.clone())),
            store,
        )
    }

    #[test]
    fn default_policies() {
        let (limiter, _) = limiter();
        assert_eq!(
            limiter.policy(RateLimitScope::FormSubmit),
            RateLimitPolicy::new(10, 3600)
        );
        assert_eq!(
            limiter.policy(RateLimitScope::OtpVerify),
            RateLimitPolicy::new(15, 300)
        );
        assert_eq!(RateLimitScope::FormSubmit.to_string(), "form-submit");
    }

    #[tokio::test(start_paused = true)]
    async fn admits_up_to_limit_then_resets() {
        let (limiter, _) = limiter();
        for _ in 0..10 {
            assert_eq!(
                limiter.admit("form-submit", "1.2.3.4", 10, 3600).await,
                Ok(RateLimitDecision::Allowed)
            );
        }
        assert_eq!(
            limiter.admit("form-submit", "1.2.3.4", 10, 3600).await,
            Ok(RateLimitDecision::Limited)
        );

        tokio::time::advance(Duration::from_secs(3601)).await;
        assert_eq!(
            limiter.admit("form-submit", "1.2.3.4", 10, 3600).await,
            Ok(RateLimitDecision::Allowed)
        );
    }

    #[tokio::test]
    async fn rejection_does_not_increment() {
        let (limiter, store) = limiter();
        for _ in 0..5 {
            limiter
                .admit("otp-verify", "1.2.3.4", 2, 300)
                .await
                .expect("admit");
        }
        assert_eq!(
            store.get("rate_limit:otp-verify:1.2.3.4").await,
            Ok(Some("2".to_string()))
        );
    }

    #[tokio::test]
    async fn scopes_and_identifiers_are_independent() {
        let (limiter, _) = limiter();
        assert_eq!(
            limiter.admit("form-submit", "1.2.3.4", 1, 60).await,
            Ok(RateLimitDecision::Allowed)
        );
        assert_eq!(
            limiter.admit("form-submit", "1.2.3.4", 1, 60).await,
            Ok(RateLimitDecision::Limited)
        );
        assert_eq!(
            limiter.admit("otp-verify", "1.2.3.4", 1, 60).await,
            Ok(RateLimitDecision::Allowed)
        );
        assert_eq!(
            limiter.admit("form-submit", "5.6.7.8", 1, 60).await,
            Ok(RateLimitDecision::Allowed)
        );
    }

    #[tokio::test]
    async fn check_uses_scope_policy() {
        let (limiter, _) = limiter();
        let limiter = limiter.with_otp_verify(RateLimitPolicy::new(1, 60));
        assert_eq!(
            limiter.check(RateLimitScope::OtpVerify, "ip").await,
            Ok(RateLimitDecision::Allowed)
        );
        assert_eq!(
            limiter.check(RateLimitScope::OtpVerify, "ip").await,
            Ok(RateLimitDecision::Limited)
        );
        assert_eq!(
            limiter.check(RateLimitScope::FormSubmit, "ip").await,
            Ok(RateLimitDecision::Allowed)
        );
    }

    #[tokio::test]
    async fn zero_limit_always_rejects() {
        let (limiter, store) = limiter();
        assert_eq!(
            limiter.admit("form-submit", "ip", 0, 60).await,
            Ok(RateLimitDecision::Limited)
        );
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn unreadable_counter_restarts_window() {
        let (limiter, store) = limiter();
        store
            .set("rate_limit:form-submit:ip", "garbage", None)
            .await
            .expect("seed");
        assert_eq!(
            limiter.admit("form-submit", "ip", 3, 60).await,
            Ok(RateLimitDecision::Allowed)
        );
        assert_eq!(
            store.get("rate_limit:form-submit:ip").await,
            Ok(Some("1".to_string()))
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn limit_is_approximately_enforced_under_contention() {
        let (limiter, _) = limiter();
        let mut tasks = Vec::new();
        for _ in 0..64 {
            let limiter = limiter.clone();
            tasks.push(tokio::spawn(async move {
                limiter.admit("form-submit", "ip", 10, 3600).await
            }));
        }
        let mut admitted = 0;
        for task in tasks {
            if task.await.expect("join") == Ok(RateLimitDecision::Allowed) {
                admitted += 1;
            }
        }
        assert!(admitted >= 10, "admitted {admitted}");
        assert!(admitted < 64, "admitted {admitted}");
    }

    #[tokio::test]
    async fn outage_counts_in_fallback() {
        let primary = FlakyStore::new();
        primary.set_down(true);
        let fallback = MemoryStore::new();
        let limiter = RateLimiter::new(DualStore::new(Arc::new(primary), fallback.clone()));

        for _ in 0..3 {
            assert_eq!(
                limiter.admit("otp-verify", "ip", 3, 300).await,
                Ok(RateLimitDecision::Allowed)
            );
        }
        assert_eq!(
            limiter.admit("otp-verify", "ip", 3, 300).await,
            Ok(RateLimitDecision::Limited)
        );
        assert_eq!(
            fallback.get("rate_limit:otp-verify:ip").await,
            Ok(Some("3".to_string()))
        );
    }
}
