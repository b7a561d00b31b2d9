//! Ephemeral key/value storage with per-key expiry.
//!
//! Two interchangeable backends implement [`EphemeralStore`]:
//!
//! - [`RedisStore`] delegates to Redis, which expires keys natively and runs
//!   increments atomically server-side.
//! - [`MemoryStore`] keeps a process-wide map behind a single mutex. Every entry
//!   carries its own deadline and a sweeper evicts stale entries periodically.
//!   It gives no cross-process consistency.
//!
//! Backend failures never escape as panics. Every call returns
//! [`StoreError::Unavailable`] instead so the layer above can switch to its
//! in-process fallback (see [`DualStore`]).
//!
//! ## Key Patterns
//!
//! ```text
//! otp:{email}                        → hash: code, attempts, created_at, expires_at
//! otp_resend:{email}                 → hash: issued_at, claims (TTL = cooldown)
//! rate_limit:{scope}:{identifier}    → fixed window counter
//! session:{id}                       → pending submission JSON
//! metrics:{name}:{YYYY-MM-DD:HH}     → hourly counter
//! ```

mod memory;
mod redis;

pub use self::memory::{MemoryStore, SweeperHandle};
pub use self::redis::{RedisStore, RedisStoreConfig};

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("wrong value type for key {key}")]
    WrongType { key: String },
    #[error("value for key {key} is not an integer")]
    NotInteger { key: String },
}

impl StoreError {
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Capability set shared by every ephemeral backend.
///
/// TTLs are whole seconds. A `set` without TTL clears any previous expiry,
/// increments keep whatever expiry the key already has.
#[async_trait]
pub trait EphemeralStore: Send + Sync {
    /// Short backend name used in logs and health output.
    fn backend(&self) -> &'static str;

    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl_seconds: Option<u64>) -> StoreResult<()>;

    async fn hash_get(&self, key: &str, field: &str) -> StoreResult<Option<String>>;

    async fn hash_get_all(&self, key: &str) -> StoreResult<HashMap<String, String>>;

    async fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> StoreResult<()>;

    /// Atomically add `delta` to a hash field and return the new value.
    async fn hash_increment(&self, key: &str, field: &str, delta: i64) -> StoreResult<i64>;

    /// Returns `false` when the key does not exist.
    async fn expire(&self, key: &str, ttl_seconds: u64) -> StoreResult<bool>;

    /// Returns the number of keys removed.
    async fn delete(&self, keys: &[&str]) -> StoreResult<u64>;

    async fn exists(&self, key: &str) -> StoreResult<bool>;

    /// Atomically add `delta` to an integer value and return the new value.
    async fn increment(&self, key: &str, delta: i64) -> StoreResult<i64>;

    /// Cheap liveness probe used by health reporting.
    async fn ping(&self) -> StoreResult<()>;
}

/// Primary backend paired with an in-process fallback.
///
/// Callers run a whole logical operation against [`DualStore::primary`] and,
/// when it reports [`StoreError::Unavailable`], rerun it against
/// [`DualStore::fallback`]. State written to the fallback stays local to this
/// process.
#[derive(Clone)]
pub struct DualStore {
    primary: Arc<dyn EphemeralStore>,
    fallback: MemoryStore,
    shared: bool,
}

impl DualStore {
    #[must_use]
    pub fn new(primary: Arc<dyn EphemeralStore>, fallback: MemoryStore) -> Self {
        Self {
            primary,
            fallback,
            shared: false,
        }
    }

    /// Run everything against one in-process map; the fallback is never consulted.
    #[must_use]
    pub fn memory_only(store: MemoryStore) -> Self {
        Self {
            primary: Arc::new(store.clone()),
            fallback: store,
            shared: true,
        }
    }

    /// False when primary and fallback are the same map.
    #[must_use]
    pub fn has_separate_fallback(&self) -> bool {
        !self.shared
    }

    #[must_use]
    pub fn primary(&self) -> &dyn EphemeralStore {
        self.primary.as_ref()
    }

    #[must_use]
    pub fn fallback(&self) -> &MemoryStore {
        &self.fallback
    }

    #[must_use]
    pub fn primary_handle(&self) -> Arc<dyn EphemeralStore> {
        Arc::clone(&self.primary)
    }
}

impl std::fmt::Debug for DualStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DualStore")
            .field("primary", &self.primary.backend())
            .field("fallback", &self.fallback.backend())
            .finish()
    }
}

/// Runs `$op` against the primary backend and reruns it against the
/// in-process fallback when the primary reports itself unavailable.
macro_rules! with_fallback {
    ($stores:expr, $what:literal, |$store:ident| $op:expr) => {{
        let result = {
            let $store: &dyn $crate::store::EphemeralStore = $stores.primary();
            $op
        };
        match result {
            Err($crate::store::StoreError::Unavailable(reason)) => {
                tracing::warn!(
                    operation = $what,
                    %reason,
                    "primary store unavailable, using in-process fallback"
                );
                let $store: &dyn $crate::store::EphemeralStore = $stores.fallback();
                $op
            }
            other => other,
        }
    }};
}

pub(crate) use with_fallback;


#[cfg(test)]
mod tests {
    use super::testing::FlakyStore;
    use super::*;

    #[tokio::test]
    async fn with_fallback_prefers_primary() {
        let primary = FlakyStore::new();
        let stores = DualStore::new(Arc::new(primary.clone()), MemoryStore::new());

        let written: StoreResult<()> =
            with_fallback!(stores, "test", |store| store.set("k", "v", None).await);
        assert_eq!(written, Ok(()));
        assert_eq!(primary.get("k").await, Ok(Some("v".to_string())));
        assert_eq!(stores.fallback().get("k").await, Ok(None));
    }

    #[tokio::test]
    async fn with_fallback_switches_when_primary_is_down() {
        let primary = FlakyStore::new();
        primary.set_down(true);
        let stores = DualStore::new(Arc::new(primary.clone()), MemoryStore::new());

        let written: StoreResult<()> =
            with_fallback!(stores, "test", |store| store.set("k", "v", None).await);
        assert_eq!(written, Ok(()));
        assert_eq!(stores.fallback().get("k").await, Ok(Some("v".to_string())));

        primary.set_down(false);
        assert_eq!(primary.get("k").await, Ok(None));
    }

    #[test]
    fn unavailable_is_the_only_degrading_error() {
        assert!(StoreError::Unavailable("down".to_string()).is_unavailable());
        assert!(!StoreError::WrongType { key: "k".to_string() }.is_unavailable());
        assert!(!StoreError::NotInteger { key: "k".to_string() }.is_unavailable());
    }

    #[test]
    fn memory_only_shares_one_map() {
        let stores = DualStore::memory_only(MemoryStore::new());
        assert_eq!(stores.primary().backend(), "memory");
        assert!(!stores.has_separate_fallback());
        assert!(DualStore::new(Arc::new(MemoryStore::new()), MemoryStore::new()).has_separate_fallback());
        assert_eq!(format!("{stores:?}"), "DualStore { primary: \"memory\", fallback: \"memory\" }");
    }
}
