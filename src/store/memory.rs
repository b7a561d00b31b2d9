//! In-process fallback backend.

use super::{EphemeralStore, StoreError, StoreResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval};
use tracing::debug;

#[derive(Debug, Clone)]
enum Value {
    Text(String),
    Hash(HashMap<String, String>),
}

#[derive(Debug)]
struct Entry {
    value: Value,
    deadline: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.deadline.is_none_or(|deadline| deadline > now)
    }
}

/// Process-local map guarded by one mutex.
///
/// Every operation, including increments and sweeps, takes the same lock for
/// the duration of that single operation, which makes increments atomic with
/// respect to everything else on this instance. Clones share the map.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        // A panic while holding the lock cannot leave an entry half-written,
        // so a poisoned map is still consistent.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Evict every entry whose deadline has passed. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        before - entries.len()
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.lock().values().filter(|entry| entry.is_live(now)).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run [`MemoryStore::sweep`] on a fixed cadence until the handle is shut down or dropped.
    #[must_use]
    pub fn spawn_sweeper(&self, every: Duration) -> SweeperHandle {
        let store = self.clone();
        let every = if every.is_zero() {
            Duration::from_secs(1)
        } else {
            every
        };
        let task = tokio::spawn(async move {
            let mut ticker = interval(every);
            loop {
                ticker.tick().await;
                let removed = store.sweep();
                if removed > 0 {
                    debug!(removed, "swept expired in-process entries");
                }
            }
        });
        SweeperHandle { task }
    }
}

/// Owns the background sweep task; stopping it is explicit or happens on drop.
#[derive(Debug)]
pub struct SweeperHandle {
    task: JoinHandle<()>,
}

impl SweeperHandle {
    pub fn shutdown(self) {
        drop(self);
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn deadline_after(now: Instant, ttl_seconds: u64) -> Instant {
    now + Duration::from_secs(ttl_seconds)
}

/// Fetch a live entry, dropping it first if it has already expired.
fn live<'a>(
    entries: &'a mut HashMap<String, Entry>,
    key: &str,
    now: Instant,
) -> Option<&'a mut Entry> {
    if entries.get(key).is_some_and(|entry| !entry.is_live(now)) {
        entries.remove(key);
    }
    entries.get_mut(key)
}

fn parse_integer(key: &str, raw: &str) -> StoreResult<i64> {
    raw.parse::<i64>().map_err(|_| StoreError::NotInteger {
        key: key.to_string(),
    })
}

fn add(key: &str, current: i64, delta: i64) -> StoreResult<i64> {
    current.checked_add(delta).ok_or_else(|| StoreError::NotInteger {
        key: key.to_string(),
    })
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::WrongType {
        key: key.to_string(),
    }
}

#[async_trait]
impl EphemeralStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let now = Instant::now();
        let mut entries = self.lock();
        match live(&mut entries, key, now) {
            None => Ok(None),
            Some(Entry {
                value: Value::Text(text),
                ..
            }) => Ok(Some(text.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl_seconds: Option<u64>) -> StoreResult<()> {
        let now = Instant::now();
        self.lock().insert(
            key.to_string(),
            Entry {
                value: Value::Text(value.to_string()),
                deadline: ttl_seconds.map(|ttl| deadline_after(now, ttl)),
            },
        );
        Ok(())
    }

    async fn hash_get(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        let now = Instant::now();
        let mut entries = self.lock();
        match live(&mut entries, key, now) {
            None => Ok(None),
            Some(Entry {
                value: Value::Hash(fields),
                ..
            }) => Ok(fields.get(field).cloned()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn hash_get_all(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let now = Instant::now();
        let mut entries = self.lock();
        match live(&mut entries, key, now) {
            None => Ok(HashMap::new()),
            Some(Entry {
                value: Value::Hash(fields),
                ..
            }) => Ok(fields.clone()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> StoreResult<()> {
        let now = Instant::now();
        let mut entries = self.lock();
        match live(&mut entries, key, now) {
            Some(Entry {
                value: Value::Hash(existing),
                ..
            }) => {
                for (field, value) in fields {
                    existing.insert((*field).to_string(), value.clone());
                }
            }
            Some(_) => return Err(wrong_type(key)),
            None => {
                let map = fields
                    .iter()
                    .map(|(field, value)| ((*field).to_string(), value.clone()))
                    .collect();
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: Value::Hash(map),
                        deadline: None,
                    },
                );
            }
        }
        Ok(())
    }

    async fn hash_increment(&self, key: &str, field: &str, delta: i64) -> StoreResult<i64> {
        let now = Instant::now();
        let mut entries = self.lock();
        match live(&mut entries, key, now) {
            Some(Entry {
                value: Value::Hash(existing),
                ..
            }) => {
                let current = match existing.get(field) {
                    Some(raw) => parse_integer(key, raw)?,
                    None => 0,
                };
                let next = add(key, current, delta)?;
                existing.insert(field.to_string(), next.to_string());
                Ok(next)
            }
            Some(_) => Err(wrong_type(key)),
            None => {
                let mut map = HashMap::new();
                map.insert(field.to_string(), delta.to_string());
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: Value::Hash(map),
                        deadline: None,
                    },
                );
                Ok(delta)
            }
        }
    }

    async fn expire(&self, key: &str, ttl_seconds: u64) -> StoreResult<bool> {
        let now = Instant::now();
        let mut entries = self.lock();
        match live(&mut entries, key, now) {
            Some(entry) => {
                entry.deadline = Some(deadline_after(now, ttl_seconds));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, keys: &[&str]) -> StoreResult<u64> {
        let now = Instant::now();
        let mut entries = self.lock();
        let mut removed = 0;
        for key in keys {
            if let Some(entry) = entries.remove(*key) {
                if entry.is_live(now) {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let now = Instant::now();
        let mut entries = self.lock();
        Ok(live(&mut entries, key, now).is_some())
    }

    async fn increment(&self, key: &str, delta: i64) -> StoreResult<i64> {
        let now = Instant::now();
        let mut entries = self.lock();
        match live(&mut entries, key, now) {
            Some(Entry {
                value: Value::Text(text),
                ..
            }) => {
                let next = add(key, parse_integer(key, text)?, delta)?;
                *text = next.to_string();
                Ok(next)
            }
            Some(_) => Err(wrong_type(key)),
            None => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: Value::Text(delta.to_string()),
                        deadline: None,
                    },
                );
                Ok(delta)
            }
        }
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    #[tokio::test]
    async fn get_set_round_trip() {
        let store = MemoryStore::new();
        assert_eq!(store.get("missing").await, Ok(None));
        store.set("k", "v", None).await.ok();
        assert_eq!(store.get("k").await, Ok(Some("v".to_string())));
        assert!(store.exists("k").await.unwrap_or(false));
    }

    #[tokio::test(start_paused = true)]
    async fn set_with_ttl_expires() {
        let store = MemoryStore::new();
        store.set("k", "v", Some(30)).await.ok();

        advance(Duration::from_secs(29)).await;
        assert_eq!(store.get("k").await, Ok(Some("v".to_string())));

        advance(Duration::from_secs(2)).await;
        assert_eq!(store.get("k").await, Ok(None));
        assert_eq!(store.exists("k").await, Ok(false));
    }

    #[tokio::test(start_paused = true)]
    async fn set_without_ttl_clears_previous_expiry() {
        let store = MemoryStore::new();
        store.set("k", "a", Some(5)).await.ok();
        store.set("k", "b", None).await.ok();

        advance(Duration::from_secs(60)).await;
        assert_eq!(store.get("k").await, Ok(Some("b".to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn increment_keeps_existing_ttl() {
        let store = MemoryStore::new();
        store.set("counter", "1", Some(10)).await.ok();
        assert_eq!(store.increment("counter", 1).await, Ok(2));

        advance(Duration::from_secs(11)).await;
        assert_eq!(store.get("counter").await, Ok(None));
        assert_eq!(store.increment("counter", 1).await, Ok(1));
    }

    #[tokio::test]
    async fn increment_rejects_non_integer_and_hashes() {
        let store = MemoryStore::new();
        store.set("word", "abc", None).await.ok();
        assert_eq!(
            store.increment("word", 1).await,
            Err(StoreError::NotInteger {
                key: "word".to_string()
            })
        );

        store.hash_set("h", &[("f", "1".to_string())]).await.ok();
        assert_eq!(
            store.increment("h", 1).await,
            Err(StoreError::WrongType {
                key: "h".to_string()
            })
        );
        assert_eq!(
            store.get("h").await,
            Err(StoreError::WrongType {
                key: "h".to_string()
            })
        );
    }

    #[tokio::test]
    async fn hash_operations() {
        let store = MemoryStore::new();
        store
            .hash_set("h", &[("code", "123456".to_string()), ("attempts", "0".to_string())])
            .await
            .ok();

        assert_eq!(store.hash_get("h", "code").await, Ok(Some("123456".to_string())));
        assert_eq!(store.hash_get("h", "nope").await, Ok(None));
        assert_eq!(store.hash_increment("h", "attempts", 1).await, Ok(1));
        assert_eq!(store.hash_increment("h", "attempts", 1).await, Ok(2));

        let all = store.hash_get_all("h").await.unwrap_or_default();
        assert_eq!(all.get("attempts").map(String::as_str), Some("2"));
        assert_eq!(all.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn expire_applies_to_existing_keys_only() {
        let store = MemoryStore::new();
        assert_eq!(store.expire("missing", 10).await, Ok(false));

        store.hash_set("h", &[("f", "v".to_string())]).await.ok();
        assert_eq!(store.expire("h", 10).await, Ok(true));

        // hash_set on a live hash keeps its deadline
        store.hash_set("h", &[("g", "w".to_string())]).await.ok();
        advance(Duration::from_secs(11)).await;
        assert_eq!(store.hash_get("h", "f").await, Ok(None));
    }

    #[tokio::test(start_paused = true)]
    async fn delete_counts_only_live_keys() {
        let store = MemoryStore::new();
        store.set("a", "1", None).await.ok();
        store.set("b", "1", Some(1)).await.ok();
        advance(Duration::from_secs(2)).await;

        assert_eq!(store.delete(&["a", "b", "c"]).await, Ok(1));
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_evicts_expired_entries() {
        let store = MemoryStore::new();
        store.set("short", "1", Some(1)).await.ok();
        store.set("long", "1", Some(100)).await.ok();
        store.set("forever", "1", None).await.ok();

        advance(Duration::from_secs(5)).await;
        assert_eq!(store.sweep(), 1);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_runs_until_shutdown() {
        let store = MemoryStore::new();
        store.set("short", "1", Some(1)).await.ok();

        let sweeper = store.spawn_sweeper(Duration::from_secs(10));
        advance(Duration::from_secs(11)).await;
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }

        assert_eq!(store.lock().len(), 0);
        sweeper.shutdown();
    }

    #[tokio::test]
    async fn clones_share_state() {
        let store = MemoryStore::new();
        let other = store.clone();
        store.set("k", "v", None).await.ok();
        assert_eq!(other.get("k").await, Ok(Some("v".to_string())));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_increments_are_not_lost() {
        let store = MemoryStore::new();
        let mut tasks = Vec::new();
        for _ in 0..64 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store.hash_increment("otp:a@x.com", "attempts", 1).await
            }));
        }
        for task in tasks {
            assert!(matches!(task.await, Ok(Ok(_))));
        }
        assert_eq!(
            store.hash_get("otp:a@x.com", "attempts").await,
            Ok(Some("64".to_string()))
        );
    }
}
