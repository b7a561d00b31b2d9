//! Durable record of confirmed submissions.
//!
//! Submission ids are six-digit, zero-padded, and increase by one from the
//! highest id already stored.

use crate::session::ContactForm;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PersistenceError {
    #[error("failed to access {path}: {reason}")]
    Io { path: String, reason: String },
    #[error("submission index {path} is unreadable: {reason}")]
    Corrupt { path: String, reason: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionRecord {
    pub email: String,
    pub name: String,
    pub date: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubmissionReceipt {
    pub id: String,
    pub storage: &'static str,
}

#[async_trait]
pub trait SubmissionStore: Send + Sync {
    /// Persist a confirmed form and assign its id.
    ///
    /// # Errors
    /// Returns a [`PersistenceError`] when the record cannot be written.
    async fn save(&self, form: &ContactForm) -> Result<SubmissionReceipt, PersistenceError>;

    /// # Errors
    /// Returns a [`PersistenceError`] when the index cannot be read.
    async fn find(&self, id: &str) -> Result<Option<SubmissionRecord>, PersistenceError>;
}

fn next_id(records: &BTreeMap<String, SubmissionRecord>) -> String {
    let last = records
        .keys()
        .filter_map(|id| id.parse::<u64>().ok())
        .max()
        .unwrap_or(0);
    format!("{:06}", last + 1)
}

fn record_for(form: &ContactForm) -> SubmissionRecord {
    SubmissionRecord {
        email: form.email.clone(),
        name: form.full_name(),
        date: Utc::now(),
    }
}

/// Index kept as a pretty-printed JSON object in a single file.
#[derive(Debug)]
pub struct JsonFileSubmissionStore {
    path: PathBuf,
    // serializes read-modify-write cycles within this process
    lock: Mutex<()>,
}

impl JsonFileSubmissionStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, err: &std::io::Error) -> PersistenceError {
        PersistenceError::Io {
            path: self.path.display().to_string(),
            reason: err.to_string(),
        }
    }

    async fn load(&self) -> Result<BTreeMap<String, SubmissionRecord>, PersistenceError> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(BTreeMap::new());
            }
            Err(err) => return Err(self.io_error(&err)),
        };
        if raw.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&raw).map_err(|err| PersistenceError::Corrupt {
            path: self.path.display().to_string(),
            reason: err.to_string(),
        })
    }

    async fn store(&self, records: &BTreeMap<String, SubmissionRecord>) -> Result<(), PersistenceError> {
        let body = serde_json::to_string_pretty(records).map_err(|err| PersistenceError::Io {
            path: self.path.display().to_string(),
            reason: err.to_string(),
        })?;

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| self.io_error(&err))?;
        }

        let mut staging = self.path.clone().into_os_string();
        staging.push(".tmp");
        let staging = PathBuf::from(staging);
        tokio::fs::write(&staging, body)
            .await
            .map_err(|err| self.io_error(&err))?;
        tokio::fs::rename(&staging, &self.path)
            .await
            .map_err(|err| self.io_error(&err))
    }
}

#[async_trait]
impl SubmissionStore for JsonFileSubmissionStore {
    async fn save(&self, form: &ContactForm) -> Result<SubmissionReceipt, PersistenceError> {
        let _guard = self.lock.lock().await;
        let mut records = self.load().await?;
        let id = next_id(&records);
        records.insert(id.clone(), record_for(form));
        self.store(&records).await?;
        info!(submission_id = %id, path = %self.path.display(), "submission saved");
        Ok(SubmissionReceipt { id, storage: "json" })
    }

    async fn find(&self, id: &str) -> Result<Option<SubmissionRecord>, PersistenceError> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.remove(id))
    }
}

#[derive(Clone, Debug, Default)]
pub struct MemorySubmissionStore {
    records: Arc<Mutex<BTreeMap<String, SubmissionRecord>>>,
}

impl MemorySubmissionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}

#[async_trait]
impl SubmissionStore for MemorySubmissionStore {
    async fn save(&self, form: &ContactForm) -> Result<SubmissionReceipt, PersistenceError> {
        let mut records = self.records.lock().await;
        let id = next_id(&records);
        records.insert(id.clone(), record_for(form));
        debug!(submission_id = %id, "submission kept in memory");
        Ok(SubmissionReceipt {
            id,
            storage: "memory",
        })
    }

    async fn find(&self, id: &str) -> Result<Option<SubmissionRecord>, PersistenceError> {
        Ok(self.records.lock().await.get(id).cloned())
    }
}
