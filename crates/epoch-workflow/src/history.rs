//! Durable history journal
//!
//! Flows record every activity result and every received signal under a
//! deterministic key. Re-running a flow against the same journal replays the
//! committed entries instead of repeating side effects, so an interrupted
//! epoch resumes exactly where it stopped.
//!
//! Keys:
//! - `<seq>:activity:<name>` for activity results
//! - `<seq>:signal` for received signals
//! - `child:<visit>:<slice-id>` for completed slices, where `visit` is the
//!   transition sequence number at which the fan-out phase was entered

use crate::error::{ActivityError, WorkflowError};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// One committed journal entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub key: String,
    pub payload: Value,
    pub at: DateTime<Utc>,
}

/// Storage for run journals
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Committed payload for `key`, if any
    async fn load(&self, run_id: &str, key: &str) -> Result<Option<Value>, WorkflowError>;

    /// Commit a payload; the first commit of a key wins
    async fn commit(&self, run_id: &str, key: &str, payload: Value) -> Result<(), WorkflowError>;

    /// Every entry of a run, in commit order
    async fn events(&self, run_id: &str) -> Result<Vec<HistoryEvent>, WorkflowError>;
}

/// Entries of one run with a key index
#[derive(Debug, Default)]
struct RunJournal {
    events: Vec<HistoryEvent>,
    index: HashMap<String, usize>,
}

/// Process-local journal
#[derive(Debug, Default)]
pub struct InMemoryHistory {
    runs: DashMap<String, RunJournal>,
}

impl InMemoryHistory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries committed for a run
    #[must_use]
    pub fn len(&self, run_id: &str) -> usize {
        self.runs.get(run_id).map_or(0, |run| run.events.len())
    }

    /// Whether a run has no entries
    #[must_use]
    pub fn is_empty(&self, run_id: &str) -> bool {
        self.len(run_id) == 0
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistory {
    async fn load(&self, run_id: &str, key: &str) -> Result<Option<Value>, WorkflowError> {
        Ok(self.runs.get(run_id).and_then(|run| {
            run.index
                .get(key)
                .and_then(|&at| run.events.get(at))
                .map(|event| event.payload.clone())
        }))
    }

    async fn commit(&self, run_id: &str, key: &str, payload: Value) -> Result<(), WorkflowError> {
        let mut run = self.runs.entry(run_id.to_string()).or_default();
        if run.index.contains_key(key) {
            tracing::debug!("Run {} already committed {}", run_id, key);
            return Ok(());
        }
        let at = run.events.len();
        run.events.push(HistoryEvent {
            key: key.to_string(),
            payload,
            at: Utc::now(),
        });
        run.index.insert(key.to_string(), at);
        Ok(())
    }

    async fn events(&self, run_id: &str) -> Result<Vec<HistoryEvent>, WorkflowError> {
        Ok(self
            .runs
            .get(run_id)
            .map(|run| run.events.clone())
            .unwrap_or_default())
    }
}

/// Journal key for a completed slice of the fan-out entered at `visit`
#[must_use]
pub fn child_key(visit: u64, slice_id: &str) -> String {
    format!("child:{visit}:{slice_id}")
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Value, WorkflowError> {
    serde_json::to_value(value).map_err(|e| WorkflowError::History(e.to_string()))
}

pub(crate) fn decode<T: DeserializeOwned>(key: &str, value: Value) -> Result<T, WorkflowError> {
    serde_json::from_value(value)
        .map_err(|e| WorkflowError::History(format!("entry {key} does not decode: {e}")))
}

/// Replay-aware execution context of one run
pub struct WorkflowContext {
    run_id: String,
    store: Arc<dyn HistoryStore>,
    seq: u64,
    replayed: u64,
}

impl std::fmt::Debug for WorkflowContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowContext")
            .field("run_id", &self.run_id)
            .field("seq", &self.seq)
            .field("replayed", &self.replayed)
            .finish_non_exhaustive()
    }
}

impl WorkflowContext {
    #[must_use]
    pub fn new(run_id: impl Into<String>, store: Arc<dyn HistoryStore>) -> Self {
        Self {
            run_id: run_id.into(),
            store,
            seq: 0,
            replayed: 0,
        }
    }

    #[inline]
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    #[inline]
    #[must_use]
    pub fn store(&self) -> &Arc<dyn HistoryStore> {
        &self.store
    }

    /// Entries served from the journal so far
    #[inline]
    #[must_use]
    pub fn replayed(&self) -> u64 {
        self.replayed
    }

    /// Run an activity once per run
    ///
    /// A committed result is returned as-is; otherwise the activity runs
    /// under `policy` and its result is committed.
    ///
    /// # Errors
    /// The activity's final failure, classified by `WorkflowError::from_activity`.
    pub async fn activity<T, F, Fut>(
        &mut self,
        name: &str,
        policy: &RetryPolicy,
        op: F,
    ) -> Result<T, WorkflowError>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ActivityError>>,
    {
        let key = format!("{}:activity:{name}", self.seq + 1);

        if let Some(value) = self.store.load(&self.run_id, &key).await? {
            self.seq += 1;
            self.replayed += 1;
            tracing::debug!("Run {} replayed {}", self.run_id, key);
            return decode(&key, value);
        }

        let value = policy
            .execute(name, op)
            .await
            .map_err(|e| WorkflowError::from_activity(name, e))?;
        self.store.commit(&self.run_id, &key, encode(&value)?).await?;
        self.seq += 1;
        Ok(value)
    }

    /// Receive the next value of an external source, once per run
    ///
    /// The sequence number only advances once a value is committed.
    /// Dropping this future while it waits on a cancel-safe source loses
    /// nothing. Once a value has been taken the commit has to run to
    /// completion: a commit that landed before the drop is replayed by the
    /// next call, one that did not land loses the value.
    ///
    /// # Errors
    /// Journal failures.
    pub async fn receive<T, F, Fut>(&mut self, receive: F) -> Result<Option<T>, WorkflowError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Option<T>>,
    {
        let key = format!("{}:signal", self.seq + 1);

        if let Some(value) = self.store.load(&self.run_id, &key).await? {
            self.seq += 1;
            self.replayed += 1;
            tracing::debug!("Run {} replayed {}", self.run_id, key);
            return decode(&key, value).map(Some);
        }

        let Some(value) = receive().await else {
            return Ok(None);
        };
        self.store.commit(&self.run_id, &key, encode(&value)?).await?;
        self.seq += 1;
        Ok(Some(value))
    }

    /// Next received value, only if it is already in the journal
    ///
    /// Lets a flow catch up on values it received while waiting on something
    /// that no longer needs waiting for on replay.
    ///
    /// # Errors
    /// Journal failures.
    pub async fn received<T: DeserializeOwned>(&mut self) -> Result<Option<T>, WorkflowError> {
        let key = format!("{}:signal", self.seq + 1);
        let Some(value) = self.store.load(&self.run_id, &key).await? else {
            return Ok(None);
        };
        self.seq += 1;
        self.replayed += 1;
        tracing::debug!("Run {} replayed {}", self.run_id, key);
        decode(&key, value).map(Some)
    }
}
