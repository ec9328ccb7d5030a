//! Audit trail for epochs
//!
//! The sink is a constructor dependency of the activities, never a global.
//! `InMemoryAuditSink` chains every event to its predecessor with SHA-256 so
//! any later edit of the trail is detectable.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use epoch_core::EpochId;
use epoch_schema::PhaseId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// What an audit event describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuditEventKind {
    Transition,
    Vote,
    Blockers,
    /// Refused move or reject signal
    Rejection,
    SliceCompleted,
    Cancelled,
}

impl AuditEventKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transition => "transition",
            Self::Vote => "vote",
            Self::Blockers => "blockers",
            Self::Rejection => "rejection",
            Self::SliceCompleted => "slice-completed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for AuditEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One audited occurrence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub epoch_id: EpochId,
    /// Phase the epoch was in when the event happened
    pub phase: PhaseId,
    pub kind: AuditEventKind,
    pub detail: String,
    pub at: DateTime<Utc>,
}

impl AuditEvent {
    #[must_use]
    pub fn new(
        epoch_id: EpochId,
        phase: PhaseId,
        kind: AuditEventKind,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            epoch_id,
            phase,
            kind,
            detail: detail.into(),
            at: Utc::now(),
        }
    }
}

/// Audit sink failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuditError {
    /// Backend temporarily unreachable
    #[error("audit sink unavailable: {0}")]
    Unavailable(String),

    /// Chain verification failed at `index`
    #[error("audit chain broken at entry {index}")]
    IntegrityViolation { index: usize },
}

/// Destination for audit events
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Append an event
    async fn record(&self, event: AuditEvent) -> Result<(), AuditError>;

    /// Events of one epoch, optionally limited to one phase, in record order
    async fn query(
        &self,
        epoch_id: EpochId,
        phase: Option<PhaseId>,
    ) -> Result<Vec<AuditEvent>, AuditError>;
}

#[derive(Debug, Clone)]
struct ChainedEvent {
    event: AuditEvent,
    prev_hash: [u8; 32],
    hash: [u8; 32],
}

/// Hash-chained, process-local audit sink
#[derive(Debug, Default)]
pub struct InMemoryAuditSink {
    inner: Mutex<Vec<ChainedEvent>>,
}

impl InMemoryAuditSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event, in record order
    #[must_use]
    pub fn events(&self) -> Vec<AuditEvent> {
        self.inner.lock().iter().map(|c| c.event.clone()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Hex digest of the newest entry (all zeros when empty)
    #[must_use]
    pub fn head(&self) -> String {
        hex::encode(self.inner.lock().last().map_or([0u8; 32], |c| c.hash))
    }

    /// Recompute the chain
    ///
    /// # Errors
    /// `IntegrityViolation` at the first entry that does not match.
    pub fn verify_integrity(&self) -> Result<(), AuditError> {
        let guard = self.inner.lock();
        let mut prev = [0u8; 32];
        for (index, entry) in guard.iter().enumerate() {
            if entry.prev_hash != prev || entry.hash != compute_hash(&entry.event, &prev) {
                return Err(AuditError::IntegrityViolation { index });
            }
            prev = entry.hash;
        }
        Ok(())
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn record(&self, event: AuditEvent) -> Result<(), AuditError> {
        let mut guard = self.inner.lock();
        let prev_hash = guard.last().map_or([0u8; 32], |c| c.hash);
        let hash = compute_hash(&event, &prev_hash);
        tracing::debug!(
            "Audit {} {} at {}: {}",
            event.epoch_id,
            event.kind,
            event.phase,
            event.detail
        );
        guard.push(ChainedEvent {
            event,
            prev_hash,
            hash,
        });
        Ok(())
    }

    async fn query(
        &self,
        epoch_id: EpochId,
        phase: Option<PhaseId>,
    ) -> Result<Vec<AuditEvent>, AuditError> {
        Ok(self
            .inner
            .lock()
            .iter()
            .map(|c| &c.event)
            .filter(|e| e.epoch_id == epoch_id && phase.map_or(true, |p| e.phase == p))
            .cloned()
            .collect())
    }
}

fn compute_hash(event: &AuditEvent, prev_hash: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(event.epoch_id.to_string().as_bytes());
    hasher.update([0]);
    hasher.update(event.phase.as_str().as_bytes());
    hasher.update([0]);
    hasher.update(event.kind.as_str().as_bytes());
    hasher.update([0]);
    hasher.update(event.detail.as_bytes());
    hasher.update([0]);
    hasher.update(event.at.to_rfc3339().as_bytes());
    hasher.update(prev_hash);
    hasher.finalize().into()
}
