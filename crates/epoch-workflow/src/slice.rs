//! Parallel slice sub-flow
//!
//! The fan-out phase splits its work into slices decided once at phase
//! entry. Every slice runs as an independent child task; the phase finishes
//! at the join barrier, when every planned slice has reported completion.
//! - Completed slices are journaled per phase visit and are not re-run when
//!   the epoch resumes
//! - `Cancel` aborts every child still in flight
//! - A slice that fails after its retries cancels its siblings and fails
//!   the phase
//! - Any other signal received meanwhile is deferred to the next phase step

use crate::error::{ActivityError, WorkflowError};
use crate::history::{child_key, decode, encode, HistoryStore, WorkflowContext};
use crate::retry::RetryPolicy;
use crate::signal::{EpochSignal, SignalInbox};
use async_trait::async_trait;
use epoch_core::{EpochId, EpochState};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinSet;

/// Activity name used when journaling the slice plan
pub const PLAN_SLICES: &str = "plan_slices";

/// Slice identifier, unique within one fan-out
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SliceId(String);

impl SliceId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SliceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One unit of parallel work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceSpec {
    pub id: SliceId,
    pub description: String,
}

impl SliceSpec {
    #[must_use]
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: SliceId::new(id),
            description: description.into(),
        }
    }
}

/// What a finished slice reports
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceResult {
    pub id: SliceId,
    pub summary: String,
}

/// Produces and executes slices; supplied by the embedding system
#[async_trait]
pub trait SliceRunner: Send + Sync {
    /// Split the fan-out phase into slices
    async fn plan_slices(&self, epoch: &EpochState) -> Result<Vec<SliceSpec>, ActivityError>;

    /// Execute one slice
    async fn run_slice(
        &self,
        epoch_id: EpochId,
        slice: &SliceSpec,
    ) -> Result<SliceResult, ActivityError>;
}

/// How the fan-out ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SliceOutcome {
    /// Every slice completed, in plan order
    Completed(Vec<SliceResult>),
    /// Cancel arrived; in-flight slices were aborted
    Cancelled { completed: usize, aborted: usize },
}

/// Fan-out executor for one phase visit
pub(crate) struct SliceFlow<'a> {
    pub(crate) runner: &'a Arc<dyn SliceRunner>,
    pub(crate) policy: &'a RetryPolicy,
}

impl SliceFlow<'_> {
    /// Plan, fan out and join
    ///
    /// # Errors
    /// `SliceFailed` when a slice fails after retries; journal and planning
    /// failures.
    pub(crate) async fn run(
        &self,
        ctx: &mut WorkflowContext,
        inbox: &mut SignalInbox,
        epoch: &EpochState,
    ) -> Result<SliceOutcome, WorkflowError> {
        let epoch_id = epoch.epoch_id;
        let visit = epoch.last_seq();
        let runner = Arc::clone(self.runner);
        let plan: Vec<SliceSpec> = ctx
            .activity(PLAN_SLICES, self.policy, || runner.plan_slices(epoch))
            .await?;
        tracing::info!("Epoch {} fanning out {} slice(s)", epoch_id, plan.len());

        let mut finished = Vec::with_capacity(plan.len());
        let mut children = JoinSet::new();

        for slice in &plan {
            let key = child_key(visit, slice.id.as_str());
            if let Some(value) = ctx.store().load(ctx.run_id(), &key).await? {
                tracing::debug!("Epoch {} slice {} already complete", epoch_id, slice.id);
                finished.push(decode::<SliceResult>(&key, value)?);
                continue;
            }
            children.spawn(run_child(
                Arc::clone(self.runner),
                Arc::clone(ctx.store()),
                ctx.run_id().to_string(),
                self.policy.clone(),
                epoch_id,
                visit,
                slice.clone(),
            ));
        }

        let mut listening = true;
        let mut cancelled = inbox.take_cancel();
        while !children.is_empty() {
            if cancelled {
                let aborted = children.len();
                children.abort_all();
                while children.join_next().await.is_some() {}
                tracing::warn!(
                    "Epoch {} cancelled with {} slice(s) in flight",
                    epoch_id,
                    aborted
                );
                return Ok(SliceOutcome::Cancelled {
                    completed: finished.len(),
                    aborted,
                });
            }

            tokio::select! {
                biased;

                signal = inbox.next_fresh(ctx), if listening => match signal? {
                    Some(EpochSignal::Cancel) => cancelled = true,
                    Some(other) => inbox.defer(other),
                    None => listening = false,
                },

                joined = children.join_next() => {
                    let Some(joined) = joined else { continue };
                    match joined {
                        Ok((_, Ok(result))) => {
                            tracing::info!("Epoch {} slice {} complete", epoch_id, result.id);
                            finished.push(result);
                        }
                        Ok((slice, Err(err))) => {
                            children.abort_all();
                            while children.join_next().await.is_some() {}
                            tracing::error!("Epoch {} slice {} failed: {}", epoch_id, slice, err);
                            return Err(err);
                        }
                        Err(join) => {
                            children.abort_all();
                            while children.join_next().await.is_some() {}
                            return Err(WorkflowError::Join(join.to_string()));
                        }
                    }
                }
            }
        }

        // Signals journaled during the fan-out of an earlier run are due now,
        // even when every slice was already complete on resume.
        while let Some(signal) = ctx.received::<EpochSignal>().await? {
            match signal {
                EpochSignal::Cancel => {
                    return Ok(SliceOutcome::Cancelled {
                        completed: finished.len(),
                        aborted: 0,
                    });
                }
                other => inbox.defer(other),
            }
        }

        finished.sort_by_key(|r| position(&plan, &r.id));
        Ok(SliceOutcome::Completed(finished))
    }
}

async fn run_child(
    runner: Arc<dyn SliceRunner>,
    store: Arc<dyn HistoryStore>,
    run_id: String,
    policy: RetryPolicy,
    epoch_id: EpochId,
    visit: u64,
    slice: SliceSpec,
) -> (SliceId, Result<SliceResult, WorkflowError>) {
    let result = policy
        .execute("run_slice", || runner.run_slice(epoch_id, &slice))
        .await
        .map_err(|e| WorkflowError::from_slice(slice.id.as_str(), e));

    let result = match result {
        Ok(done) => match encode(&done) {
            Ok(value) => store
                .commit(&run_id, &child_key(visit, slice.id.as_str()), value)
                .await
                .map(|()| done),
            Err(e) => Err(e),
        },
        Err(e) => Err(e),
    };

    (slice.id, result)
}

fn position(plan: &[SliceSpec], id: &SliceId) -> usize {
    plan.iter().position(|s| &s.id == id).unwrap_or(usize::MAX)
}
