//! Local end-to-end simulation of one epoch
//!
//! Hosts a worker in-process, plays the coordinator, reviewers and workers
//! through signals, and reports the audit trail.

use async_trait::async_trait;
use epoch_core::{EpochId, EpochState};
use epoch_schema::{PhaseId, ProtocolSchema, ReviewAxis, VoteType};
use epoch_workflow::{
    ActivityError, AuditEvent, EpochHandle, EpochOutcome, InMemoryAuditSink, RetryPolicy,
    SliceResult, SliceRunner, SliceSpec, Worker, WorkerOptions,
};
use std::fmt::Write;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub(crate) struct SimulationConfig {
    pub(crate) slices: usize,
    /// First plan review asks for a revision
    pub(crate) revise_plan: bool,
    /// Simulated time each slice takes
    pub(crate) slice_time: Duration,
}

/// Runs every slice after a fixed delay
struct LocalSliceRunner {
    slices: usize,
    slice_time: Duration,
}

#[async_trait]
impl SliceRunner for LocalSliceRunner {
    async fn plan_slices(&self, epoch: &EpochState) -> Result<Vec<SliceSpec>, ActivityError> {
        Ok((1..=self.slices)
            .map(|n| {
                SliceSpec::new(
                    format!("slice-{n}"),
                    format!("part {n} of epoch {}", epoch.epoch_id),
                )
            })
            .collect())
    }

    async fn run_slice(
        &self,
        _epoch_id: EpochId,
        slice: &SliceSpec,
    ) -> Result<SliceResult, ActivityError> {
        tokio::time::sleep(self.slice_time).await;
        Ok(SliceResult {
            id: slice.id.clone(),
            summary: format!("{} done", slice.description),
        })
    }
}

#[derive(Debug)]
pub(crate) struct SimulationReport {
    pub(crate) outcome: EpochOutcome,
    pub(crate) audit: Vec<AuditEvent>,
    pub(crate) chain_head: String,
    pub(crate) chain_valid: bool,
}

impl SimulationReport {
    pub(crate) fn passed(&self) -> bool {
        self.outcome.is_completed() && self.chain_valid
    }

    pub(crate) fn generate_text(&self) -> String {
        let state = self.outcome.state();
        let mut out = String::new();
        let _ = writeln!(out, "Epoch {}", state.epoch_id);
        let _ = writeln!(out, "  Final phase: {}", state.phase);
        let _ = writeln!(out, "  Transitions: {}", state.history.len());
        let _ = writeln!(out, "  Revisions:   {}", state.revisions);
        let _ = writeln!(out);
        let _ = writeln!(out, "Audit trail ({} events):", self.audit.len());
        for event in &self.audit {
            let _ = writeln!(out, "  [{}] {:<16} {}", event.phase, event.kind.as_str(), event.detail);
        }
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "Audit chain: {} (head {})",
            if self.chain_valid { "VALID" } else { "BROKEN" },
            self.chain_head
        );
        out
    }
}

pub(crate) async fn run(
    schema: Arc<ProtocolSchema>,
    config: SimulationConfig,
) -> anyhow::Result<SimulationReport> {
    let audit = Arc::new(InMemoryAuditSink::new());
    let worker = Worker::new(WorkerOptions::default(), schema)
        .with_audit(audit.clone())
        .with_slices(Arc::new(LocalSliceRunner {
            slices: config.slices,
            slice_time: config.slice_time,
        }))
        .with_retry(RetryPolicy::immediate(3));

    let handle = worker.start_epoch()?;
    play(&handle, config.revise_plan).await?;
    let outcome = worker.wait(handle.epoch_id()).await?;

    Ok(SimulationReport {
        outcome,
        audit: audit.events(),
        chain_head: audit.head(),
        chain_valid: audit.verify_integrity().is_ok(),
    })
}

async fn review(handle: &EpochHandle, votes: [VoteType; 3]) -> anyhow::Result<()> {
    let axes = [
        ReviewAxis::correctness(),
        ReviewAxis::test_quality(),
        ReviewAxis::elegance(),
    ];
    for (axis, vote) in axes.into_iter().zip(votes) {
        handle.vote(axis, vote).await?;
    }
    Ok(())
}

/// Signal script for the canonical protocol
async fn play(handle: &EpochHandle, revise_plan: bool) -> anyhow::Result<()> {
    handle.phase_complete("coordinator", "request captured", None).await?;
    handle.phase_complete("coordinator", "requirements agreed", None).await?;
    handle.phase_complete("architect", "plan drafted", None).await?;
    if revise_plan {
        review(handle, [VoteType::Accept, VoteType::Revise, VoteType::Accept]).await?;
        handle.phase_complete("architect", "plan redrafted", None).await?;
    }
    review(handle, [VoteType::Accept; 3]).await?;
    handle.phase_complete("coordinator", "plan approved", None).await?;
    handle.phase_complete("architect", "tasks enumerated", None).await?;
    handle.phase_complete("supervisor", "slices assigned", None).await?;
    handle.phase_complete("supervisor", "slices integrated", None).await?;
    handle.blockers(0).await?;
    review(handle, [VoteType::Accept; 3]).await?;
    handle
        .phase_complete("coordinator", "user accepts the change", Some(PhaseId::Release))
        .await?;
    handle.phase_complete("supervisor", "change released", None).await?;
    Ok(())
}
