//! Review sub-flow
//!
//! Runs while the epoch sits in a gated phase. It blocks on the signal inbox
//! and re-evaluates the gate after every signal:
//! - Approved the moment the gate holds
//! - Blocked or Rejected the moment blockers or a reject arrive
//! - RevisionRequested once every axis has voted and one of them is not
//!   accept

use crate::audit::AuditEventKind;
use crate::epoch::EpochRun;
use crate::error::WorkflowError;
use crate::signal::EpochSignal;
use epoch_core::GateStatus;
use epoch_schema::VoteType;
use serde::{Deserialize, Serialize};

/// How a review ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReviewOutcome {
    Approved,
    RevisionRequested,
    /// Outstanding blocker count
    Blocked(u32),
    /// Reason given by the reviewer
    Rejected(String),
    Cancelled,
}

impl ReviewOutcome {
    /// Whether the epoch moves forward
    #[inline]
    #[must_use]
    pub fn is_approved(&self) -> bool {
        matches!(self, Self::Approved)
    }
}

/// Outcome implied by the gate alone, if any
fn settle(status: &GateStatus) -> Option<ReviewOutcome> {
    match status {
        GateStatus::Ungated | GateStatus::Open => Some(ReviewOutcome::Approved),
        GateStatus::NotAccepted(_) => Some(ReviewOutcome::RevisionRequested),
        GateStatus::Blocked(count) => Some(ReviewOutcome::Blocked(*count)),
        GateStatus::MissingVotes(_) => None,
    }
}

impl EpochRun {
    /// Collect votes and blockers until the review settles
    pub(crate) async fn review(&mut self) -> Result<ReviewOutcome, WorkflowError> {
        loop {
            if let Some(outcome) = self
                .machine
                .forward_gate()
                .and_then(|(_, status)| settle(&status))
            {
                return Ok(outcome);
            }

            let Some(signal) = self.inbox.next(&mut self.ctx).await? else {
                return Err(WorkflowError::SignalsClosed(self.epoch_id()));
            };

            match signal {
                EpochSignal::Vote { axis, vote } => {
                    let known = self.machine.schema().has_axis(&axis);
                    self.apply_vote(axis.clone(), vote).await?;
                    if known && vote == VoteType::Reject {
                        return Ok(ReviewOutcome::Rejected(format!("{axis} rejected")));
                    }
                }
                EpochSignal::Blockers { count } => {
                    self.apply_blockers(count).await?;
                    if count > 0 {
                        return Ok(ReviewOutcome::Blocked(count));
                    }
                }
                EpochSignal::Reject { reason } => {
                    self.audit(AuditEventKind::Rejection, reason.clone())
                        .await?;
                    return Ok(ReviewOutcome::Rejected(reason));
                }
                EpochSignal::Cancel => return Ok(ReviewOutcome::Cancelled),
                EpochSignal::PhaseComplete { triggered_by, .. } => {
                    tracing::warn!(
                        "Epoch {} ignoring phase-complete from {} during review at {}",
                        self.epoch_id(),
                        triggered_by,
                        self.machine.phase()
                    );
                }
            }
        }
    }
}
