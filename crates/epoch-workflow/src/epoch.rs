//! Epoch flow
//!
//! Drives one epoch from its first phase to `complete`:
//! - Fan-out phase: slice sub-flow, then the forward transition
//! - Gated phase: review sub-flow, then the gated or the revision transition
//! - Any other phase: wait for `PhaseComplete`
//!
//! Every move runs `check_constraints`, then the state machine, then
//! `record_transition` and `record_audit_event`. A refused move is audited
//! and the phase falls back to waiting for explicit signals; the flow never
//! corrects it on its own.

use crate::activities::{EpochActivities, CHECK_CONSTRAINTS, RECORD_AUDIT_EVENT, RECORD_TRANSITION};
use crate::audit::{AuditEvent, AuditEventKind};
use crate::error::{ActivityError, WorkflowError};
use crate::history::WorkflowContext;
use crate::retry::RetryPolicy;
use crate::review::ReviewOutcome;
use crate::signal::{EpochSignal, SignalInbox};
use crate::slice::{SliceFlow, SliceOutcome, SliceRunner, PLAN_SLICES};
use epoch_core::{EpochId, EpochMachine, EpochState, ProtocolError, Violation};
use epoch_schema::{PhaseId, ReviewAxis, VoteType};
use std::sync::Arc;

/// How an epoch flow ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EpochOutcome {
    /// Reached `complete`
    Completed(EpochState),
    /// Stopped by a `Cancel` signal
    Cancelled(EpochState),
}

impl EpochOutcome {
    /// Final state either way
    #[must_use]
    pub fn state(&self) -> &EpochState {
        match self {
            Self::Completed(state) | Self::Cancelled(state) => state,
        }
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }
}

/// Result of working one phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Moved,
    Refused,
    Cancelled,
}

/// One epoch flow: state machine, journal and signal inbox
pub struct EpochRun {
    pub(crate) machine: EpochMachine,
    pub(crate) ctx: WorkflowContext,
    pub(crate) inbox: SignalInbox,
    pub(crate) activities: EpochActivities,
    pub(crate) slices: Option<Arc<dyn SliceRunner>>,
    pub(crate) retry: RetryPolicy,
}

impl std::fmt::Debug for EpochRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpochRun")
            .field("epoch_id", &self.machine.epoch_id())
            .field("phase", &self.machine.phase())
            .field("ctx", &self.ctx)
            .finish_non_exhaustive()
    }
}

impl EpochRun {
    #[must_use]
    pub fn new(
        machine: EpochMachine,
        ctx: WorkflowContext,
        inbox: SignalInbox,
        activities: EpochActivities,
    ) -> Self {
        Self {
            machine,
            ctx,
            inbox,
            activities,
            slices: None,
            retry: RetryPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_slices(mut self, runner: Arc<dyn SliceRunner>) -> Self {
        self.slices = Some(runner);
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[inline]
    #[must_use]
    pub fn epoch_id(&self) -> EpochId {
        self.machine.epoch_id()
    }

    #[inline]
    #[must_use]
    pub fn machine(&self) -> &EpochMachine {
        &self.machine
    }

    /// Drive the epoch until it completes or is cancelled
    ///
    /// # Errors
    /// Activity failures that survived retries, failed slices, a closed
    /// signal channel, or a schema without the transitions a step needs.
    pub async fn run(mut self) -> Result<EpochOutcome, WorkflowError> {
        tracing::info!(
            "Epoch {} started at {}",
            self.epoch_id(),
            self.machine.phase()
        );

        // Phase whose automatic move was refused; it is now worked by hand.
        let mut settled: Option<PhaseId> = None;

        while !self.machine.is_complete() {
            let phase = self.machine.phase();
            let spec = self
                .machine
                .schema()
                .phase(phase)
                .ok_or(ProtocolError::UnknownPhase(phase))?;
            let automatic = settled != Some(phase);
            let fan_out = spec.fan_out;
            let gated = spec.gated().is_some();

            let step = if automatic && fan_out {
                self.slice_phase().await?
            } else if automatic && gated {
                self.review_phase().await?
            } else {
                self.manual_phase().await?
            };

            match step {
                Step::Moved => settled = None,
                Step::Refused => settled = Some(phase),
                Step::Cancelled => {
                    tracing::warn!("Epoch {} cancelled at {}", self.epoch_id(), phase);
                    return Ok(EpochOutcome::Cancelled(self.machine.into_state()));
                }
            }
        }

        tracing::info!(
            "Epoch {} complete after {} transition(s), {} replayed",
            self.epoch_id(),
            self.machine.state().last_seq(),
            self.ctx.replayed()
        );
        Ok(EpochOutcome::Completed(self.machine.into_state()))
    }

    /// Attempt one move; `false` when the protocol refused it
    pub(crate) async fn transition(
        &mut self,
        target: PhaseId,
        triggered_by: String,
        condition: String,
    ) -> Result<bool, WorkflowError> {
        let state = self.machine.state().clone();
        let activities = self.activities.clone();
        let violations: Vec<Violation> = self
            .ctx
            .activity(CHECK_CONSTRAINTS, &self.retry, || {
                activities.check_constraints(&state, target)
            })
            .await?;

        let from = self.machine.phase();
        let record = match self.machine.advance_with_verdict(
            target,
            triggered_by,
            condition,
            &violations,
        ) {
            Ok(record) => record,
            Err(refused) => {
                tracing::warn!(
                    "Epoch {} move {} -> {} refused: {}",
                    self.epoch_id(),
                    from,
                    target,
                    refused
                );
                self.audit(AuditEventKind::Rejection, refused.to_string())
                    .await?;
                return Ok(false);
            }
        };

        let epoch_id = self.epoch_id();
        let _fresh: bool = self
            .ctx
            .activity(RECORD_TRANSITION, &self.retry, || {
                activities.record_transition(epoch_id, &record)
            })
            .await?;
        self.audit_at(
            from,
            AuditEventKind::Transition,
            format!("#{} {} -> {} ({})", record.seq, from, target, record.condition_met),
        )
        .await?;
        Ok(true)
    }

    /// Append an audit event for the current phase
    pub(crate) async fn audit(
        &mut self,
        kind: AuditEventKind,
        detail: String,
    ) -> Result<(), WorkflowError> {
        let phase = self.machine.phase();
        self.audit_at(phase, kind, detail).await
    }

    async fn audit_at(
        &mut self,
        phase: PhaseId,
        kind: AuditEventKind,
        detail: String,
    ) -> Result<(), WorkflowError> {
        let event = AuditEvent::new(self.epoch_id(), phase, kind, detail);
        let activities = self.activities.clone();
        self.ctx
            .activity(RECORD_AUDIT_EVENT, &self.retry, || {
                activities.record_audit_event(event.clone())
            })
            .await
    }

    /// Apply a vote; an unknown axis is audited and otherwise ignored
    pub(crate) async fn apply_vote(
        &mut self,
        axis: ReviewAxis,
        vote: VoteType,
    ) -> Result<(), WorkflowError> {
        match self.machine.record_vote(axis.clone(), vote) {
            Ok(()) => self.audit(AuditEventKind::Vote, format!("{axis}={vote}")).await,
            Err(ProtocolError::UnknownAxis(axis)) => {
                tracing::warn!("Epoch {} vote on unknown axis '{}'", self.epoch_id(), axis);
                self.audit(
                    AuditEventKind::Rejection,
                    format!("vote on unknown review axis '{axis}'"),
                )
                .await
            }
            Err(other) => Err(other.into()),
        }
    }

    pub(crate) async fn apply_blockers(&mut self, count: u32) -> Result<(), WorkflowError> {
        self.machine.set_blockers(count)?;
        self.audit(AuditEventKind::Blockers, format!("blockers = {count}"))
            .await
    }

    pub(crate) async fn cancelled(&mut self) -> Result<Step, WorkflowError> {
        self.audit(AuditEventKind::Cancelled, "cancel signal".to_string())
            .await?;
        Ok(Step::Cancelled)
    }

    /// Role and condition of the current phase's edge to `target`
    pub(crate) fn describe(&self, target: PhaseId) -> (String, String) {
        let phase = self.machine.schema().phase(self.machine.phase());
        let role = phase
            .and_then(|p| p.primary_role())
            .map_or_else(|| "epoch".to_string(), |r| r.to_string());
        let condition = phase
            .and_then(|p| p.transition_to(target))
            .map_or_else(String::new, |t| t.condition.clone());
        (role, condition)
    }

    fn forward_target(&self) -> Result<PhaseId, WorkflowError> {
        let phase = self.machine.phase();
        self.machine
            .schema()
            .phase(phase)
            .and_then(|p| p.forward())
            .map(|t| t.to)
            .ok_or_else(|| WorkflowError::Protocol(ProtocolError::UnknownPhase(phase)))
    }

    /// Wait for signals until the phase is left or the epoch is cancelled
    async fn manual_phase(&mut self) -> Result<Step, WorkflowError> {
        loop {
            let Some(signal) = self.inbox.next(&mut self.ctx).await? else {
                return Err(WorkflowError::SignalsClosed(self.epoch_id()));
            };

            match signal {
                EpochSignal::PhaseComplete {
                    triggered_by,
                    condition,
                    target,
                } => {
                    let target = match target {
                        Some(target) => target,
                        None => self.forward_target()?,
                    };
                    if self.transition(target, triggered_by, condition).await? {
                        return Ok(Step::Moved);
                    }
                }
                EpochSignal::Vote { axis, vote } => self.apply_vote(axis, vote).await?,
                EpochSignal::Blockers { count } => self.apply_blockers(count).await?,
                EpochSignal::Reject { reason } => {
                    tracing::warn!(
                        "Epoch {} reject at {}: {}",
                        self.epoch_id(),
                        self.machine.phase(),
                        reason
                    );
                    self.audit(AuditEventKind::Rejection, reason).await?;
                }
                EpochSignal::Cancel => return self.cancelled().await,
            }
        }
    }

    /// Fan out, join, then take the forward transition
    async fn slice_phase(&mut self) -> Result<Step, WorkflowError> {
        let Some(runner) = self.slices.clone() else {
            return Err(WorkflowError::from_activity(
                PLAN_SLICES,
                ActivityError::not_configured("slice runner"),
            ));
        };

        let flow = SliceFlow {
            runner: &runner,
            policy: &self.retry,
        };
        let outcome = flow
            .run(&mut self.ctx, &mut self.inbox, self.machine.state())
            .await?;

        match outcome {
            SliceOutcome::Cancelled { completed, aborted } => {
                self.audit(
                    AuditEventKind::Cancelled,
                    format!("{completed} slice(s) complete, {aborted} aborted"),
                )
                .await?;
                Ok(Step::Cancelled)
            }
            SliceOutcome::Completed(results) => {
                for result in results {
                    self.audit(
                        AuditEventKind::SliceCompleted,
                        format!("{}: {}", result.id, result.summary),
                    )
                    .await?;
                }
                let target = self.forward_target()?;
                let (role, condition) = self.describe(target);
                Ok(if self.transition(target, role, condition).await? {
                    Step::Moved
                } else {
                    Step::Refused
                })
            }
        }
    }

    /// Collect the review, then move along the outcome's edge
    async fn review_phase(&mut self) -> Result<Step, WorkflowError> {
        let phase = self.machine.phase();
        let outcome = self.review().await?;
        tracing::info!("Epoch {} review at {}: {:?}", self.epoch_id(), phase, outcome);

        let spec = self
            .machine
            .schema()
            .phase(phase)
            .ok_or(ProtocolError::UnknownPhase(phase))?;
        let edge = match outcome {
            ReviewOutcome::Cancelled => return self.cancelled().await,
            ReviewOutcome::Approved => spec.gated(),
            ReviewOutcome::RevisionRequested
            | ReviewOutcome::Blocked(_)
            | ReviewOutcome::Rejected(_) => spec.revision(),
        };
        let Some(target) = edge.map(|t| t.to) else {
            return Err(WorkflowError::Misconfigured {
                activity: "review".to_string(),
                reason: format!("phase {phase} has no transition for outcome {outcome:?}"),
            });
        };

        let (role, condition) = self.describe(target);
        Ok(if self.transition(target, role, condition).await? {
            Step::Moved
        } else {
            Step::Refused
        })
    }
}
