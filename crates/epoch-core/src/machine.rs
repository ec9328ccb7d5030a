//! Epoch phase state machine
//!
//! Owns one epoch's state and enforces the protocol on every change:
//! - A move must follow a declared transition of the current phase
//! - A gated move needs an accept vote on every gate axis, and zero
//!   blockers where the gate says so
//! - A revision move is refused while its sibling forward gate holds
//! - No blocking constraint may be violated by the move
//!
//! A refused operation leaves the state untouched.

use crate::error::{IllegalTransition, ProtocolError};
use crate::evaluator::{ConstraintEvaluator, Violation};
use crate::state::{EpochId, EpochState, TransitionRecord};
use chrono::Utc;
use epoch_schema::{Gate, PhaseId, ProtocolSchema, ReviewAxis, RoleId, Transition, VoteType};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Current standing of a transition's consensus gate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GateStatus {
    /// Edge carries no gate
    Ungated,
    /// Every condition holds
    Open,
    /// Axes that have not voted
    MissingVotes(Vec<ReviewAxis>),
    /// Axes whose latest vote is not accept
    NotAccepted(Vec<(ReviewAxis, VoteType)>),
    /// Blockers outstanding on a zero-blocker gate
    Blocked(u32),
}

impl GateStatus {
    /// Whether the gate lets the move through
    #[inline]
    #[must_use]
    pub fn holds(&self) -> bool {
        matches!(self, Self::Ungated | Self::Open)
    }

    fn of(gate: &Gate, state: &EpochState) -> Self {
        let missing: Vec<ReviewAxis> = gate
            .axes
            .iter()
            .filter(|axis| state.vote(axis).is_none())
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Self::MissingVotes(missing);
        }

        let rejected: Vec<(ReviewAxis, VoteType)> = gate
            .axes
            .iter()
            .filter_map(|axis| {
                state
                    .vote(axis)
                    .filter(|vote| !vote.is_accept())
                    .map(|vote| (axis.clone(), vote))
            })
            .collect();
        if !rejected.is_empty() {
            return Self::NotAccepted(rejected);
        }

        if gate.zero_blockers && state.blockers > 0 {
            return Self::Blocked(state.blockers);
        }

        Self::Open
    }
}

/// State machine for one epoch
#[derive(Debug, Clone)]
pub struct EpochMachine {
    schema: Arc<ProtocolSchema>,
    evaluator: Arc<ConstraintEvaluator>,
    state: EpochState,
}

impl EpochMachine {
    /// New epoch at the schema's first phase
    #[must_use]
    pub fn new(schema: Arc<ProtocolSchema>, evaluator: Arc<ConstraintEvaluator>) -> Self {
        Self::with_id(schema, evaluator, EpochId::new())
    }

    /// New epoch with a caller-chosen id
    #[must_use]
    pub fn with_id(
        schema: Arc<ProtocolSchema>,
        evaluator: Arc<ConstraintEvaluator>,
        epoch_id: EpochId,
    ) -> Self {
        let phase = schema.first_phase();
        let role = owner(&schema, phase).unwrap_or(RoleId::Coordinator);
        tracing::debug!("Epoch {} created at {}", epoch_id, phase);

        Self {
            schema,
            evaluator,
            state: EpochState::new(epoch_id, phase, role),
        }
    }

    /// New epoch whose evaluator is compiled from the schema
    #[must_use]
    pub fn from_schema(schema: Arc<ProtocolSchema>) -> Self {
        let evaluator = Arc::new(ConstraintEvaluator::from_schema(&schema));
        Self::new(schema, evaluator)
    }

    /// Resume from a snapshot
    ///
    /// # Errors
    /// `UnknownPhase` when the snapshot's phase is not in the schema.
    pub fn restore(
        schema: Arc<ProtocolSchema>,
        evaluator: Arc<ConstraintEvaluator>,
        state: EpochState,
    ) -> Result<Self, ProtocolError> {
        if !state.is_complete() && schema.phase(state.phase).is_none() {
            return Err(ProtocolError::UnknownPhase(state.phase));
        }

        Ok(Self {
            schema,
            evaluator,
            state,
        })
    }

    /// Move to `target`, evaluating constraints locally
    ///
    /// # Errors
    /// `IllegalTransition` naming the first condition that failed.
    pub fn advance(
        &mut self,
        target: PhaseId,
        triggered_by: impl Into<String>,
        condition_met: impl Into<String>,
    ) -> Result<TransitionRecord, IllegalTransition> {
        let schema = Arc::clone(&self.schema);
        let transition = self.check_edge(&schema, target)?;
        let violations = self.evaluator.evaluate_move(&self.state, target);
        self.commit(transition, &violations, triggered_by.into(), condition_met.into())
    }

    /// Move to `target` using a constraint verdict computed elsewhere
    ///
    /// # Errors
    /// `IllegalTransition` naming the first condition that failed.
    pub fn advance_with_verdict(
        &mut self,
        target: PhaseId,
        triggered_by: impl Into<String>,
        condition_met: impl Into<String>,
        violations: &[Violation],
    ) -> Result<TransitionRecord, IllegalTransition> {
        let schema = Arc::clone(&self.schema);
        let transition = self.check_edge(&schema, target)?;
        self.commit(transition, violations, triggered_by.into(), condition_met.into())
    }

    /// Check a move without performing it
    ///
    /// # Errors
    /// Same as `advance`.
    pub fn check(&self, target: PhaseId) -> Result<(), IllegalTransition> {
        let transition = self.check_edge(&self.schema, target)?;
        let violations = self.evaluator.evaluate_move(&self.state, target);
        blocking(self.state.phase, transition.to, &violations)
    }

    /// Record the latest vote on an axis (last write wins)
    ///
    /// # Errors
    /// `UnknownAxis` or `EpochComplete`.
    pub fn record_vote(&mut self, axis: ReviewAxis, vote: VoteType) -> Result<(), ProtocolError> {
        if self.state.is_complete() {
            return Err(ProtocolError::EpochComplete(self.state.epoch_id));
        }
        if !self.schema.has_axis(&axis) {
            return Err(ProtocolError::UnknownAxis(axis));
        }

        tracing::debug!(
            "Epoch {} vote {}={} at {}",
            self.state.epoch_id,
            axis,
            vote,
            self.state.phase
        );
        self.state.votes.insert(axis, vote);
        Ok(())
    }

    /// Set the outstanding blocker count
    ///
    /// # Errors
    /// `EpochComplete`.
    pub fn set_blockers(&mut self, count: u32) -> Result<(), ProtocolError> {
        if self.state.is_complete() {
            return Err(ProtocolError::EpochComplete(self.state.epoch_id));
        }

        tracing::debug!(
            "Epoch {} blockers {} -> {}",
            self.state.epoch_id,
            self.state.blockers,
            count
        );
        self.state.blockers = count;
        Ok(())
    }

    /// Declared targets of the current phase (empty once complete)
    #[must_use]
    pub fn legal_targets(&self) -> Vec<PhaseId> {
        self.schema.targets(self.state.phase)
    }

    /// Gate standing of the edge to `target`; `None` if not declared
    #[must_use]
    pub fn gate_status(&self, target: PhaseId) -> Option<GateStatus> {
        let transition = self.schema.transition(self.state.phase, target)?;
        Some(
            transition
                .gate
                .as_ref()
                .map_or(GateStatus::Ungated, |gate| GateStatus::of(gate, &self.state)),
        )
    }

    /// Gate standing of the current phase's gated forward edge
    #[must_use]
    pub fn forward_gate(&self) -> Option<(PhaseId, GateStatus)> {
        let transition = self.schema.phase(self.state.phase)?.gated()?;
        let gate = transition.gate.as_ref()?;
        Some((transition.to, GateStatus::of(gate, &self.state)))
    }

    #[inline]
    #[must_use]
    pub fn state(&self) -> &EpochState {
        &self.state
    }

    #[inline]
    #[must_use]
    pub fn phase(&self) -> PhaseId {
        self.state.phase
    }

    #[inline]
    #[must_use]
    pub fn epoch_id(&self) -> EpochId {
        self.state.epoch_id
    }

    #[inline]
    #[must_use]
    pub fn schema(&self) -> &Arc<ProtocolSchema> {
        &self.schema
    }

    #[inline]
    #[must_use]
    pub fn evaluator(&self) -> &Arc<ConstraintEvaluator> {
        &self.evaluator
    }

    #[inline]
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.state.is_complete()
    }

    /// Give up the machine, keeping the state
    #[must_use]
    pub fn into_state(self) -> EpochState {
        self.state
    }

    fn check_edge<'s>(
        &self,
        schema: &'s ProtocolSchema,
        target: PhaseId,
    ) -> Result<&'s Transition, IllegalTransition> {
        let from = self.state.phase;
        if self.state.is_complete() {
            return Err(IllegalTransition::Terminal(from));
        }

        let phase = schema
            .phase(from)
            .ok_or(IllegalTransition::NotAdjacent { from, to: target })?;
        let transition = phase
            .transition_to(target)
            .ok_or(IllegalTransition::NotAdjacent { from, to: target })?;

        if transition.is_revision() {
            let forward_holds = phase
                .gated()
                .and_then(|t| t.gate.as_ref())
                .is_some_and(|gate| GateStatus::of(gate, &self.state).holds());
            if forward_holds {
                return Err(IllegalTransition::ConsensusReached { from, to: target });
            }
            return Ok(transition);
        }

        match transition.gate.as_ref().map(|g| GateStatus::of(g, &self.state)) {
            None | Some(GateStatus::Open | GateStatus::Ungated) => Ok(transition),
            Some(GateStatus::MissingVotes(axes)) => Err(IllegalTransition::MissingVotes {
                from,
                to: target,
                axes,
            }),
            Some(GateStatus::NotAccepted(votes)) => Err(IllegalTransition::VotesNotAccepted {
                from,
                to: target,
                votes,
            }),
            Some(GateStatus::Blocked(count)) => Err(IllegalTransition::BlockersOutstanding {
                from,
                to: target,
                count,
            }),
        }
    }

    fn commit(
        &mut self,
        transition: &Transition,
        violations: &[Violation],
        triggered_by: String,
        condition_met: String,
    ) -> Result<TransitionRecord, IllegalTransition> {
        let from = self.state.phase;
        let to = transition.to;

        if let Err(err) = blocking(from, to, violations) {
            tracing::warn!("Epoch {} refused {} -> {}: {}", self.state.epoch_id, from, to, err);
            return Err(err);
        }
        for warning in violations.iter().filter(|v| !v.is_blocking()) {
            tracing::warn!("Epoch {} {} -> {}: {}", self.state.epoch_id, from, to, warning);
        }

        let record = TransitionRecord {
            seq: self.state.next_seq(),
            from,
            to,
            triggered_by,
            condition_met,
            at: Utc::now(),
        };

        self.state.phase = to;
        self.state.votes.clear();
        if let Some(role) = owner(&self.schema, to) {
            self.state.role = role;
        }
        if transition.is_revision() {
            self.state.revisions += 1;
        }
        self.state.history.push(record.clone());

        tracing::info!(
            "Epoch {} transition #{}: {} -> {} ({})",
            self.state.epoch_id,
            record.seq,
            from,
            to,
            record.condition_met
        );

        Ok(record)
    }
}

fn owner(schema: &ProtocolSchema, phase: PhaseId) -> Option<RoleId> {
    schema.phase(phase).and_then(|p| p.primary_role())
}

fn blocking(from: PhaseId, to: PhaseId, violations: &[Violation]) -> Result<(), IllegalTransition> {
    let blocking: Vec<Violation> = violations
        .iter()
        .filter(|v| v.is_blocking())
        .cloned()
        .collect();
    if blocking.is_empty() {
        Ok(())
    } else {
        Err(IllegalTransition::ConstraintViolated {
            from,
            to,
            violations: blocking,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use epoch_schema::{canonical, Severity};
    use pretty_assertions::assert_eq;

    fn machine() -> EpochMachine {
        EpochMachine::from_schema(canonical::schema().unwrap())
    }

    fn walk(machine: &mut EpochMachine, targets: &[PhaseId]) {
        for target in targets {
            machine.advance(*target, "test", "walked").unwrap();
        }
    }

    fn vote_all(machine: &mut EpochMachine, vote: VoteType) {
        for axis in [
            ReviewAxis::correctness(),
            ReviewAxis::test_quality(),
            ReviewAxis::elegance(),
        ] {
            machine.record_vote(axis, vote).unwrap();
        }
    }

    fn to_plan_review(machine: &mut EpochMachine) {
        walk(
            machine,
            &[PhaseId::Requirements, PhaseId::PlanDraft, PhaseId::PlanReview],
        );
    }

    #[test]
    fn initial_state() {
        let m = machine();
        assert_eq!(m.phase(), PhaseId::Intake);
        assert_eq!(m.state().role, RoleId::Coordinator);
        assert_eq!(m.state().blockers, 0);
        assert!(m.state().votes.is_empty());
        assert_eq!(m.legal_targets(), vec![PhaseId::Requirements]);
    }

    #[test]
    fn plan_review_consensus_advances() {
        let mut m = machine();
        to_plan_review(&mut m);
        vote_all(&mut m, VoteType::Accept);

        let record = m.advance(PhaseId::PlanApproval, "reviewer", "consensus").unwrap();
        assert_eq!(record.seq, 4);
        assert_eq!(record.from, PhaseId::PlanReview);
        assert_eq!(m.phase(), PhaseId::PlanApproval);
        assert!(m.state().votes.is_empty());
        assert_eq!(m.state().role, RoleId::Coordinator);
    }

    #[test]
    fn one_revise_vote_fails_the_gate() {
        let mut m = machine();
        to_plan_review(&mut m);
        m.record_vote(ReviewAxis::correctness(), VoteType::Accept).unwrap();
        m.record_vote(ReviewAxis::test_quality(), VoteType::Accept).unwrap();
        m.record_vote(ReviewAxis::elegance(), VoteType::Revise).unwrap();
        let before = m.state().clone();

        let err = m.advance(PhaseId::PlanApproval, "reviewer", "consensus").unwrap_err();
        assert_eq!(
            err,
            IllegalTransition::VotesNotAccepted {
                from: PhaseId::PlanReview,
                to: PhaseId::PlanApproval,
                votes: vec![(ReviewAxis::elegance(), VoteType::Revise)],
            }
        );
        assert_eq!(m.state(), &before);
    }

    #[test]
    fn missing_votes_are_named() {
        let mut m = machine();
        to_plan_review(&mut m);
        m.record_vote(ReviewAxis::correctness(), VoteType::Accept).unwrap();

        let err = m.advance(PhaseId::PlanApproval, "reviewer", "consensus").unwrap_err();
        assert!(matches!(
            err,
            IllegalTransition::MissingVotes { ref axes, .. } if axes.len() == 2
        ));
    }

    #[test]
    fn revision_clears_votes_and_counts() {
        let mut m = machine();
        to_plan_review(&mut m);
        m.record_vote(ReviewAxis::correctness(), VoteType::Revise).unwrap();

        m.advance(PhaseId::PlanDraft, "reviewer", "consensus not reached").unwrap();
        assert_eq!(m.phase(), PhaseId::PlanDraft);
        assert!(m.state().votes.is_empty());
        assert_eq!(m.state().revisions, 1);
        assert_eq!(m.state().role, RoleId::Architect);
    }

    #[test]
    fn revision_refused_once_consensus_holds() {
        let mut m = machine();
        to_plan_review(&mut m);
        vote_all(&mut m, VoteType::Accept);

        let err = m.advance(PhaseId::PlanDraft, "reviewer", "second thoughts").unwrap_err();
        assert_eq!(
            err,
            IllegalTransition::ConsensusReached {
                from: PhaseId::PlanReview,
                to: PhaseId::PlanDraft,
            }
        );
    }

    #[test]
    fn skipping_phases_is_not_adjacent() {
        let mut m = machine();
        let err = m.advance(PhaseId::Implementation, "coordinator", "eager").unwrap_err();
        assert_eq!(err.reason(), "not-adjacent");
        assert_eq!(m.phase(), PhaseId::Intake);
        assert!(m.state().history.is_empty());
    }

    #[test]
    fn code_review_needs_zero_blockers() {
        let mut m = machine();
        walk(
            &mut m,
            &[
                PhaseId::Requirements,
                PhaseId::PlanDraft,
                PhaseId::PlanReview,
            ],
        );
        vote_all(&mut m, VoteType::Accept);
        walk(
            &mut m,
            &[
                PhaseId::PlanApproval,
                PhaseId::TaskBreakdown,
                PhaseId::SlicePlanning,
                PhaseId::Implementation,
                PhaseId::Integration,
                PhaseId::CodeReview,
            ],
        );
        vote_all(&mut m, VoteType::Accept);
        m.set_blockers(2).unwrap();

        assert_eq!(m.gate_status(PhaseId::Acceptance), Some(GateStatus::Blocked(2)));
        let err = m.advance(PhaseId::Acceptance, "reviewer", "approved").unwrap_err();
        assert_eq!(err.reason(), "blockers-outstanding");

        // blockers reopen the revision edge
        assert!(m.check(PhaseId::Implementation).is_ok());

        m.set_blockers(0).unwrap();
        walk(&mut m, &[PhaseId::Acceptance, PhaseId::Release, PhaseId::Complete]);
        assert!(m.is_complete());
        assert!(m.legal_targets().is_empty());

        let seqs: Vec<u64> = m.state().history.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, (1..=12).collect::<Vec<u64>>());
    }

    #[test]
    fn complete_epoch_refuses_input() {
        let mut m = machine();
        let mut state = m.clone().into_state();
        state.phase = PhaseId::Complete;
        m = EpochMachine::restore(Arc::clone(m.schema()), Arc::clone(m.evaluator()), state).unwrap();

        assert_eq!(
            m.advance(PhaseId::Intake, "anyone", "restart").unwrap_err(),
            IllegalTransition::Terminal(PhaseId::Complete)
        );
        assert!(matches!(
            m.record_vote(ReviewAxis::correctness(), VoteType::Accept),
            Err(ProtocolError::EpochComplete(_))
        ));
        assert!(matches!(m.set_blockers(1), Err(ProtocolError::EpochComplete(_))));
    }

    #[test]
    fn unknown_axis_is_refused() {
        let mut m = machine();
        let err = m
            .record_vote(ReviewAxis::new("performance"), VoteType::Accept)
            .unwrap_err();
        assert_eq!(err, ProtocolError::UnknownAxis(ReviewAxis::new("performance")));
    }

    #[test]
    fn external_verdict_blocks() {
        let mut m = machine();
        let verdict = vec![Violation {
            constraint_id: "X-HOLD".into(),
            message: "on hold".into(),
            severity: Severity::Blocking,
        }];

        let err = m
            .advance_with_verdict(PhaseId::Requirements, "coordinator", "captured", &verdict)
            .unwrap_err();
        assert_eq!(err.reason(), "constraint-violated");

        let warning = vec![Violation {
            severity: Severity::Warning,
            ..verdict[0].clone()
        }];
        m.advance_with_verdict(PhaseId::Requirements, "coordinator", "captured", &warning)
            .unwrap();
        assert_eq!(m.phase(), PhaseId::Requirements);
    }

    #[test]
    fn latest_vote_wins() {
        let mut m = machine();
        to_plan_review(&mut m);
        m.record_vote(ReviewAxis::elegance(), VoteType::Revise).unwrap();
        m.record_vote(ReviewAxis::elegance(), VoteType::Accept).unwrap();
        assert_eq!(m.state().vote(&ReviewAxis::elegance()), Some(VoteType::Accept));
    }
}
