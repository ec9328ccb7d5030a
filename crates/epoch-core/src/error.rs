//! Error types for the epoch state machine
//!
//! Every error leaves the epoch state exactly as it was.

use crate::evaluator::Violation;
use crate::state::EpochId;
use epoch_schema::{PhaseId, ReviewAxis, VoteType};

/// A move the protocol does not allow right now
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IllegalTransition {
    /// The epoch is complete
    #[error("epoch is complete; no transition leaves {0}")]
    Terminal(PhaseId),

    /// Target is not a declared transition of the current phase
    #[error("{to} is not a declared transition from {from}")]
    NotAdjacent { from: PhaseId, to: PhaseId },

    /// Gate axes without a vote
    #[error("consensus gate {from} -> {to} is missing votes on: {}", join(.axes))]
    MissingVotes {
        from: PhaseId,
        to: PhaseId,
        axes: Vec<ReviewAxis>,
    },

    /// Gate axes whose latest vote is not accept
    #[error("consensus gate {from} -> {to} not reached: {}", join_votes(.votes))]
    VotesNotAccepted {
        from: PhaseId,
        to: PhaseId,
        votes: Vec<(ReviewAxis, VoteType)>,
    },

    /// Gate requires zero blockers
    #[error("gate {from} -> {to} requires zero blockers, {count} outstanding")]
    BlockersOutstanding { from: PhaseId, to: PhaseId, count: u32 },

    /// Revision refused because the forward gate already holds
    #[error("revision {from} -> {to} refused: forward consensus already reached")]
    ConsensusReached { from: PhaseId, to: PhaseId },

    /// A blocking constraint does not hold for the move
    #[error("{from} -> {to} violates {}", join_violations(.violations))]
    ConstraintViolated {
        from: PhaseId,
        to: PhaseId,
        violations: Vec<Violation>,
    },
}

impl IllegalTransition {
    /// Short machine-readable reason
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Terminal(_) => "terminal",
            Self::NotAdjacent { .. } => "not-adjacent",
            Self::MissingVotes { .. } => "missing-votes",
            Self::VotesNotAccepted { .. } => "votes-not-accepted",
            Self::BlockersOutstanding { .. } => "blockers-outstanding",
            Self::ConsensusReached { .. } => "consensus-reached",
            Self::ConstraintViolated { .. } => "constraint-violated",
        }
    }
}

/// Operations refused on an epoch
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// Axis not declared by the schema
    #[error("unknown review axis '{0}'")]
    UnknownAxis(ReviewAxis),

    /// No further input is accepted
    #[error("epoch {0} is complete")]
    EpochComplete(EpochId),

    /// Snapshot names a phase the schema does not define
    #[error("phase '{0}' is not defined by the protocol schema")]
    UnknownPhase(PhaseId),

    /// Transition refused
    #[error(transparent)]
    Illegal(#[from] IllegalTransition),
}

fn join(axes: &[ReviewAxis]) -> String {
    axes.iter()
        .map(ReviewAxis::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

fn join_votes(votes: &[(ReviewAxis, VoteType)]) -> String {
    votes
        .iter()
        .map(|(axis, vote)| format!("{axis}={vote}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn join_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| v.constraint_id.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_failed_condition() {
        let err = IllegalTransition::VotesNotAccepted {
            from: PhaseId::PlanReview,
            to: PhaseId::PlanApproval,
            votes: vec![(ReviewAxis::elegance(), VoteType::Revise)],
        };
        assert_eq!(
            err.to_string(),
            "consensus gate plan-review -> plan-approval not reached: elegance=revise"
        );
        assert_eq!(err.reason(), "votes-not-accepted");

        let err = IllegalTransition::MissingVotes {
            from: PhaseId::CodeReview,
            to: PhaseId::Acceptance,
            axes: vec![ReviewAxis::correctness(), ReviewAxis::test_quality()],
        };
        assert!(err.to_string().ends_with("correctness, test-quality"));
    }
}
