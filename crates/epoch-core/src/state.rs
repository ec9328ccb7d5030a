//! Mutable protocol state of one epoch
//!
//! `EpochState` is a plain serializable snapshot. It is exclusively owned by
//! one `EpochMachine`; everything else sees copies.

use chrono::{DateTime, Utc};
use epoch_schema::{PhaseId, ReviewAxis, RoleId, VoteType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

/// Unique epoch identifier (ULID)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EpochId(Ulid);

impl EpochId {
    /// Generate new unique ID
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Wrap an existing ULID
    #[inline]
    #[must_use]
    pub fn from_ulid(id: Ulid) -> Self {
        Self(id)
    }

    /// Underlying ULID
    #[inline]
    #[must_use]
    pub fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl Default for EpochId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EpochId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EpochId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(s).map(Self)
    }
}

/// One committed phase change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    /// 1-based, strictly increasing per epoch
    pub seq: u64,
    pub from: PhaseId,
    pub to: PhaseId,
    /// Actor or signal that requested the move
    pub triggered_by: String,
    /// Condition the actor reported as satisfied
    pub condition_met: String,
    pub at: DateTime<Utc>,
}

/// Protocol state of one epoch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochState {
    pub epoch_id: EpochId,
    pub phase: PhaseId,
    /// Latest vote per review axis for the current phase
    pub votes: BTreeMap<ReviewAxis, VoteType>,
    /// Outstanding blocking issues, set externally
    pub blockers: u32,
    /// Role currently holding the epoch
    pub role: RoleId,
    pub history: Vec<TransitionRecord>,
    /// Revision edges taken so far
    pub revisions: u32,
}

impl EpochState {
    /// Fresh state at `phase`
    #[must_use]
    pub fn new(epoch_id: EpochId, phase: PhaseId, role: RoleId) -> Self {
        Self {
            epoch_id,
            phase,
            votes: BTreeMap::new(),
            blockers: 0,
            role,
            history: Vec::new(),
            revisions: 0,
        }
    }

    /// Latest vote on `axis`
    #[inline]
    #[must_use]
    pub fn vote(&self, axis: &ReviewAxis) -> Option<VoteType> {
        self.votes.get(axis).copied()
    }

    /// Sequence number of the last committed transition (0 if none)
    #[must_use]
    pub fn last_seq(&self) -> u64 {
        self.history.last().map_or(0, |r| r.seq)
    }

    /// Sequence number the next transition will carry
    #[inline]
    #[must_use]
    pub fn next_seq(&self) -> u64 {
        self.last_seq() + 1
    }

    /// Whether the epoch reached COMPLETE
    #[inline]
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.phase.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_id_roundtrips_through_text() {
        let id = EpochId::new();
        let parsed: EpochId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-a-ulid".parse::<EpochId>().is_err());
    }

    #[test]
    fn fresh_state() {
        let state = EpochState::new(EpochId::new(), PhaseId::Intake, RoleId::Coordinator);
        assert_eq!(state.next_seq(), 1);
        assert!(state.votes.is_empty());
        assert!(!state.is_complete());
        assert_eq!(state.vote(&ReviewAxis::correctness()), None);
    }

    #[test]
    fn snapshot_serializes_axes_as_keys() {
        let mut state = EpochState::new(EpochId::new(), PhaseId::PlanReview, RoleId::Reviewer);
        state.votes.insert(ReviewAxis::test_quality(), VoteType::Revise);

        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["phase"], "plan-review");
        assert_eq!(json["votes"]["test-quality"], "revise");

        let back: EpochState = serde_json::from_value(json).unwrap();
        assert_eq!(back, state);
    }
}
