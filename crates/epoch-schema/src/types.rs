//! Protocol vocabulary
//!
//! Closed enumerations shared by the schema, the state machine and the
//! orchestrator:
//! - Phase identifiers and their canonical ordinals
//! - Lifecycle domains
//! - Participant roles
//! - Review axes, vote types, severities and handoff content levels

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Error returned when a protocol identifier does not parse
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} '{value}'")]
pub struct UnknownIdentifier {
    /// Identifier family (phase, role, ...)
    pub kind: &'static str,
    /// Rejected text
    pub value: String,
}

impl UnknownIdentifier {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// One of the twelve ordered phases, or the terminal sentinel
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PhaseId {
    Intake,
    Requirements,
    PlanDraft,
    PlanReview,
    PlanApproval,
    TaskBreakdown,
    SlicePlanning,
    Implementation,
    Integration,
    CodeReview,
    Acceptance,
    Release,
    /// Terminal state: no ordinal, no domain, no outbound transitions
    Complete,
}

impl PhaseId {
    /// The twelve ordered phases (COMPLETE excluded)
    pub const ORDERED: [PhaseId; 12] = [
        PhaseId::Intake,
        PhaseId::Requirements,
        PhaseId::PlanDraft,
        PhaseId::PlanReview,
        PhaseId::PlanApproval,
        PhaseId::TaskBreakdown,
        PhaseId::SlicePlanning,
        PhaseId::Implementation,
        PhaseId::Integration,
        PhaseId::CodeReview,
        PhaseId::Acceptance,
        PhaseId::Release,
    ];

    /// Canonical ordinal (1..=12), `None` for COMPLETE
    #[inline]
    #[must_use]
    pub fn number(self) -> Option<u8> {
        Self::ORDERED
            .iter()
            .position(|p| *p == self)
            .and_then(|idx| u8::try_from(idx + 1).ok())
    }

    /// Phase for a canonical ordinal
    #[must_use]
    pub fn from_number(number: u8) -> Option<Self> {
        let idx = usize::from(number).checked_sub(1)?;
        Self::ORDERED.get(idx).copied()
    }

    /// Canonical lifecycle domain, `None` for COMPLETE
    #[must_use]
    pub fn domain(self) -> Option<Domain> {
        self.number().and_then(Domain::for_ordinal)
    }

    /// Whether this is the terminal sentinel
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, PhaseId::Complete)
    }

    /// Kebab-case identifier as written in schema documents
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            PhaseId::Intake => "intake",
            PhaseId::Requirements => "requirements",
            PhaseId::PlanDraft => "plan-draft",
            PhaseId::PlanReview => "plan-review",
            PhaseId::PlanApproval => "plan-approval",
            PhaseId::TaskBreakdown => "task-breakdown",
            PhaseId::SlicePlanning => "slice-planning",
            PhaseId::Implementation => "implementation",
            PhaseId::Integration => "integration",
            PhaseId::CodeReview => "code-review",
            PhaseId::Acceptance => "acceptance",
            PhaseId::Release => "release",
            PhaseId::Complete => "complete",
        }
    }
}

impl fmt::Display for PhaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PhaseId {
    type Err = UnknownIdentifier;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ORDERED
            .iter()
            .copied()
            .chain(std::iter::once(PhaseId::Complete))
            .find(|p| p.as_str() == s)
            .ok_or_else(|| UnknownIdentifier::new("phase", s))
    }
}

/// Lifecycle category of a phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    User,
    Plan,
    Impl,
}

impl Domain {
    /// Canonical ordinal-to-domain mapping
    ///
    /// 1, 2, 5, 11 → user; 3, 4, 6, 7 → plan; 8, 9, 10, 12 → impl
    #[must_use]
    pub fn for_ordinal(number: u8) -> Option<Self> {
        match number {
            1 | 2 | 5 | 11 => Some(Domain::User),
            3 | 4 | 6 | 7 => Some(Domain::Plan),
            8 | 9 | 10 | 12 => Some(Domain::Impl),
            _ => None,
        }
    }

    /// Identifier as written in schema documents
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Domain::User => "user",
            Domain::Plan => "plan",
            Domain::Impl => "impl",
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Domain {
    type Err = UnknownIdentifier;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Domain::User),
            "plan" => Ok(Domain::Plan),
            "impl" => Ok(Domain::Impl),
            other => Err(UnknownIdentifier::new("domain", other)),
        }
    }
}

/// Participant kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleId {
    Coordinator,
    Architect,
    Supervisor,
    Reviewer,
    Worker,
}

impl RoleId {
    /// All five roles
    pub const ALL: [RoleId; 5] = [
        RoleId::Coordinator,
        RoleId::Architect,
        RoleId::Supervisor,
        RoleId::Reviewer,
        RoleId::Worker,
    ];

    /// Identifier as written in schema documents
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            RoleId::Coordinator => "coordinator",
            RoleId::Architect => "architect",
            RoleId::Supervisor => "supervisor",
            RoleId::Reviewer => "reviewer",
            RoleId::Worker => "worker",
        }
    }
}

impl fmt::Display for RoleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoleId {
    type Err = UnknownIdentifier;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| UnknownIdentifier::new("role", s))
    }
}

/// Independent review dimension
///
/// Open-ended: schemas may declare axes beyond the three built-ins.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReviewAxis(String);

impl ReviewAxis {
    /// Create axis from its identifier
    #[inline]
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Correctness axis
    #[must_use]
    pub fn correctness() -> Self {
        Self::new("correctness")
    }

    /// Test-quality axis
    #[must_use]
    pub fn test_quality() -> Self {
        Self::new("test-quality")
    }

    /// Elegance axis
    #[must_use]
    pub fn elegance() -> Self {
        Self::new("elegance")
    }

    /// Identifier
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReviewAxis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ReviewAxis {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Outcome of a reviewer's vote on one axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteType {
    Accept,
    Revise,
    Reject,
}

impl VoteType {
    /// Identifier as written in schema documents
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            VoteType::Accept => "accept",
            VoteType::Revise => "revise",
            VoteType::Reject => "reject",
        }
    }

    /// Whether the vote satisfies a consensus gate
    #[inline]
    #[must_use]
    pub fn is_accept(self) -> bool {
        matches!(self, VoteType::Accept)
    }
}

impl fmt::Display for VoteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VoteType {
    type Err = UnknownIdentifier;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "accept" => Ok(VoteType::Accept),
            "revise" => Ok(VoteType::Revise),
            "reject" => Ok(VoteType::Reject),
            other => Err(UnknownIdentifier::new("vote type", other)),
        }
    }
}

/// Constraint severity; only blocking violations stop a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Blocking,
    Warning,
    Info,
}

impl Severity {
    /// Identifier as written in schema documents
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Blocking => "blocking",
            Severity::Warning => "warning",
            Severity::Info => "info",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = UnknownIdentifier;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "blocking" => Ok(Severity::Blocking),
            "warning" => Ok(Severity::Warning),
            "info" => Ok(Severity::Info),
            other => Err(UnknownIdentifier::new("severity", other)),
        }
    }
}

/// How much content crosses a handoff
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContentLevel {
    FullProvenance,
    SummaryWithIds,
}

impl ContentLevel {
    /// Identifier as written in schema documents
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ContentLevel::FullProvenance => "full-provenance",
            ContentLevel::SummaryWithIds => "summary-with-ids",
        }
    }
}

impl fmt::Display for ContentLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentLevel {
    type Err = UnknownIdentifier;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full-provenance" => Ok(ContentLevel::FullProvenance),
            "summary-with-ids" => Ok(ContentLevel::SummaryWithIds),
            other => Err(UnknownIdentifier::new("content level", other)),
        }
    }
}

/// Edge kind in the phase graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitionKind {
    /// Moves the epoch toward completion
    #[default]
    Forward,
    /// Returns to a preceding authoring phase
    Revision,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_numbers_are_contiguous() {
        for (idx, phase) in PhaseId::ORDERED.iter().enumerate() {
            let expected = u8::try_from(idx + 1).unwrap();
            assert_eq!(phase.number(), Some(expected));
            assert_eq!(PhaseId::from_number(expected), Some(*phase));
        }
        assert_eq!(PhaseId::from_number(0), None);
        assert_eq!(PhaseId::from_number(13), None);
    }

    #[test]
    fn complete_has_no_ordinal_or_domain() {
        assert_eq!(PhaseId::Complete.number(), None);
        assert_eq!(PhaseId::Complete.domain(), None);
        assert!(PhaseId::Complete.is_terminal());
    }

    #[test]
    fn canonical_domain_mapping() {
        let user: Vec<_> = PhaseId::ORDERED
            .iter()
            .filter(|p| p.domain() == Some(Domain::User))
            .filter_map(|p| p.number())
            .collect();
        assert_eq!(user, vec![1, 2, 5, 11]);
        assert_eq!(PhaseId::PlanReview.domain(), Some(Domain::Plan));
        assert_eq!(PhaseId::Release.domain(), Some(Domain::Impl));
    }

    #[test]
    fn identifiers_parse_back() {
        for phase in PhaseId::ORDERED {
            assert_eq!(phase.as_str().parse::<PhaseId>().unwrap(), phase);
        }
        assert_eq!("complete".parse::<PhaseId>().unwrap(), PhaseId::Complete);
        assert!("merge".parse::<PhaseId>().is_err());
        assert_eq!("reviewer".parse::<RoleId>().unwrap(), RoleId::Reviewer);
        assert_eq!(
            "summary-with-ids".parse::<ContentLevel>().unwrap(),
            ContentLevel::SummaryWithIds
        );
    }

    #[test]
    fn phase_serde_is_kebab_case() {
        let json = serde_json::to_string(&PhaseId::PlanReview).unwrap();
        assert_eq!(json, "\"plan-review\"");
    }
}
