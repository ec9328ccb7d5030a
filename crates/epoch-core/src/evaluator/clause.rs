//! Predicate grammar for constraint clauses
//!
//! A clause is one or more predicates joined by `and`:
//!
//! ```text
//! always
//! phase = <id>        phase != <id>       phase in [a, b]     phase not in [a, b]
//! target = <id>       target in [a, b]    (false when no move is proposed)
//! role = <id>         role in [a, b]
//! blockers <op> <n>   op: = != < <= > >=
//! vote(<axis>) = <vote>
//! consensus           every review axis's latest vote is accept
//! ```

use super::EvaluationContext;
use epoch_schema::{PhaseId, ReviewAxis, RoleId, VoteType};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::str::FromStr;

static CONJUNCTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s+and\s+").expect("conjunction regex is valid"));

static EQUALITY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(phase|target|role)\s*(=|!=)\s*([a-z][a-z0-9-]*)$")
        .expect("equality regex is valid")
});

static MEMBERSHIP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(phase|target|role)\s+(in|not\s+in)\s*\[([^\]]*)\]$")
        .expect("membership regex is valid")
});

static BLOCKERS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^blockers\s*(=|!=|<=|>=|<|>)\s*(\d+)$").expect("blockers regex is valid")
});

static VOTE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^vote\(\s*([a-z][a-z0-9-]*)\s*\)\s*(=|!=)\s*([a-z]+)$")
        .expect("vote regex is valid")
});

/// Text that does not belong to the predicate grammar
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unrecognised predicate '{0}'")]
pub struct UnparsedPredicate(pub String);

/// Numeric comparison for `blockers`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Comparison {
    fn parse(op: &str) -> Option<Self> {
        Some(match op {
            "=" => Self::Eq,
            "!=" => Self::Ne,
            "<" => Self::Lt,
            "<=" => Self::Le,
            ">" => Self::Gt,
            ">=" => Self::Ge,
            _ => return None,
        })
    }

    #[must_use]
    pub fn holds(self, left: u32, right: u32) -> bool {
        match self {
            Self::Eq => left == right,
            Self::Ne => left != right,
            Self::Lt => left < right,
            Self::Le => left <= right,
            Self::Gt => left > right,
            Self::Ge => left >= right,
        }
    }
}

/// Set membership test, possibly negated
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Membership<T> {
    pub values: Vec<T>,
    pub negated: bool,
}

impl<T: PartialEq> Membership<T> {
    fn holds(&self, value: &T) -> bool {
        self.values.contains(value) != self.negated
    }
}

/// One atomic predicate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    Always,
    Phase(Membership<PhaseId>),
    Target(Membership<PhaseId>),
    Role(Membership<RoleId>),
    Blockers(Comparison, u32),
    Vote {
        axis: ReviewAxis,
        vote: VoteType,
        negated: bool,
    },
    Consensus,
}

impl Predicate {
    fn parse(text: &str) -> Result<Self, UnparsedPredicate> {
        let text = text.trim();
        let unparsed = || UnparsedPredicate(text.to_string());

        match text {
            "always" => return Ok(Self::Always),
            "consensus" => return Ok(Self::Consensus),
            _ => {}
        }

        if let Some(caps) = EQUALITY.captures(text) {
            let negated = &caps[2] == "!=";
            return subject(&caps[1], vec![caps[3].to_string()], negated).ok_or_else(unparsed);
        }

        if let Some(caps) = MEMBERSHIP.captures(text) {
            let negated = caps[2].starts_with("not");
            let values = caps[3]
                .split(',')
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .collect();
            return subject(&caps[1], values, negated).ok_or_else(unparsed);
        }

        if let Some(caps) = BLOCKERS.captures(text) {
            let op = Comparison::parse(&caps[1]).ok_or_else(unparsed)?;
            let count = caps[2].parse().map_err(|_| unparsed())?;
            return Ok(Self::Blockers(op, count));
        }

        if let Some(caps) = VOTE.captures(text) {
            let vote = VoteType::from_str(&caps[3]).map_err(|_| unparsed())?;
            return Ok(Self::Vote {
                axis: ReviewAxis::new(&caps[1]),
                vote,
                negated: &caps[2] == "!=",
            });
        }

        Err(unparsed())
    }

    fn holds(&self, ctx: &EvaluationContext<'_>) -> bool {
        match self {
            Self::Always => true,
            Self::Phase(set) => set.holds(&ctx.state.phase),
            Self::Target(set) => ctx.target.is_some_and(|t| set.holds(&t)),
            Self::Role(set) => set.holds(&ctx.state.role),
            Self::Blockers(op, n) => op.holds(ctx.state.blockers, *n),
            Self::Vote {
                axis,
                vote,
                negated,
            } => (ctx.state.vote(axis) == Some(*vote)) != *negated,
            Self::Consensus => ctx
                .axes
                .iter()
                .all(|axis| ctx.state.vote(axis).is_some_and(VoteType::is_accept)),
        }
    }
}

fn subject(kind: &str, values: Vec<String>, negated: bool) -> Option<Predicate> {
    match kind {
        "phase" => Some(Predicate::Phase(Membership {
            values: parse_all(&values)?,
            negated,
        })),
        "target" => Some(Predicate::Target(Membership {
            values: parse_all(&values)?,
            negated,
        })),
        "role" => Some(Predicate::Role(Membership {
            values: parse_all(&values)?,
            negated,
        })),
        _ => None,
    }
}

fn parse_all<T: FromStr>(values: &[String]) -> Option<Vec<T>> {
    if values.is_empty() {
        return None;
    }
    values.iter().map(|v| v.parse().ok()).collect()
}

/// Conjunction of predicates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Clause {
    source: String,
    predicates: Vec<Predicate>,
}

impl Clause {
    /// Parse clause text
    ///
    /// # Errors
    /// The first predicate that does not belong to the grammar.
    pub fn parse(text: &str) -> Result<Self, UnparsedPredicate> {
        let source = text.trim().to_string();
        let predicates = CONJUNCTION
            .split(&source)
            .map(Predicate::parse)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { source, predicates })
    }

    /// Whether every predicate holds
    #[must_use]
    pub fn holds(&self, ctx: &EvaluationContext<'_>) -> bool {
        self.predicates.iter().all(|p| p.holds(ctx))
    }

    #[must_use]
    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }

    /// Clause text as written
    #[inline]
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }
}

impl fmt::Display for Clause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{EpochId, EpochState};

    fn ctx_state(phase: PhaseId, role: RoleId) -> EpochState {
        EpochState::new(EpochId::new(), phase, role)
    }

    #[test]
    fn parses_every_form() {
        for text in [
            "always",
            "consensus",
            "phase = plan-review",
            "phase != release",
            "phase in [implementation, integration]",
            "phase not in [intake]",
            "target = complete",
            "role in [supervisor, worker]",
            "blockers >= 2",
            "vote(correctness) = accept",
            "phase = code-review and blockers = 0",
        ] {
            assert!(Clause::parse(text).is_ok(), "{text}");
        }
    }

    #[test]
    fn prose_is_unparsed() {
        let err = Clause::parse("an architect hands a plan to reviewers").unwrap_err();
        assert_eq!(err.0, "an architect hands a plan to reviewers");

        // known subject, unknown value
        assert!(Clause::parse("phase = staging").is_err());
        assert!(Clause::parse("phase in []").is_err());
        assert!(Clause::parse("vote(correctness) = maybe").is_err());
    }

    #[test]
    fn conjunction_requires_all() {
        let clause = Clause::parse("phase = code-review and blockers = 0").unwrap();
        let mut state = ctx_state(PhaseId::CodeReview, RoleId::Reviewer);
        let ctx = EvaluationContext::new(&state, None, &[]);
        assert!(clause.holds(&ctx));

        state.blockers = 1;
        let ctx = EvaluationContext::new(&state, None, &[]);
        assert!(!clause.holds(&ctx));
    }

    #[test]
    fn target_is_false_without_move() {
        let clause = Clause::parse("target = acceptance").unwrap();
        let state = ctx_state(PhaseId::CodeReview, RoleId::Reviewer);

        assert!(!clause.holds(&EvaluationContext::new(&state, None, &[])));
        assert!(clause.holds(&EvaluationContext::new(
            &state,
            Some(PhaseId::Acceptance),
            &[]
        )));
    }

    #[test]
    fn consensus_covers_every_axis() {
        let axes = [ReviewAxis::correctness(), ReviewAxis::elegance()];
        let clause = Clause::parse("consensus").unwrap();
        let mut state = ctx_state(PhaseId::PlanReview, RoleId::Reviewer);

        state.votes.insert(ReviewAxis::correctness(), VoteType::Accept);
        assert!(!clause.holds(&EvaluationContext::new(&state, None, &axes)));

        state.votes.insert(ReviewAxis::elegance(), VoteType::Accept);
        assert!(clause.holds(&EvaluationContext::new(&state, None, &axes)));
    }

    #[test]
    fn negated_membership() {
        let clause = Clause::parse("role not in [worker]").unwrap();
        let state = ctx_state(PhaseId::Integration, RoleId::Supervisor);
        assert!(clause.holds(&EvaluationContext::new(&state, None, &[])));
    }
}
