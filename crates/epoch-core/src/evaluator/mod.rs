//! Constraint evaluator
//!
//! Checks protocol constraints against an epoch's state and an optional
//! proposed move. Rules are anything with an `evaluate` capability; schema
//! constraints compile to the built-in `ClauseRule`, and callers may plug in
//! further rules.
//!
//! Evaluation is pure: the same state and target always yield the same
//! violations, in rule order.

pub mod clause;

pub use clause::{Clause, UnparsedPredicate};

use crate::state::EpochState;
use epoch_schema::{ConstraintSpec, PhaseId, ProtocolSchema, ReviewAxis, Severity};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// A constraint that does not hold
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub constraint_id: String,
    pub message: String,
    pub severity: Severity,
}

impl Violation {
    /// Whether the violation stops a transition
    #[inline]
    #[must_use]
    pub fn is_blocking(&self) -> bool {
        self.severity == Severity::Blocking
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.severity, self.constraint_id, self.message)
    }
}

/// Everything a rule may look at
#[derive(Debug, Clone, Copy)]
pub struct EvaluationContext<'a> {
    pub state: &'a EpochState,
    /// Proposed next phase, if a move is being checked
    pub target: Option<PhaseId>,
    /// Review axes declared by the schema
    pub axes: &'a [ReviewAxis],
}

impl<'a> EvaluationContext<'a> {
    #[must_use]
    pub fn new(state: &'a EpochState, target: Option<PhaseId>, axes: &'a [ReviewAxis]) -> Self {
        Self {
            state,
            target,
            axes,
        }
    }
}

/// A protocol rule
pub trait Rule: Send + Sync + fmt::Debug {
    /// Constraint identifier
    fn id(&self) -> &str;

    /// `Some` when the rule does not hold in `ctx`
    fn evaluate(&self, ctx: &EvaluationContext<'_>) -> Option<Violation>;
}

/// Rule compiled from a schema constraint
///
/// Violated when `given` and `when` hold but `then` does not.
#[derive(Debug, Clone)]
pub struct ClauseRule {
    id: String,
    given: Clause,
    when: Clause,
    then: Clause,
    severity: Severity,
}

impl ClauseRule {
    /// Compile a constraint
    ///
    /// # Errors
    /// The first predicate outside the clause grammar.
    pub fn compile(spec: &ConstraintSpec) -> Result<Self, UnparsedPredicate> {
        Ok(Self {
            id: spec.id.clone(),
            given: Clause::parse(&spec.given)?,
            when: Clause::parse(&spec.when)?,
            then: Clause::parse(&spec.then)?,
            severity: spec.severity,
        })
    }

    #[inline]
    #[must_use]
    pub fn severity(&self) -> Severity {
        self.severity
    }
}

impl Rule for ClauseRule {
    fn id(&self) -> &str {
        &self.id
    }

    fn evaluate(&self, ctx: &EvaluationContext<'_>) -> Option<Violation> {
        if !self.given.holds(ctx) || !self.when.holds(ctx) || self.then.holds(ctx) {
            return None;
        }

        Some(Violation {
            constraint_id: self.id.clone(),
            message: format!(
                "expected '{}' when '{}' and '{}'",
                self.then, self.given, self.when
            ),
            severity: self.severity,
        })
    }
}

/// Constraint kept for humans only
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvisoryConstraint {
    pub id: String,
    pub severity: Severity,
    /// Why the constraint could not be compiled
    pub reason: String,
}

/// Evaluates a rule set
#[derive(Debug, Clone, Default)]
pub struct ConstraintEvaluator {
    rules: Vec<Arc<dyn Rule>>,
    advisory: Vec<AdvisoryConstraint>,
    axes: Vec<ReviewAxis>,
}

impl ConstraintEvaluator {
    /// Empty evaluator for the given review axes
    #[must_use]
    pub fn new(axes: Vec<ReviewAxis>) -> Self {
        Self {
            rules: Vec::new(),
            advisory: Vec::new(),
            axes,
        }
    }

    /// Evaluator compiled from a schema's constraints
    #[must_use]
    pub fn from_schema(schema: &ProtocolSchema) -> Self {
        Self::from_constraints(schema.constraints(), schema.review_axes().to_vec())
    }

    /// Evaluator compiled from constraint specs
    ///
    /// Constraints whose text falls outside the clause grammar become
    /// advisory and are never evaluated.
    #[must_use]
    pub fn from_constraints(constraints: &[ConstraintSpec], axes: Vec<ReviewAxis>) -> Self {
        let mut evaluator = Self::new(axes);

        for spec in constraints {
            match ClauseRule::compile(spec) {
                Ok(rule) => evaluator.rules.push(Arc::new(rule)),
                Err(reason) => {
                    tracing::debug!("Constraint {} is advisory: {}", spec.id, reason);
                    evaluator.advisory.push(AdvisoryConstraint {
                        id: spec.id.clone(),
                        severity: spec.severity,
                        reason: reason.to_string(),
                    });
                }
            }
        }

        evaluator
    }

    /// Add an externally defined rule
    #[must_use]
    pub fn with_rule(mut self, rule: Arc<dyn Rule>) -> Self {
        self.rules.push(rule);
        self
    }

    /// Executable rules, in evaluation order
    #[inline]
    #[must_use]
    pub fn rules(&self) -> &[Arc<dyn Rule>] {
        &self.rules
    }

    /// Constraints that are never evaluated
    #[inline]
    #[must_use]
    pub fn advisory(&self) -> &[AdvisoryConstraint] {
        &self.advisory
    }

    /// Violations of the current state
    #[must_use]
    pub fn evaluate(&self, state: &EpochState) -> Vec<Violation> {
        self.run(&EvaluationContext::new(state, None, &self.axes))
    }

    /// Violations of moving to `target`
    #[must_use]
    pub fn evaluate_move(&self, state: &EpochState, target: PhaseId) -> Vec<Violation> {
        self.run(&EvaluationContext::new(state, Some(target), &self.axes))
    }

    fn run(&self, ctx: &EvaluationContext<'_>) -> Vec<Violation> {
        self.rules.iter().filter_map(|r| r.evaluate(ctx)).collect()
    }
}

/// Evaluate constraint specs against a state, with no move proposed
#[must_use]
pub fn evaluate(
    constraints: &[ConstraintSpec],
    axes: &[ReviewAxis],
    state: &EpochState,
) -> Vec<Violation> {
    ConstraintEvaluator::from_constraints(constraints, axes.to_vec()).evaluate(state)
}
