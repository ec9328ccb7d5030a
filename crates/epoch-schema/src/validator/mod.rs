//! Three-layer schema validator
//!
//! Proves a schema document is internally consistent before anything may
//! drive an epoch from it:
//! 1. **Structural**: every required attribute is present
//! 2. **Referential**: every cross-reference resolves
//! 3. **Semantic**: protocol rules beyond syntax hold
//!
//! All three layers always run and their defects accumulate. A document
//! can carry independent defects in every layer at once, and a single pass
//! must surface all of them, so no layer gates another.

mod referential;
mod semantic;
mod structural;

use crate::document::{ConstraintDoc, HandoffDoc, PhaseDoc, RoleDoc, SchemaDocument, TransitionDoc};
use crate::error::{Layer, TypedError};

/// Transition target that is always resolvable without a declaration
pub(crate) const TERMINAL_ID: &str = "complete";

/// Schema validator
#[derive(Debug, Clone, Copy, Default)]
pub struct SchemaValidator;

impl SchemaValidator {
    /// Create new validator instance
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Validate a document
    ///
    /// Returns every defect found, structural first, then referential, then
    /// semantic. An empty list means the document is fully consistent.
    #[must_use]
    pub fn validate(&self, doc: &SchemaDocument) -> Vec<TypedError> {
        let mut errors = Vec::new();

        errors.extend(structural::check(doc));
        errors.extend(referential::check(doc));
        errors.extend(semantic::check(doc));

        if errors.is_empty() {
            tracing::debug!("Schema document validated clean");
        } else {
            tracing::debug!(
                "Schema document has {} defect(s): {} structural, {} referential, {} semantic",
                errors.len(),
                count(&errors, Layer::Structural),
                count(&errors, Layer::Referential),
                count(&errors, Layer::Semantic),
            );
        }

        errors
    }
}

/// Validate a document with the default validator
#[must_use]
pub fn validate(doc: &SchemaDocument) -> Vec<TypedError> {
    SchemaValidator::new().validate(doc)
}

fn count(errors: &[TypedError], layer: Layer) -> usize {
    errors.iter().filter(|e| e.layer == layer).count()
}

pub(crate) fn role_label(idx: usize, role: &RoleDoc) -> String {
    role.id.clone().unwrap_or_else(|| format!("roles[{idx}]"))
}

pub(crate) fn phase_label(idx: usize, phase: &PhaseDoc) -> String {
    phase.id.clone().unwrap_or_else(|| format!("phases[{idx}]"))
}

pub(crate) fn transition_label(phase: &str, idx: usize, transition: &TransitionDoc) -> String {
    match &transition.to {
        Some(to) => format!("{phase}->{to}"),
        None => format!("{phase}.transitions[{idx}]"),
    }
}

pub(crate) fn constraint_label(idx: usize, constraint: &ConstraintDoc) -> String {
    constraint
        .id
        .clone()
        .unwrap_or_else(|| format!("constraints[{idx}]"))
}

pub(crate) fn handoff_label(idx: usize, handoff: &HandoffDoc) -> String {
    handoff
        .id
        .clone()
        .unwrap_or_else(|| format!("handoffs[{idx}]"))
}
