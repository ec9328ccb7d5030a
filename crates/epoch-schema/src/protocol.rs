//! Trusted protocol schema
//!
//! A `ProtocolSchema` can only be built from a document that validates
//! clean, so holding one is proof of consistency. It is immutable and meant
//! to be shared read-only (`Arc<ProtocolSchema>`) across every epoch.

use crate::document::{PhaseDoc, SchemaDocument, TransitionDoc};
use crate::error::{SchemaError, SchemaRejected, TypedError};
use crate::types::{
    ContentLevel, Domain, PhaseId, ReviewAxis, RoleId, Severity, TransitionKind, VoteType,
};
use crate::validator::validate;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

/// Consensus gate on a transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gate {
    /// Axes whose latest vote must be accept
    pub axes: Vec<ReviewAxis>,
    /// Whether the blocker count must be zero
    pub zero_blockers: bool,
}

/// One legal edge between phases
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub to: PhaseId,
    pub condition: String,
    pub action: Option<String>,
    pub kind: TransitionKind,
    pub gate: Option<Gate>,
}

impl Transition {
    /// Whether this is a revision (back) edge
    #[inline]
    #[must_use]
    pub fn is_revision(&self) -> bool {
        self.kind == TransitionKind::Revision
    }
}

/// Static definition of one phase
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseSpec {
    pub id: PhaseId,
    pub number: u8,
    pub domain: Domain,
    pub name: String,
    /// Owning roles, in declaration order, without duplicates
    pub roles: Vec<RoleId>,
    /// Outbound transitions, in declaration order
    pub transitions: Vec<Transition>,
    /// Whether the phase fans out into concurrent slices
    pub fan_out: bool,
}

impl PhaseSpec {
    /// Role assigned when the epoch enters this phase
    #[inline]
    #[must_use]
    pub fn primary_role(&self) -> Option<RoleId> {
        self.roles.first().copied()
    }

    /// Whether `role` owns this phase
    #[inline]
    #[must_use]
    pub fn is_owned_by(&self, role: RoleId) -> bool {
        self.roles.contains(&role)
    }

    /// Declared edge to `target`
    #[must_use]
    pub fn transition_to(&self, target: PhaseId) -> Option<&Transition> {
        self.transitions.iter().find(|t| t.to == target)
    }

    /// First declared forward edge
    #[must_use]
    pub fn forward(&self) -> Option<&Transition> {
        self.transitions.iter().find(|t| !t.is_revision())
    }

    /// First declared revision edge
    #[must_use]
    pub fn revision(&self) -> Option<&Transition> {
        self.transitions.iter().find(|t| t.is_revision())
    }

    /// First forward edge carrying a consensus gate
    #[must_use]
    pub fn gated(&self) -> Option<&Transition> {
        self.transitions
            .iter()
            .find(|t| !t.is_revision() && t.gate.is_some())
    }
}

/// One protocol rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstraintSpec {
    pub id: String,
    pub given: String,
    pub when: String,
    pub then: String,
    pub severity: Severity,
}

/// Cross-role content transfer point
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoffSpec {
    pub id: String,
    pub source: RoleId,
    pub target: RoleId,
    pub phase: PhaseId,
    pub content_level: ContentLevel,
}

/// Validated, immutable protocol definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolSchema {
    name: String,
    version: u32,
    phases: IndexMap<PhaseId, PhaseSpec>,
    constraints: Vec<ConstraintSpec>,
    handoffs: Vec<HandoffSpec>,
    review_axes: Vec<ReviewAxis>,
    vote_types: Vec<VoteType>,
}

impl ProtocolSchema {
    /// Build a trusted schema from a document
    ///
    /// # Errors
    /// `SchemaRejected` carrying every defect when the document does not
    /// validate clean.
    pub fn try_from_document(doc: &SchemaDocument) -> Result<Self, SchemaRejected> {
        let errors = validate(doc);
        if !errors.is_empty() {
            return Err(SchemaRejected { errors });
        }

        Self::convert(doc).map_err(|error| SchemaRejected {
            errors: vec![error],
        })
    }

    /// Parse and validate a YAML document
    ///
    /// # Errors
    /// `Load` for malformed YAML, `Rejected` with every defect when the
    /// document does not validate clean.
    pub fn from_yaml_str(source: &str) -> Result<Self, SchemaError> {
        let doc = SchemaDocument::from_yaml_str(source)?;
        Ok(Self::try_from_document(&doc)?)
    }

    /// Load and validate a document from disk
    ///
    /// # Errors
    /// `Load` when the file cannot be read or parsed, `Rejected` with every
    /// defect when it does not validate clean.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SchemaError> {
        let doc = SchemaDocument::load(path)?;
        Ok(Self::try_from_document(&doc)?)
    }

    fn convert(doc: &SchemaDocument) -> Result<Self, TypedError> {
        let mut phases = IndexMap::new();
        let mut ordered: Vec<&PhaseDoc> = doc.phases.iter().collect();
        ordered.sort_by_key(|p| p.number);

        for phase in ordered {
            let spec = convert_phase(phase)?;
            phases.insert(spec.id, spec);
        }

        let constraints = doc
            .constraints
            .iter()
            .map(|c| {
                let id = required(c.id.clone(), "constraint", "id")?;
                Ok(ConstraintSpec {
                    given: required(c.given.clone(), &id, "given")?,
                    when: required(c.when.clone(), &id, "when")?,
                    then: required(c.then.clone(), &id, "then")?,
                    severity: parse(c.severity.as_deref(), &id, "severity")?,
                    id,
                })
            })
            .collect::<Result<Vec<_>, TypedError>>()?;

        let handoffs = doc
            .handoffs
            .iter()
            .map(|h| {
                let id = required(h.id.clone(), "handoff", "id")?;
                Ok(HandoffSpec {
                    source: parse(h.source_role.as_deref(), &id, "source-role")?,
                    target: parse(h.target_role.as_deref(), &id, "target-role")?,
                    phase: parse(h.at_phase.as_deref(), &id, "at-phase")?,
                    content_level: parse(h.content_level.as_deref(), &id, "content-level")?,
                    id,
                })
            })
            .collect::<Result<Vec<_>, TypedError>>()?;

        let vote_types = doc
            .enums
            .vote_types
            .iter()
            .map(|v| parse(Some(v), "enums", "vote-types"))
            .collect::<Result<Vec<_>, TypedError>>()?;

        Ok(Self {
            name: doc.name.clone().unwrap_or_else(|| "epoch-protocol".to_string()),
            version: doc.version.unwrap_or(1),
            phases,
            constraints,
            handoffs,
            review_axes: doc.enums.review_axes.iter().map(ReviewAxis::new).collect(),
            vote_types,
        })
    }

    /// Protocol name
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Document version
    #[inline]
    #[must_use]
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Phase definition
    #[inline]
    #[must_use]
    pub fn phase(&self, id: PhaseId) -> Option<&PhaseSpec> {
        self.phases.get(&id)
    }

    /// Phases in ordinal order
    pub fn phases(&self) -> impl Iterator<Item = &PhaseSpec> {
        self.phases.values()
    }

    /// Entry phase (ordinal 1)
    #[must_use]
    pub fn first_phase(&self) -> PhaseId {
        self.phases
            .values()
            .find(|p| p.number == 1)
            .map_or(PhaseId::Intake, |p| p.id)
    }

    /// Declared transition between two phases
    #[must_use]
    pub fn transition(&self, from: PhaseId, to: PhaseId) -> Option<&Transition> {
        self.phase(from).and_then(|p| p.transition_to(to))
    }

    /// Legal targets from a phase; empty for COMPLETE
    #[must_use]
    pub fn targets(&self, from: PhaseId) -> Vec<PhaseId> {
        self.phase(from)
            .map(|p| p.transitions.iter().map(|t| t.to).collect())
            .unwrap_or_default()
    }

    /// Protocol constraints
    #[inline]
    #[must_use]
    pub fn constraints(&self) -> &[ConstraintSpec] {
        &self.constraints
    }

    /// Handoff points
    #[inline]
    #[must_use]
    pub fn handoffs(&self) -> &[HandoffSpec] {
        &self.handoffs
    }

    /// Handoffs that happen at one phase
    pub fn handoffs_at(&self, phase: PhaseId) -> impl Iterator<Item = &HandoffSpec> {
        self.handoffs.iter().filter(move |h| h.phase == phase)
    }

    /// Declared review axes
    #[inline]
    #[must_use]
    pub fn review_axes(&self) -> &[ReviewAxis] {
        &self.review_axes
    }

    /// Whether `axis` is declared
    #[must_use]
    pub fn has_axis(&self, axis: &ReviewAxis) -> bool {
        self.review_axes.contains(axis)
    }

    /// Declared vote types
    #[inline]
    #[must_use]
    pub fn vote_types(&self) -> &[VoteType] {
        &self.vote_types
    }
}

fn convert_phase(phase: &PhaseDoc) -> Result<PhaseSpec, TypedError> {
    let id: PhaseId = parse(phase.id.as_deref(), "phase", "id")?;
    let label = id.as_str();

    let mut roles = Vec::new();
    for role in phase.roles.iter().flatten() {
        let role: RoleId = parse(Some(role), label, "roles")?;
        if !roles.contains(&role) {
            roles.push(role);
        }
    }

    let transitions = phase
        .transitions
        .iter()
        .map(|t| convert_transition(label, t))
        .collect::<Result<Vec<_>, TypedError>>()?;

    Ok(PhaseSpec {
        id,
        number: required(phase.number, label, "number")?,
        domain: parse(phase.domain.as_deref(), label, "domain")?,
        name: required(phase.name.clone(), label, "name")?,
        roles,
        transitions,
        fan_out: phase.fan_out,
    })
}

fn convert_transition(phase: &str, transition: &TransitionDoc) -> Result<Transition, TypedError> {
    let kind = match transition.kind.as_deref() {
        None | Some("forward") => TransitionKind::Forward,
        Some("revision") => TransitionKind::Revision,
        Some(other) => {
            return Err(TypedError::referential(
                phase,
                format!("{phase} references unknown transition kind '{other}'"),
            ))
        }
    };

    let gate = transition.gate.as_ref().map(|g| Gate {
        axes: g.axes.iter().flatten().map(ReviewAxis::new).collect(),
        zero_blockers: g.zero_blockers,
    });

    Ok(Transition {
        to: parse(transition.to.as_deref(), phase, "to")?,
        condition: required(transition.condition.clone(), phase, "condition")?,
        action: transition.action.clone(),
        kind,
        gate,
    })
}

fn required<T>(value: Option<T>, element: &str, field: &str) -> Result<T, TypedError> {
    value.ok_or_else(|| {
        TypedError::structural(
            element,
            format!("{element} is missing required field '{field}'"),
        )
    })
}

fn parse<T: FromStr>(value: Option<&str>, element: &str, field: &str) -> Result<T, TypedError> {
    let value = required(value, element, field)?;
    value.parse().map_err(|_| {
        TypedError::semantic(
            element,
            format!("{element} field '{field}' has unrecognised value '{value}'"),
        )
    })
}
