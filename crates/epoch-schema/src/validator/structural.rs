//! Structural layer: required attributes are present

use super::{constraint_label, handoff_label, phase_label, role_label, transition_label};
use crate::document::SchemaDocument;
use crate::error::TypedError;

pub(super) fn check(doc: &SchemaDocument) -> Vec<TypedError> {
    let mut errors = Vec::new();

    let enums = &doc.enums;
    for (field, values) in [
        ("enums.domains", &enums.domains),
        ("enums.vote-types", &enums.vote_types),
        ("enums.severities", &enums.severities),
        ("enums.review-axes", &enums.review_axes),
        ("enums.content-levels", &enums.content_levels),
    ] {
        if values.is_empty() {
            errors.push(missing("schema", field));
        }
    }

    if doc.phases.is_empty() {
        errors.push(missing("schema", "phases"));
    }

    for (idx, role) in doc.roles.iter().enumerate() {
        if role.id.is_none() {
            errors.push(missing(&role_label(idx, role), "id"));
        }
    }

    for (idx, phase) in doc.phases.iter().enumerate() {
        let label = phase_label(idx, phase);
        require(&mut errors, &label, "id", phase.id.is_some());
        require(&mut errors, &label, "number", phase.number.is_some());
        require(&mut errors, &label, "domain", phase.domain.is_some());
        require(&mut errors, &label, "name", phase.name.is_some());
        require(&mut errors, &label, "roles", phase.roles.is_some());

        for (t_idx, transition) in phase.transitions.iter().enumerate() {
            let t_label = transition_label(&label, t_idx, transition);
            require(&mut errors, &t_label, "to", transition.to.is_some());
            require(&mut errors, &t_label, "condition", transition.condition.is_some());
            if let Some(gate) = &transition.gate {
                require(&mut errors, &t_label, "gate.axes", gate.axes.is_some());
            }
        }
    }

    for (idx, constraint) in doc.constraints.iter().enumerate() {
        let label = constraint_label(idx, constraint);
        require(&mut errors, &label, "id", constraint.id.is_some());
        require(&mut errors, &label, "given", constraint.given.is_some());
        require(&mut errors, &label, "when", constraint.when.is_some());
        require(&mut errors, &label, "then", constraint.then.is_some());
        require(&mut errors, &label, "severity", constraint.severity.is_some());
    }

    for (idx, handoff) in doc.handoffs.iter().enumerate() {
        let label = handoff_label(idx, handoff);
        require(&mut errors, &label, "id", handoff.id.is_some());
        require(&mut errors, &label, "source-role", handoff.source_role.is_some());
        require(&mut errors, &label, "target-role", handoff.target_role.is_some());
        require(&mut errors, &label, "at-phase", handoff.at_phase.is_some());
        require(&mut errors, &label, "content-level", handoff.content_level.is_some());
    }

    errors
}

fn require(errors: &mut Vec<TypedError>, element: &str, field: &str, present: bool) {
    if !present {
        errors.push(missing(element, field));
    }
}

fn missing(element: &str, field: &str) -> TypedError {
    TypedError::structural(
        element,
        format!("{element} is missing required field '{field}'"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical;
    use crate::error::Layer;

    #[test]
    fn one_error_per_missing_field() {
        let mut doc = canonical::document().unwrap();
        let handoff = &mut doc.handoffs[0];
        handoff.source_role = None;
        handoff.content_level = None;
        let id = handoff.id.clone().unwrap();

        let errors = check(&doc);
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|e| e.layer == Layer::Structural));
        assert!(errors.iter().all(|e| e.element == id));
        assert!(errors[0].message.contains("'source-role'"));
        assert!(errors[1].message.contains("'content-level'"));
    }

    #[test]
    fn gate_without_axes_is_structural() {
        let mut doc = canonical::document().unwrap();
        let review = doc.phase_mut("plan-review").unwrap();
        let gated = review
            .transitions
            .iter_mut()
            .find(|t| t.gate.is_some())
            .unwrap();
        gated.gate.as_mut().unwrap().axes = None;

        let errors = check(&doc);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("'gate.axes'"));
    }
}
