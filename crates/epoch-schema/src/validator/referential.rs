//! Referential layer: cross-references resolve to declared elements
//!
//! Attributes that are absent are the structural layer's concern and are
//! skipped here. Membership in an enum block is only checked when the block
//! itself is declared, so an empty block is reported once (structurally)
//! instead of once per reference.

use super::{constraint_label, handoff_label, phase_label, transition_label, TERMINAL_ID};
use crate::document::SchemaDocument;
use crate::error::TypedError;
use std::collections::HashSet;

pub(super) fn check(doc: &SchemaDocument) -> Vec<TypedError> {
    let mut errors = Vec::new();

    let roles: HashSet<&str> = doc.roles.iter().filter_map(|r| r.id.as_deref()).collect();
    let phases: HashSet<&str> = doc.phases.iter().filter_map(|p| p.id.as_deref()).collect();

    for (idx, phase) in doc.phases.iter().enumerate() {
        let label = phase_label(idx, phase);

        if let Some(domain) = &phase.domain {
            check_enum(&mut errors, &label, "domain", domain, &doc.enums.domains);
        }

        for role in phase.roles.iter().flatten() {
            if !roles.contains(role.as_str()) {
                errors.push(unknown(&label, "role", role));
            }
        }

        for (t_idx, transition) in phase.transitions.iter().enumerate() {
            let t_label = transition_label(&label, t_idx, transition);

            if let Some(to) = &transition.to {
                if to != TERMINAL_ID && !phases.contains(to.as_str()) {
                    errors.push(unknown(&t_label, "phase", to));
                }
            }

            if let Some(kind) = &transition.kind {
                if kind != "forward" && kind != "revision" {
                    errors.push(unknown(&t_label, "transition kind", kind));
                }
            }
        }
    }

    for (idx, constraint) in doc.constraints.iter().enumerate() {
        if let Some(severity) = &constraint.severity {
            let label = constraint_label(idx, constraint);
            check_enum(&mut errors, &label, "severity", severity, &doc.enums.severities);
        }
    }

    for (idx, handoff) in doc.handoffs.iter().enumerate() {
        let label = handoff_label(idx, handoff);

        for role in [&handoff.source_role, &handoff.target_role].into_iter().flatten() {
            if !roles.contains(role.as_str()) {
                errors.push(unknown(&label, "role", role));
            }
        }

        if let Some(phase) = &handoff.at_phase {
            if !phases.contains(phase.as_str()) {
                errors.push(unknown(&label, "phase", phase));
            }
        }

        if let Some(level) = &handoff.content_level {
            check_enum(
                &mut errors,
                &label,
                "content level",
                level,
                &doc.enums.content_levels,
            );
        }
    }

    errors
}

fn check_enum(
    errors: &mut Vec<TypedError>,
    element: &str,
    kind: &str,
    value: &str,
    declared: &[String],
) {
    if !declared.is_empty() && !declared.iter().any(|d| d == value) {
        errors.push(unknown(element, kind, value));
    }
}

fn unknown(element: &str, kind: &str, target: &str) -> TypedError {
    TypedError::referential(
        element,
        format!("{element} references unknown {kind} '{target}'"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical;
    use crate::error::Layer;

    #[test]
    fn dangling_transition_target() {
        let mut doc = canonical::document().unwrap();
        doc.phase_mut("integration").unwrap().transitions[0].to = Some("deploy".into());

        let errors = check(&doc);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].layer, Layer::Referential);
        assert_eq!(errors[0].element, "integration->deploy");
        assert!(errors[0].message.contains("unknown phase 'deploy'"));
    }

    #[test]
    fn complete_is_always_resolvable() {
        let doc = canonical::document().unwrap();
        assert!(doc.phase("complete").is_none());
        assert!(check(&doc).is_empty());
    }

    #[test]
    fn handoff_references_are_checked() {
        let mut doc = canonical::document().unwrap();
        doc.handoffs[0].target_role = Some("auditor".into());
        doc.handoffs[0].at_phase = Some("staging".into());
        doc.handoffs[0].content_level = Some("everything".into());

        let errors = check(&doc);
        let messages: Vec<_> = errors.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(errors.len(), 3, "{messages:?}");
        assert!(messages.iter().any(|m| m.contains("unknown role 'auditor'")));
        assert!(messages.iter().any(|m| m.contains("unknown phase 'staging'")));
        assert!(messages.iter().any(|m| m.contains("unknown content level 'everything'")));
    }

    #[test]
    fn unknown_owning_role() {
        let mut doc = canonical::document().unwrap();
        doc.phase_mut("release")
            .unwrap()
            .roles
            .as_mut()
            .unwrap()
            .push("operator".into());

        let errors = check(&doc);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].element, "release");
        assert!(errors[0].message.contains("unknown role 'operator'"));
    }
}
