//! Semantic layer: protocol rules beyond syntax
//!
//! - Phase ids name protocol phases at their canonical ordinals
//! - Declared domains match the canonical ordinal-to-domain mapping
//! - Phase numbers are unique and contiguous from 1
//! - Every phase reachable from phase 1 has an outbound transition, and
//!   some reachable phase leads to COMPLETE
//! - Gates reference declared review axes; revision edges carry no gate
//! - Handoffs connect two different roles
//! - Ids are unique per element kind

use super::{constraint_label, handoff_label, phase_label, role_label, transition_label, TERMINAL_ID};
use crate::document::SchemaDocument;
use crate::error::TypedError;
use crate::types::{ContentLevel, Domain, PhaseId, RoleId, Severity, VoteType};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Bfs;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::str::FromStr;

pub(super) fn check(doc: &SchemaDocument) -> Vec<TypedError> {
    let mut errors = Vec::new();

    check_enums(doc, &mut errors);
    check_roles(doc, &mut errors);
    check_phases(doc, &mut errors);
    check_contiguity(doc, &mut errors);
    check_gates(doc, &mut errors);
    check_reachability(doc, &mut errors);
    check_constraints(doc, &mut errors);
    check_handoffs(doc, &mut errors);

    errors
}

fn check_enums(doc: &SchemaDocument, errors: &mut Vec<TypedError>) {
    let enums = &doc.enums;

    unrecognised::<Domain>(errors, "domains", &enums.domains);
    unrecognised::<VoteType>(errors, "vote-types", &enums.vote_types);
    unrecognised::<Severity>(errors, "severities", &enums.severities);
    unrecognised::<ContentLevel>(errors, "content-levels", &enums.content_levels);

    if !enums.vote_types.is_empty() && !enums.vote_types.iter().any(|v| v == "accept") {
        errors.push(TypedError::semantic(
            "enums.vote-types",
            "vote types must include accept",
        ));
    }

    let mut seen = HashSet::new();
    for axis in &enums.review_axes {
        if !seen.insert(axis.as_str()) {
            errors.push(TypedError::semantic(
                "enums.review-axes",
                format!("duplicate review axis '{axis}'"),
            ));
        }
    }
}

fn unrecognised<T: FromStr>(errors: &mut Vec<TypedError>, block: &str, values: &[String]) {
    for value in values {
        if value.parse::<T>().is_err() {
            errors.push(TypedError::semantic(
                format!("enums.{block}"),
                format!("enum {block} declares '{value}', which the protocol does not define"),
            ));
        }
    }
}

fn check_roles(doc: &SchemaDocument, errors: &mut Vec<TypedError>) {
    let mut seen = HashSet::new();
    for (idx, role) in doc.roles.iter().enumerate() {
        let Some(id) = role.id.as_deref() else {
            continue;
        };
        let label = role_label(idx, role);
        if !seen.insert(id) {
            errors.push(duplicate(&label, id));
        }
        if RoleId::from_str(id).is_err() {
            errors.push(TypedError::semantic(
                &label,
                format!("'{id}' is not a protocol role"),
            ));
        }
    }
}

fn check_phases(doc: &SchemaDocument, errors: &mut Vec<TypedError>) {
    let mut seen_ids = HashSet::new();
    let mut seen_numbers: HashMap<u8, String> = HashMap::new();

    for (idx, phase) in doc.phases.iter().enumerate() {
        let label = phase_label(idx, phase);

        let known = match phase.id.as_deref() {
            Some(id) => {
                if !seen_ids.insert(id) {
                    errors.push(duplicate(&label, id));
                }
                match PhaseId::from_str(id) {
                    Ok(p) if !p.is_terminal() => Some(p),
                    _ => {
                        errors.push(TypedError::semantic(
                            &label,
                            format!("'{id}' is not a protocol phase"),
                        ));
                        None
                    }
                }
            }
            None => None,
        };

        if let Some(number) = phase.number {
            if let Some(previous) = seen_numbers.insert(number, label.clone()) {
                errors.push(TypedError::semantic(
                    &label,
                    format!("duplicate phase number {number} (also declared by '{previous}')"),
                ));
            }

            match (Domain::for_ordinal(number), known) {
                (None, _) => errors.push(TypedError::semantic(
                    &label,
                    format!("phase number {number} is outside 1..=12"),
                )),
                (Some(canonical), known) => {
                    if let Some(p) = known {
                        if p.number() != Some(number) {
                            errors.push(TypedError::semantic(
                                &label,
                                format!(
                                    "ordinal mismatch: '{p}' is phase {}, declared {number}",
                                    p.number().unwrap_or_default()
                                ),
                            ));
                        }
                    }

                    let declared = phase.domain.as_deref().and_then(|d| d.parse::<Domain>().ok());
                    if let Some(declared) = declared {
                        if declared != canonical {
                            errors.push(TypedError::semantic(
                                &label,
                                format!(
                                    "domain mismatch: phase {number} belongs to the {canonical} domain, declared {declared}"
                                ),
                            ));
                        }
                    }
                }
            }
        }

        if phase.fan_out {
            let declared = phase.domain.as_deref().and_then(|d| d.parse::<Domain>().ok());
            if declared.is_some_and(|d| d != Domain::Impl) {
                errors.push(TypedError::semantic(
                    &label,
                    "fan-out phase must be in the impl domain",
                ));
            }
        }

        if phase.roles.as_ref().is_some_and(Vec::is_empty) {
            errors.push(TypedError::semantic(&label, format!("{label} owns no roles")));
        }
    }
}

fn check_contiguity(doc: &SchemaDocument, errors: &mut Vec<TypedError>) {
    let numbers: BTreeSet<u8> = doc.phases.iter().filter_map(|p| p.number).collect();
    let Some(&max) = numbers.iter().next_back() else {
        return;
    };

    let missing: Vec<String> = (1..=max)
        .filter(|n| !numbers.contains(n))
        .map(|n| n.to_string())
        .collect();

    if !missing.is_empty() {
        errors.push(TypedError::semantic(
            "phases",
            format!("phase numbers are not contiguous: missing {}", missing.join(", ")),
        ));
    }
}

fn check_gates(doc: &SchemaDocument, errors: &mut Vec<TypedError>) {
    let axes: HashSet<&str> = doc.enums.review_axes.iter().map(String::as_str).collect();

    for (idx, phase) in doc.phases.iter().enumerate() {
        let label = phase_label(idx, phase);
        for (t_idx, transition) in phase.transitions.iter().enumerate() {
            let Some(gate) = &transition.gate else {
                continue;
            };
            let t_label = transition_label(&label, t_idx, transition);

            if transition.kind.as_deref() == Some("revision") {
                errors.push(TypedError::semantic(
                    &t_label,
                    "revision transition cannot carry a consensus gate",
                ));
            }

            let Some(gate_axes) = &gate.axes else {
                continue;
            };
            if gate_axes.is_empty() {
                errors.push(TypedError::semantic(
                    &t_label,
                    format!("gate on {t_label} declares no review axes"),
                ));
            }
            for axis in gate_axes {
                if !axes.contains(axis.as_str()) {
                    errors.push(TypedError::semantic(
                        &t_label,
                        format!("gate on {t_label} references unknown review axis '{axis}'"),
                    ));
                }
            }
        }
    }
}

fn check_reachability(doc: &SchemaDocument, errors: &mut Vec<TypedError>) {
    let mut graph: DiGraph<usize, ()> = DiGraph::new();
    let mut nodes: HashMap<&str, NodeIndex> = HashMap::new();

    for (idx, phase) in doc.phases.iter().enumerate() {
        if let Some(id) = phase.id.as_deref() {
            nodes.entry(id).or_insert_with(|| graph.add_node(idx));
        }
    }

    for phase in &doc.phases {
        let Some(from) = phase.id.as_deref().and_then(|id| nodes.get(id)) else {
            continue;
        };
        for transition in &phase.transitions {
            if let Some(to) = transition.to.as_deref().and_then(|to| nodes.get(to)) {
                graph.add_edge(*from, *to, ());
            }
        }
    }

    let start = doc
        .phases
        .iter()
        .find(|p| p.number == Some(1))
        .and_then(|p| p.id.as_deref())
        .and_then(|id| nodes.get(id));
    let Some(&start) = start else {
        return;
    };

    let mut reaches_terminal = false;
    let mut bfs = Bfs::new(&graph, start);
    while let Some(node) = bfs.next(&graph) {
        let idx = graph[node];
        let phase = &doc.phases[idx];

        if phase.transitions.is_empty() {
            let label = phase_label(idx, phase);
            errors.push(TypedError::semantic(
                &label,
                format!("phase '{label}' is reachable from phase 1 but has no outbound transition"),
            ));
        }

        reaches_terminal |= phase
            .transitions
            .iter()
            .any(|t| t.to.as_deref() == Some(TERMINAL_ID));
    }

    if !reaches_terminal {
        errors.push(TypedError::semantic(
            "phases",
            "no phase reachable from phase 1 transitions to complete",
        ));
    }
}

fn check_constraints(doc: &SchemaDocument, errors: &mut Vec<TypedError>) {
    let mut seen = HashSet::new();
    for (idx, constraint) in doc.constraints.iter().enumerate() {
        if let Some(id) = constraint.id.as_deref() {
            if !seen.insert(id) {
                errors.push(duplicate(&constraint_label(idx, constraint), id));
            }
        }
    }
}

fn check_handoffs(doc: &SchemaDocument, errors: &mut Vec<TypedError>) {
    let mut seen = HashSet::new();
    for (idx, handoff) in doc.handoffs.iter().enumerate() {
        let label = handoff_label(idx, handoff);
        if let Some(id) = handoff.id.as_deref() {
            if !seen.insert(id) {
                errors.push(duplicate(&label, id));
            }
        }
        if let (Some(source), Some(target)) = (&handoff.source_role, &handoff.target_role) {
            if source == target {
                errors.push(TypedError::semantic(
                    &label,
                    format!("handoff {label}: source and target role are identical ('{source}')"),
                ));
            }
        }
    }
}

fn duplicate(element: &str, id: &str) -> TypedError {
    TypedError::semantic(element, format!("duplicate id '{id}'"))
}
