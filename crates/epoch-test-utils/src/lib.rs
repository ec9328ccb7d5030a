//! Testing utilities for the epoch protocol workspace
//!
//! Shared fixtures, single-defect schema mutations and a scripted slice
//! runner.

#![allow(missing_docs)]

use async_trait::async_trait;
use epoch_core::{ConstraintEvaluator, EpochId, EpochMachine, EpochState};
use epoch_schema::{canonical, Layer, PhaseId, ProtocolSchema, ReviewAxis, RoleId, SchemaDocument};
use epoch_workflow::{ActivityError, EpochHandle, SliceResult, SliceRunner, SliceSpec};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub fn canonical_document() -> SchemaDocument {
    canonical::document().unwrap()
}

pub fn canonical_schema() -> Arc<ProtocolSchema> {
    canonical::schema().unwrap()
}

/// The three canonical review axes
pub fn axes() -> [ReviewAxis; 3] {
    [
        ReviewAxis::correctness(),
        ReviewAxis::test_quality(),
        ReviewAxis::elegance(),
    ]
}

/// Machine for a fresh epoch already sitting at `phase`
pub fn machine_at(phase: PhaseId) -> EpochMachine {
    let schema = canonical_schema();
    let role = schema
        .phase(phase)
        .and_then(|p| p.primary_role())
        .unwrap_or(RoleId::Coordinator);
    let evaluator = Arc::new(ConstraintEvaluator::from_schema(&schema));
    EpochMachine::restore(schema, evaluator, EpochState::new(EpochId::new(), phase, role)).unwrap()
}

/// Send one vote per canonical axis, in axis order
pub async fn vote_all(handle: &EpochHandle, votes: [epoch_schema::VoteType; 3]) {
    for (axis, vote) in axes().into_iter().zip(votes) {
        handle.vote(axis, vote).await.unwrap();
    }
}

/// One deliberate defect applied to the canonical document
#[derive(Clone, Copy)]
pub struct Mutation {
    pub name: &'static str,
    /// Layer expected to report it
    pub layer: Layer,
    /// Text expected in at least one message of that layer
    pub fragment: &'static str,
    pub apply: fn(&mut SchemaDocument),
}

impl std::fmt::Debug for Mutation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutation")
            .field("name", &self.name)
            .field("layer", &self.layer)
            .finish_non_exhaustive()
    }
}

impl Mutation {
    /// Canonical document with this defect applied
    pub fn document(&self) -> SchemaDocument {
        let mut doc = canonical_document();
        (self.apply)(&mut doc);
        doc
    }
}

fn phase<'a>(doc: &'a mut SchemaDocument, id: &str) -> &'a mut epoch_schema::PhaseDoc {
    doc.phase_mut(id).unwrap()
}

/// Every single-defect mutation, one or more per rule
pub fn mutations() -> Vec<Mutation> {
    vec![
        Mutation {
            name: "missing domain",
            layer: Layer::Structural,
            fragment: "intake is missing required field 'domain'",
            apply: |doc| phase(doc, "intake").domain = None,
        },
        Mutation {
            name: "missing constraint severity",
            layer: Layer::Structural,
            fragment: "C-RELEASE-CLEAN is missing required field 'severity'",
            apply: |doc| doc.constraints[2].severity = None,
        },
        Mutation {
            name: "dangling transition target",
            layer: Layer::Referential,
            fragment: "references unknown phase 'deploy'",
            apply: |doc| phase(doc, "release").transitions[0].to = Some("deploy".into()),
        },
        Mutation {
            name: "unknown phase role",
            layer: Layer::Referential,
            fragment: "references unknown role 'product-owner'",
            apply: |doc| phase(doc, "intake").roles = Some(vec!["product-owner".into()]),
        },
        Mutation {
            name: "unknown severity",
            layer: Layer::Referential,
            fragment: "references unknown severity 'fatal'",
            apply: |doc| doc.constraints[0].severity = Some("fatal".into()),
        },
        Mutation {
            name: "handoff at unknown phase",
            layer: Layer::Referential,
            fragment: "references unknown phase 'deployment'",
            apply: |doc| doc.handoffs[2].at_phase = Some("deployment".into()),
        },
        Mutation {
            name: "domain mismatch",
            layer: Layer::Semantic,
            fragment: "domain mismatch",
            apply: |doc| phase(doc, "intake").domain = Some("plan".into()),
        },
        Mutation {
            name: "ordinal mismatch",
            layer: Layer::Semantic,
            fragment: "ordinal mismatch",
            apply: |doc| {
                phase(doc, "intake").number = Some(2);
                phase(doc, "requirements").number = Some(1);
            },
        },
        Mutation {
            name: "duplicate phase number",
            layer: Layer::Semantic,
            fragment: "duplicate phase number 2",
            apply: |doc| phase(doc, "plan-draft").number = Some(2),
        },
        Mutation {
            name: "not a protocol phase",
            layer: Layer::Semantic,
            fragment: "'triage' is not a protocol phase",
            apply: |doc| phase(doc, "intake").id = Some("triage".into()),
        },
        Mutation {
            name: "dead end",
            layer: Layer::Semantic,
            fragment: "has no outbound transition",
            apply: |doc| phase(doc, "release").transitions.clear(),
        },
        Mutation {
            name: "unknown gate axis",
            layer: Layer::Semantic,
            fragment: "unknown review axis 'security'",
            apply: |doc| {
                if let Some(gate) = phase(doc, "plan-review").transitions[0].gate.as_mut() {
                    gate.axes.get_or_insert_with(Vec::new).push("security".into());
                }
            },
        },
        Mutation {
            name: "no accept vote",
            layer: Layer::Semantic,
            fragment: "vote types must include accept",
            apply: |doc| doc.enums.vote_types = vec!["revise".into(), "reject".into()],
        },
        Mutation {
            name: "fan-out outside impl",
            layer: Layer::Semantic,
            fragment: "fan-out phase must be in the impl domain",
            apply: |doc| phase(doc, "plan-draft").fan_out = true,
        },
        Mutation {
            name: "identical handoff roles",
            layer: Layer::Semantic,
            fragment: "source and target role are identical ('coordinator')",
            apply: |doc| doc.handoffs[0].target_role = Some("coordinator".into()),
        },
        Mutation {
            name: "duplicate handoff id",
            layer: Layer::Semantic,
            fragment: "duplicate id 'H-REQUIREMENTS'",
            apply: |doc| doc.handoffs[1].id = Some("H-REQUIREMENTS".into()),
        },
    ]
}

/// Slice runner driven by a fixed script
///
/// Plans `slices` slices named `s0`, `s1`, ... Individual slices can be made
/// to fail a number of times, fail for good, or take a while.
#[derive(Debug, Default)]
pub struct ScriptedSliceRunner {
    slices: usize,
    delay: Option<Duration>,
    slow: HashMap<String, Duration>,
    transient: Mutex<HashMap<String, u32>>,
    permanent: Vec<String>,
    plans: AtomicU32,
    runs: AtomicU32,
    finished: AtomicU32,
}

impl ScriptedSliceRunner {
    pub fn new(slices: usize) -> Self {
        Self {
            slices,
            ..Self::default()
        }
    }

    /// Every slice sleeps this long before finishing
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Slice `id` sleeps `delay` instead of the common delay
    pub fn slow(mut self, id: &str, delay: Duration) -> Self {
        self.slow.insert(id.to_string(), delay);
        self
    }

    /// Slice `id` fails retryably `times` times, then succeeds
    pub fn flaky(self, id: &str, times: u32) -> Self {
        self.transient.lock().insert(id.to_string(), times);
        self
    }

    /// Slice `id` always fails permanently
    pub fn broken(mut self, id: &str) -> Self {
        self.permanent.push(id.to_string());
        self
    }

    pub fn plans(&self) -> u32 {
        self.plans.load(Ordering::SeqCst)
    }

    /// Slice attempts started, including failed ones
    pub fn runs(&self) -> u32 {
        self.runs.load(Ordering::SeqCst)
    }

    /// Slices that ran to completion
    pub fn finished(&self) -> u32 {
        self.finished.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SliceRunner for ScriptedSliceRunner {
    async fn plan_slices(&self, _epoch: &EpochState) -> Result<Vec<SliceSpec>, ActivityError> {
        self.plans.fetch_add(1, Ordering::SeqCst);
        Ok((0..self.slices)
            .map(|i| SliceSpec::new(format!("s{i}"), format!("slice {i}")))
            .collect())
    }

    async fn run_slice(
        &self,
        _epoch_id: EpochId,
        slice: &SliceSpec,
    ) -> Result<SliceResult, ActivityError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let id = slice.id.as_str();

        if self.permanent.iter().any(|p| p == id) {
            return Err(ActivityError::NonRetryable(format!("{id} cannot be built")));
        }
        {
            let mut transient = self.transient.lock();
            if let Some(left) = transient.get_mut(id).filter(|left| **left > 0) {
                *left -= 1;
                return Err(ActivityError::Retryable(format!("{id} worker restarted")));
            }
        }
        if let Some(delay) = self.slow.get(id).copied().or(self.delay) {
            tokio::time::sleep(delay).await;
        }

        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(SliceResult {
            id: slice.id.clone(),
            summary: format!("{id} implemented"),
        })
    }
}
