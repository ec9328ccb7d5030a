//! Side-effecting steps of the epoch flow
//!
//! Each activity is retried by the caller's `RetryPolicy`. Dependencies are
//! injected at construction; a missing one is a permanent failure, since no
//! retry can conjure it.

use crate::audit::{AuditError, AuditEvent, AuditSink};
use crate::error::ActivityError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use epoch_core::{ConstraintEvaluator, EpochId, EpochState, TransitionRecord, Violation};
use epoch_schema::PhaseId;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

pub const CHECK_CONSTRAINTS: &str = "check_constraints";
pub const RECORD_TRANSITION: &str = "record_transition";
pub const RECORD_AUDIT_EVENT: &str = "record_audit_event";
pub const QUERY_AUDIT_EVENTS: &str = "query_audit_events";

/// Names of the four epoch activities
pub const ACTIVITY_NAMES: [&str; 4] = [
    CHECK_CONSTRAINTS,
    RECORD_TRANSITION,
    RECORD_AUDIT_EVENT,
    QUERY_AUDIT_EVENTS,
];

/// Durable record of committed transitions, one entry per `(epoch, seq)`
#[derive(Debug, Default)]
pub struct TransitionLedger {
    entries: DashMap<(EpochId, u64), TransitionRecord>,
}

impl TransitionLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert unless already present; `true` if newly recorded
    pub fn insert(&self, epoch_id: EpochId, record: &TransitionRecord) -> bool {
        match self.entries.entry((epoch_id, record.seq)) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                true
            }
        }
    }

    /// Recorded transitions of one epoch, ordered by `seq`
    #[must_use]
    pub fn records(&self, epoch_id: EpochId) -> Vec<TransitionRecord> {
        let mut records: Vec<TransitionRecord> = self
            .entries
            .iter()
            .filter(|entry| entry.key().0 == epoch_id)
            .map(|entry| entry.value().clone())
            .collect();
        records.sort_by_key(|r| r.seq);
        records
    }
}

/// The four epoch activities
#[derive(Clone, Default)]
pub struct EpochActivities {
    evaluator: Option<Arc<ConstraintEvaluator>>,
    audit: Option<Arc<dyn AuditSink>>,
    ledger: Arc<TransitionLedger>,
}

impl fmt::Debug for EpochActivities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EpochActivities")
            .field("evaluator", &self.evaluator.is_some())
            .field("audit", &self.audit.is_some())
            .finish_non_exhaustive()
    }
}

impl EpochActivities {
    /// Activities with every dependency injected
    #[must_use]
    pub fn new(evaluator: Arc<ConstraintEvaluator>, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            evaluator: Some(evaluator),
            audit: Some(audit),
            ledger: Arc::new(TransitionLedger::new()),
        }
    }

    #[must_use]
    pub fn with_evaluator(mut self, evaluator: Arc<ConstraintEvaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    #[must_use]
    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    #[must_use]
    pub fn with_ledger(mut self, ledger: Arc<TransitionLedger>) -> Self {
        self.ledger = ledger;
        self
    }

    #[inline]
    #[must_use]
    pub fn ledger(&self) -> &Arc<TransitionLedger> {
        &self.ledger
    }

    /// Violations of moving `state` to `target`
    ///
    /// # Errors
    /// `NonRetryable` when no evaluator is configured.
    pub async fn check_constraints(
        &self,
        state: &EpochState,
        target: PhaseId,
    ) -> Result<Vec<Violation>, ActivityError> {
        let evaluator = self
            .evaluator
            .as_ref()
            .ok_or_else(|| ActivityError::not_configured("constraint evaluator"))?;
        Ok(evaluator.evaluate_move(state, target))
    }

    /// Persist a committed transition; `false` when it was already recorded
    ///
    /// # Errors
    /// Never fails for the in-process ledger.
    pub async fn record_transition(
        &self,
        epoch_id: EpochId,
        record: &TransitionRecord,
    ) -> Result<bool, ActivityError> {
        let fresh = self.ledger.insert(epoch_id, record);
        if !fresh {
            tracing::debug!(
                "Epoch {} transition #{} already recorded",
                epoch_id,
                record.seq
            );
        }
        Ok(fresh)
    }

    /// Append an audit event
    ///
    /// # Errors
    /// `NonRetryable` without a sink; `Retryable` when the sink is unavailable.
    pub async fn record_audit_event(&self, event: AuditEvent) -> Result<(), ActivityError> {
        self.sink()?.record(event).await.map_err(classify)
    }

    /// Audit events of an epoch, optionally limited to one phase
    ///
    /// # Errors
    /// Same as `record_audit_event`.
    pub async fn query_audit_events(
        &self,
        epoch_id: EpochId,
        phase: Option<PhaseId>,
    ) -> Result<Vec<AuditEvent>, ActivityError> {
        self.sink()?.query(epoch_id, phase).await.map_err(classify)
    }

    fn sink(&self) -> Result<&Arc<dyn AuditSink>, ActivityError> {
        self.audit
            .as_ref()
            .ok_or_else(|| ActivityError::not_configured("audit sink"))
    }
}

/// Type-erased activity entry point: JSON input in, JSON output out
pub type ActivityHandler =
    fn(EpochActivities, Value) -> BoxFuture<'static, Result<Value, ActivityError>>;

/// Activities addressable by name
#[derive(Clone)]
pub struct ActivityRegistry {
    handlers: BTreeMap<&'static str, ActivityHandler>,
}

impl fmt::Debug for ActivityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivityRegistry")
            .field("names", &self.names())
            .finish()
    }
}

impl Default for ActivityRegistry {
    fn default() -> Self {
        let mut registry = Self {
            handlers: BTreeMap::new(),
        };
        registry.register(CHECK_CONSTRAINTS, check_constraints_entry);
        registry.register(RECORD_TRANSITION, record_transition_entry);
        registry.register(RECORD_AUDIT_EVENT, record_audit_event_entry);
        registry.register(QUERY_AUDIT_EVENTS, query_audit_events_entry);
        registry
    }
}

impl ActivityRegistry {
    /// Registry holding the four epoch activities
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the handler for `name`
    pub fn register(&mut self, name: &'static str, handler: ActivityHandler) {
        if self.handlers.insert(name, handler).is_some() {
            tracing::debug!("Activity {} re-registered", name);
        }
    }

    /// Registered names, sorted
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.handlers.keys().copied().collect()
    }

    /// Run the activity registered as `name`
    ///
    /// # Errors
    /// `NonRetryable` for an unknown name or undecodable input; otherwise
    /// whatever the activity returns.
    pub async fn dispatch(
        &self,
        activities: &EpochActivities,
        name: &str,
        payload: Value,
    ) -> Result<Value, ActivityError> {
        let handler = self.handlers.get(name).ok_or_else(|| {
            ActivityError::NonRetryable(format!("no activity registered as '{name}'"))
        })?;
        handler(activities.clone(), payload).await
    }
}

#[derive(Debug, Deserialize)]
struct CheckConstraintsInput {
    state: EpochState,
    target: PhaseId,
}

#[derive(Debug, Deserialize)]
struct RecordTransitionInput {
    epoch_id: EpochId,
    record: TransitionRecord,
}

#[derive(Debug, Deserialize)]
struct QueryAuditEventsInput {
    epoch_id: EpochId,
    #[serde(default)]
    phase: Option<PhaseId>,
}

fn input<T: DeserializeOwned>(activity: &str, value: Value) -> Result<T, ActivityError> {
    serde_json::from_value(value)
        .map_err(|e| ActivityError::NonRetryable(format!("bad input for {activity}: {e}")))
}

fn output<T: Serialize>(value: &T) -> Result<Value, ActivityError> {
    serde_json::to_value(value).map_err(|e| ActivityError::NonRetryable(e.to_string()))
}

fn check_constraints_entry(
    activities: EpochActivities,
    value: Value,
) -> BoxFuture<'static, Result<Value, ActivityError>> {
    Box::pin(async move {
        let request: CheckConstraintsInput = input(CHECK_CONSTRAINTS, value)?;
        let violations = activities
            .check_constraints(&request.state, request.target)
            .await?;
        output(&violations)
    })
}

fn record_transition_entry(
    activities: EpochActivities,
    value: Value,
) -> BoxFuture<'static, Result<Value, ActivityError>> {
    Box::pin(async move {
        let request: RecordTransitionInput = input(RECORD_TRANSITION, value)?;
        let fresh = activities
            .record_transition(request.epoch_id, &request.record)
            .await?;
        output(&fresh)
    })
}

fn record_audit_event_entry(
    activities: EpochActivities,
    value: Value,
) -> BoxFuture<'static, Result<Value, ActivityError>> {
    Box::pin(async move {
        let event: AuditEvent = input(RECORD_AUDIT_EVENT, value)?;
        activities.record_audit_event(event).await?;
        Ok(Value::Null)
    })
}

fn query_audit_events_entry(
    activities: EpochActivities,
    value: Value,
) -> BoxFuture<'static, Result<Value, ActivityError>> {
    Box::pin(async move {
        let request: QueryAuditEventsInput = input(QUERY_AUDIT_EVENTS, value)?;
        let events = activities
            .query_audit_events(request.epoch_id, request.phase)
            .await?;
        output(&events)
    })
}

fn classify(error: AuditError) -> ActivityError {
    match error {
        AuditError::Unavailable(_) => ActivityError::Retryable(error.to_string()),
        AuditError::IntegrityViolation { .. } => ActivityError::NonRetryable(error.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditEventKind, InMemoryAuditSink, MockAuditSink};
    use crate::retry::RetryPolicy;
    use chrono::Utc;
    use epoch_schema::{canonical, RoleId};

    fn record(seq: u64) -> TransitionRecord {
        TransitionRecord {
            seq,
            from: PhaseId::Intake,
            to: PhaseId::Requirements,
            triggered_by: "coordinator".into(),
            condition_met: "request captured".into(),
            at: Utc::now(),
        }
    }

    fn configured() -> EpochActivities {
        let schema = canonical::schema().unwrap();
        EpochActivities::new(
            Arc::new(ConstraintEvaluator::from_schema(&schema)),
            Arc::new(InMemoryAuditSink::new()),
        )
    }

    #[tokio::test]
    async fn record_transition_is_idempotent() {
        let activities = configured();
        let epoch = EpochId::new();

        assert!(activities.record_transition(epoch, &record(1)).await.unwrap());
        assert!(!activities.record_transition(epoch, &record(1)).await.unwrap());
        assert!(activities.record_transition(epoch, &record(2)).await.unwrap());

        let seqs: Vec<u64> = activities.ledger().records(epoch).iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[tokio::test]
    async fn missing_dependencies_are_permanent() {
        let bare = EpochActivities::default();
        let state = EpochState::new(EpochId::new(), PhaseId::Intake, RoleId::Coordinator);

        let err = bare
            .check_constraints(&state, PhaseId::Requirements)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ActivityError::NonRetryable("constraint evaluator not configured".into())
        );

        let event = AuditEvent::new(state.epoch_id, state.phase, AuditEventKind::Vote, "x");
        assert!(!bare.record_audit_event(event).await.unwrap_err().is_retryable());
        assert!(!bare
            .query_audit_events(state.epoch_id, None)
            .await
            .unwrap_err()
            .is_retryable());
    }

    #[tokio::test]
    async fn audit_round_trip() {
        let activities = configured();
        let epoch = EpochId::new();
        activities
            .record_audit_event(AuditEvent::new(
                epoch,
                PhaseId::CodeReview,
                AuditEventKind::Blockers,
                "blockers = 2",
            ))
            .await
            .unwrap();

        let events = activities
            .query_audit_events(epoch, Some(PhaseId::CodeReview))
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert!(activities
            .query_audit_events(epoch, Some(PhaseId::Intake))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn unavailable_sink_is_retried() {
        let mut sink = MockAuditSink::new();
        let mut calls = 0;
        sink.expect_record().times(3).returning(move |_| {
            calls += 1;
            if calls < 3 {
                Err(AuditError::Unavailable("connection reset".into()))
            } else {
                Ok(())
            }
        });

        let activities = EpochActivities::default().with_audit(Arc::new(sink));
        let event = AuditEvent::new(EpochId::new(), PhaseId::Intake, AuditEventKind::Vote, "x");

        RetryPolicy::immediate(5)
            .execute(RECORD_AUDIT_EVENT, || {
                activities.record_audit_event(event.clone())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn broken_chain_is_not_retried() {
        let mut sink = MockAuditSink::new();
        sink.expect_query()
            .times(1)
            .returning(|_, _| Err(AuditError::IntegrityViolation { index: 4 }));

        let activities = EpochActivities::default().with_audit(Arc::new(sink));
        let result = RetryPolicy::immediate(5)
            .execute(QUERY_AUDIT_EVENTS, || {
                activities.query_audit_events(EpochId::new(), None)
            })
            .await;
        assert!(matches!(result, Err(ActivityError::NonRetryable(_))));
    }

    #[tokio::test]
    async fn registry_dispatches_by_name() {
        let registry = ActivityRegistry::new();
        let activities = configured();
        let epoch = EpochId::new();
        let mut expected = ACTIVITY_NAMES.to_vec();
        expected.sort_unstable();
        assert_eq!(registry.names(), expected);

        let state = EpochState::new(epoch, PhaseId::Intake, RoleId::Coordinator);
        let violations = registry
            .dispatch(
                &activities,
                CHECK_CONSTRAINTS,
                serde_json::json!({ "state": state, "target": "requirements" }),
            )
            .await
            .unwrap();
        assert!(violations.is_array());

        let fresh = registry
            .dispatch(
                &activities,
                RECORD_TRANSITION,
                serde_json::json!({ "epoch_id": epoch, "record": record(1) }),
            )
            .await
            .unwrap();
        assert_eq!(fresh, Value::Bool(true));
        assert_eq!(activities.ledger().records(epoch).len(), 1);

        let event = AuditEvent::new(epoch, PhaseId::Intake, AuditEventKind::Vote, "x");
        registry
            .dispatch(&activities, RECORD_AUDIT_EVENT, serde_json::to_value(&event).unwrap())
            .await
            .unwrap();
        let events = registry
            .dispatch(
                &activities,
                QUERY_AUDIT_EVENTS,
                serde_json::json!({ "epoch_id": epoch }),
            )
            .await
            .unwrap();
        assert_eq!(events.as_array().map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn registry_refuses_unknown_names_and_bad_input() {
        let registry = ActivityRegistry::new();
        let activities = configured();

        let unknown = registry
            .dispatch(&activities, "deploy", Value::Null)
            .await
            .unwrap_err();
        assert_eq!(
            unknown,
            ActivityError::NonRetryable("no activity registered as 'deploy'".into())
        );

        let malformed = registry
            .dispatch(&activities, QUERY_AUDIT_EVENTS, serde_json::json!({ "phase": 3 }))
            .await
            .unwrap_err();
        assert!(!malformed.is_retryable());
    }
}
