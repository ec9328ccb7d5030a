//! Worker registry
//!
//! A `Worker` hosts the epoch, slice and review flows plus the four
//! activities on one task queue, each registered by name. Each started
//! epoch runs as its own tokio task; the worker keeps its signal handle and
//! join handle until someone waits on it, evicts it, or a later start reaps
//! it after it finished.

use crate::activities::{ActivityRegistry, EpochActivities};
use crate::audit::{AuditSink, InMemoryAuditSink};
use crate::epoch::{EpochOutcome, EpochRun};
use crate::error::WorkflowError;
use crate::history::{HistoryStore, InMemoryHistory, WorkflowContext};
use crate::retry::RetryPolicy;
use crate::signal::{EpochHandle, SignalInbox};
use crate::slice::SliceRunner;
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use epoch_core::{ConstraintEvaluator, EpochId, EpochMachine, EpochState};
use epoch_schema::ProtocolSchema;
use futures::future::join_all;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;

pub const EPOCH_FLOW: &str = "epoch";
pub const SLICE_FLOW: &str = "slice";
pub const REVIEW_FLOW: &str = "review";

/// What a flow is started from
///
/// With neither field set the epoch flow starts a fresh epoch. With only an
/// id it resumes that epoch from its journal. A `state` enters the flow at
/// the state's phase; it must be the epoch's latest state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowRequest {
    #[serde(default)]
    pub epoch_id: Option<EpochId>,
    #[serde(default)]
    pub state: Option<EpochState>,
}

impl FlowRequest {
    #[must_use]
    pub fn resume(epoch_id: EpochId) -> Self {
        Self {
            epoch_id: Some(epoch_id),
            state: None,
        }
    }

    #[must_use]
    pub fn from_state(state: EpochState) -> Self {
        Self {
            epoch_id: None,
            state: Some(state),
        }
    }
}

/// Entry point of a named flow
pub type FlowHandler = fn(&Worker, FlowRequest) -> Result<EpochHandle, WorkflowError>;

/// Where the worker listens
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerOptions {
    pub namespace: String,
    pub task_queue: String,
    pub address: String,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            task_queue: "epoch-protocol".to_string(),
            address: "127.0.0.1:7233".to_string(),
        }
    }
}

type Running = (EpochHandle, JoinHandle<Result<EpochOutcome, WorkflowError>>);

/// Hosts epoch flows
pub struct Worker {
    options: WorkerOptions,
    schema: Arc<ProtocolSchema>,
    evaluator: Arc<ConstraintEvaluator>,
    activities: EpochActivities,
    history: Arc<dyn HistoryStore>,
    slices: Option<Arc<dyn SliceRunner>>,
    retry: RetryPolicy,
    flows: BTreeMap<&'static str, FlowHandler>,
    registry: ActivityRegistry,
    running: DashMap<EpochId, Running>,
    /// Epochs with a `wait` in progress; never reaped
    awaited: DashSet<EpochId>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("options", &self.options)
            .field("activities", &self.activities)
            .field("flows", &self.registered_flows())
            .field("running", &self.running.len())
            .finish_non_exhaustive()
    }
}

impl Worker {
    /// Worker with an evaluator compiled from `schema`, an in-memory audit
    /// sink and an in-memory journal
    #[must_use]
    pub fn new(options: WorkerOptions, schema: Arc<ProtocolSchema>) -> Self {
        let evaluator = Arc::new(ConstraintEvaluator::from_schema(&schema));
        let activities =
            EpochActivities::new(Arc::clone(&evaluator), Arc::new(InMemoryAuditSink::new()));

        Self {
            options,
            schema,
            evaluator,
            activities,
            history: Arc::new(InMemoryHistory::new()),
            slices: None,
            retry: RetryPolicy::default(),
            flows: default_flows(),
            registry: ActivityRegistry::new(),
            running: DashMap::new(),
            awaited: DashSet::new(),
        }
    }

    #[must_use]
    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.activities = self.activities.with_audit(audit);
        self
    }

    #[must_use]
    pub fn with_activities(mut self, activities: EpochActivities) -> Self {
        self.activities = activities;
        self
    }

    #[must_use]
    pub fn with_history(mut self, history: Arc<dyn HistoryStore>) -> Self {
        self.history = history;
        self
    }

    #[must_use]
    pub fn with_slices(mut self, runner: Arc<dyn SliceRunner>) -> Self {
        self.slices = Some(runner);
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Add or replace the flow started as `name`
    #[must_use]
    pub fn with_flow(mut self, name: &'static str, handler: FlowHandler) -> Self {
        if self.flows.insert(name, handler).is_some() {
            tracing::debug!("Flow {} re-registered", name);
        }
        self
    }

    #[must_use]
    pub fn with_registry(mut self, registry: ActivityRegistry) -> Self {
        self.registry = registry;
        self
    }

    #[inline]
    #[must_use]
    pub fn options(&self) -> &WorkerOptions {
        &self.options
    }

    #[inline]
    #[must_use]
    pub fn schema(&self) -> &Arc<ProtocolSchema> {
        &self.schema
    }

    #[inline]
    #[must_use]
    pub fn activities(&self) -> &EpochActivities {
        &self.activities
    }

    /// Flow names, sorted
    #[must_use]
    pub fn registered_flows(&self) -> Vec<&'static str> {
        self.flows.keys().copied().collect()
    }

    /// Activity names, sorted
    #[must_use]
    pub fn registered_activities(&self) -> Vec<&'static str> {
        self.registry.names()
    }

    /// Start the flow registered as `name`
    ///
    /// # Errors
    /// `UnknownFlow`, `InvalidRequest` when the request does not fit the
    /// flow, or whatever the flow's handler refuses.
    pub fn start_flow(
        &self,
        name: &str,
        request: FlowRequest,
    ) -> Result<EpochHandle, WorkflowError> {
        let handler = self
            .flows
            .get(name)
            .ok_or_else(|| WorkflowError::UnknownFlow(name.to_string()))?;
        handler(self, request)
    }

    /// Run the activity registered as `name` under the worker's retry policy
    ///
    /// # Errors
    /// The activity's failure once retries are exhausted, classified like
    /// any other activity failure.
    pub async fn run_activity(&self, name: &str, payload: Value) -> Result<Value, WorkflowError> {
        self.retry
            .execute(name, move || {
                self.registry
                    .dispatch(&self.activities, name, payload.clone())
            })
            .await
            .map_err(|e| WorkflowError::from_activity(name, e))
    }

    /// Start a new epoch
    ///
    /// # Errors
    /// Never for a fresh id.
    pub fn start_epoch(&self) -> Result<EpochHandle, WorkflowError> {
        self.start_epoch_with_id(EpochId::new())
    }

    /// Start, or resume from the journal, the epoch with this id
    ///
    /// # Errors
    /// `AlreadyRunning` when the epoch is still hosted here.
    pub fn start_epoch_with_id(&self, epoch_id: EpochId) -> Result<EpochHandle, WorkflowError> {
        let machine =
            EpochMachine::with_id(Arc::clone(&self.schema), Arc::clone(&self.evaluator), epoch_id);
        self.host(machine)
    }

    /// Continue an epoch from a saved state
    ///
    /// # Errors
    /// `Protocol` when the state's phase is not in the schema, or
    /// `AlreadyRunning`.
    pub fn restore_epoch(&self, state: EpochState) -> Result<EpochHandle, WorkflowError> {
        let machine =
            EpochMachine::restore(Arc::clone(&self.schema), Arc::clone(&self.evaluator), state)?;
        self.host(machine)
    }

    fn host(&self, machine: EpochMachine) -> Result<EpochHandle, WorkflowError> {
        self.reap_finished();

        let epoch_id = machine.epoch_id();
        let slot = match self.running.entry(epoch_id) {
            Entry::Occupied(_) => {
                return Err(WorkflowError::AlreadyRunning(epoch_id));
            }
            Entry::Vacant(slot) => slot,
        };

        let (handle, inbox) = SignalInbox::channel(epoch_id);
        let ctx = WorkflowContext::new(epoch_id.to_string(), Arc::clone(&self.history));
        let mut run = EpochRun::new(machine, ctx, inbox, self.activities.clone())
            .with_retry(self.retry.clone());
        if let Some(runner) = &self.slices {
            run = run.with_slices(Arc::clone(runner));
        }

        tracing::info!(
            "Starting epoch {} at {} on {}/{}",
            epoch_id,
            run.machine().phase(),
            self.options.namespace,
            self.options.task_queue
        );
        let task = tokio::spawn(run.run());
        slot.insert((handle.clone(), task));
        Ok(handle)
    }

    /// Signal handle of a running epoch
    #[must_use]
    pub fn handle(&self, epoch_id: EpochId) -> Option<EpochHandle> {
        self.running.get(&epoch_id).map(|entry| entry.0.clone())
    }

    /// Ids of every epoch still hosted
    #[must_use]
    pub fn running(&self) -> Vec<EpochId> {
        self.running.iter().map(|entry| *entry.key()).collect()
    }

    /// Ids of hosted epochs whose flow has already returned
    #[must_use]
    pub fn finished(&self) -> Vec<EpochId> {
        self.running
            .iter()
            .filter(|entry| entry.value().1.is_finished())
            .map(|entry| *entry.key())
            .collect()
    }

    /// Stop hosting every epoch whose flow has returned, logging how each
    /// ended; returns how many were dropped
    pub fn reap_finished(&self) -> usize {
        let before = self.running.len();
        self.running.retain(|epoch_id, (_, task)| {
            if !task.is_finished() || self.awaited.contains(epoch_id) {
                return true;
            }
            match task.now_or_never() {
                Some(Ok(Ok(done))) => tracing::info!(
                    "Reaped epoch {} at {} ({})",
                    epoch_id,
                    done.state().phase,
                    if done.is_completed() { "completed" } else { "cancelled" }
                ),
                Some(Ok(Err(err))) => tracing::error!("Reaped epoch {} failed: {}", epoch_id, err),
                Some(Err(err)) => tracing::error!("Reaped epoch {} task: {}", epoch_id, err),
                None => return true,
            }
            false
        });
        before.saturating_sub(self.running.len())
    }

    /// Stop hosting an epoch without waiting for it; its journal stays so
    /// another worker can resume it. `false` when it was not hosted here.
    pub fn evict(&self, epoch_id: EpochId) -> bool {
        match self.running.remove(&epoch_id) {
            Some((_, (_, task))) => {
                task.abort();
                tracing::warn!("Evicted epoch {}", epoch_id);
                true
            }
            None => false,
        }
    }

    /// Wait for an epoch to finish and stop hosting it
    ///
    /// # Errors
    /// `UnknownEpoch` when it is not hosted, including after it was reaped
    /// before this call;
    /// `Join`, or whatever stopped the flow.
    pub async fn wait(&self, epoch_id: EpochId) -> Result<EpochOutcome, WorkflowError> {
        // Stay hosted, and signalable, until the flow drops its inbox.
        let handle = self
            .handle(epoch_id)
            .ok_or(WorkflowError::UnknownEpoch(epoch_id))?;
        let hosted = {
            let _awaiting = Awaiting::new(&self.awaited, epoch_id);
            handle.closed().await;
            self.running.remove(&epoch_id)
        };
        let (_, (_, task)) = hosted.ok_or(WorkflowError::UnknownEpoch(epoch_id))?;
        let outcome = task
            .await
            .map_err(|e| WorkflowError::Join(e.to_string()))?;

        match &outcome {
            Ok(done) => tracing::info!(
                "Epoch {} finished at {} ({})",
                epoch_id,
                done.state().phase,
                if done.is_completed() { "completed" } else { "cancelled" }
            ),
            Err(err) => tracing::error!("Epoch {} failed: {}", epoch_id, err),
        }
        outcome
    }

    /// Serve until `shutdown` resolves, then cancel and drain every epoch
    pub async fn run_until<F>(
        &self,
        shutdown: F,
    ) -> Vec<(EpochId, Result<EpochOutcome, WorkflowError>)>
    where
        F: Future<Output = ()>,
    {
        tracing::info!(
            "Worker serving {} flow(s) and {} activities on {} at {}",
            self.flows.len(),
            self.registry.names().len(),
            self.options.task_queue,
            self.options.address
        );
        shutdown.await;

        let ids = self.running();
        tracing::info!("Worker shutting down, cancelling {} epoch(s)", ids.len());
        for id in &ids {
            if let Some(handle) = self.handle(*id) {
                if handle.cancel().await.is_err() {
                    tracing::debug!("Epoch {} already stopped listening", id);
                }
            }
        }

        join_all(ids.into_iter().map(|id| async move { (id, self.wait(id).await) })).await
    }
}

/// Marks an epoch as awaited for as long as it lives
struct Awaiting<'a> {
    awaited: &'a DashSet<EpochId>,
    epoch_id: EpochId,
}

impl<'a> Awaiting<'a> {
    fn new(awaited: &'a DashSet<EpochId>, epoch_id: EpochId) -> Self {
        awaited.insert(epoch_id);
        Self { awaited, epoch_id }
    }
}

impl Drop for Awaiting<'_> {
    fn drop(&mut self) {
        self.awaited.remove(&self.epoch_id);
    }
}

fn default_flows() -> BTreeMap<&'static str, FlowHandler> {
    let mut flows: BTreeMap<&'static str, FlowHandler> = BTreeMap::new();
    flows.insert(EPOCH_FLOW, start_epoch_flow);
    flows.insert(SLICE_FLOW, start_slice_flow);
    flows.insert(REVIEW_FLOW, start_review_flow);
    flows
}

/// The request's state, checked against its explicit id
fn requested_state(flow: &str, request: FlowRequest) -> Result<Option<EpochState>, WorkflowError> {
    match (request.epoch_id, request.state) {
        (Some(id), Some(state)) if state.epoch_id != id => Err(WorkflowError::InvalidRequest {
            flow: flow.to_string(),
            reason: format!("state belongs to epoch {}, not {}", state.epoch_id, id),
        }),
        (_, state) => Ok(state),
    }
}

fn start_epoch_flow(worker: &Worker, request: FlowRequest) -> Result<EpochHandle, WorkflowError> {
    let epoch_id = request.epoch_id;
    match requested_state(EPOCH_FLOW, request)? {
        Some(state) => worker.restore_epoch(state),
        None => worker.start_epoch_with_id(epoch_id.unwrap_or_default()),
    }
}

/// Enter an epoch at a phase of the kind `flow` works
fn start_at_phase(
    worker: &Worker,
    flow: &str,
    request: FlowRequest,
    fits: fn(&epoch_schema::PhaseSpec) -> bool,
) -> Result<EpochHandle, WorkflowError> {
    let state = requested_state(flow, request)?.ok_or_else(|| WorkflowError::InvalidRequest {
        flow: flow.to_string(),
        reason: "a state to enter from is required".to_string(),
    })?;
    let fitting = worker.schema.phase(state.phase).is_some_and(fits);
    if !fitting {
        return Err(WorkflowError::InvalidRequest {
            flow: flow.to_string(),
            reason: format!("phase {} is not a {} phase", state.phase, flow),
        });
    }
    worker.restore_epoch(state)
}

fn start_slice_flow(worker: &Worker, request: FlowRequest) -> Result<EpochHandle, WorkflowError> {
    start_at_phase(worker, SLICE_FLOW, request, |spec| spec.fan_out)
}

fn start_review_flow(worker: &Worker, request: FlowRequest) -> Result<EpochHandle, WorkflowError> {
    start_at_phase(worker, REVIEW_FLOW, request, |spec| spec.gated().is_some())
}
