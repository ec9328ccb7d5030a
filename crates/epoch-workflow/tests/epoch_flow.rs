use epoch_schema::{PhaseId, VoteType};
use epoch_test_utils::{canonical_schema, vote_all, ScriptedSliceRunner};
use epoch_workflow::{
    AuditEventKind, EpochActivities, EpochHandle, EpochOutcome, HistoryStore, InMemoryAuditSink,
    InMemoryHistory, RetryPolicy, Worker, WorkerOptions, WorkflowError,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

const ACCEPT: [VoteType; 3] = [VoteType::Accept; 3];

fn worker(runner: Arc<ScriptedSliceRunner>, audit: Arc<InMemoryAuditSink>) -> Worker {
    Worker::new(WorkerOptions::default(), canonical_schema())
        .with_slices(runner)
        .with_audit(audit)
        .with_retry(RetryPolicy::immediate(3))
}

async fn complete(handle: &EpochHandle, times: usize) {
    for _ in 0..times {
        handle
            .phase_complete("test", "done", None)
            .await
            .unwrap();
    }
}

/// Intake through slice planning; the epoch ends up in implementation
async fn drive_to_implementation(handle: &EpochHandle) {
    complete(handle, 3).await;
    vote_all(handle, ACCEPT).await;
    complete(handle, 3).await;
}

fn phases(outcome: &EpochOutcome) -> Vec<PhaseId> {
    outcome.state().history.iter().map(|r| r.to).collect()
}

#[tokio::test]
async fn epoch_runs_to_completion() {
    let runner = Arc::new(ScriptedSliceRunner::new(3));
    let audit = Arc::new(InMemoryAuditSink::new());
    let worker = worker(Arc::clone(&runner), Arc::clone(&audit));
    let handle = worker.start_epoch().unwrap();
    let id = handle.epoch_id();

    drive_to_implementation(&handle).await;
    complete(&handle, 1).await;
    vote_all(&handle, ACCEPT).await;
    complete(&handle, 2).await;

    let outcome = worker.wait(id).await.unwrap();
    assert!(outcome.is_completed());
    assert_eq!(
        phases(&outcome),
        vec![
            PhaseId::Requirements,
            PhaseId::PlanDraft,
            PhaseId::PlanReview,
            PhaseId::PlanApproval,
            PhaseId::TaskBreakdown,
            PhaseId::SlicePlanning,
            PhaseId::Implementation,
            PhaseId::Integration,
            PhaseId::CodeReview,
            PhaseId::Acceptance,
            PhaseId::Release,
            PhaseId::Complete,
        ]
    );

    assert_eq!(runner.plans(), 1);
    assert_eq!(runner.finished(), 3);
    assert_eq!(worker.activities().ledger().records(id).len(), 12);

    audit.verify_integrity().unwrap();
    let events = audit.events();
    let count = |kind| events.iter().filter(|e| e.kind == kind).count();
    assert_eq!(count(AuditEventKind::Transition), 12);
    assert_eq!(count(AuditEventKind::Vote), 6);
    assert_eq!(count(AuditEventKind::SliceCompleted), 3);
    assert_eq!(count(AuditEventKind::Rejection), 0);
}

#[tokio::test]
async fn split_vote_sends_the_plan_back() {
    let runner = Arc::new(ScriptedSliceRunner::new(1));
    let worker = worker(runner, Arc::new(InMemoryAuditSink::new()));
    let handle = worker.start_epoch().unwrap();

    complete(&handle, 3).await;
    vote_all(&handle, [VoteType::Accept, VoteType::Accept, VoteType::Revise]).await;
    handle.cancel().await.unwrap();

    let outcome = worker.wait(handle.epoch_id()).await.unwrap();
    let EpochOutcome::Cancelled(state) = outcome else {
        panic!("expected cancellation");
    };
    assert_eq!(state.phase, PhaseId::PlanDraft);
    assert_eq!(state.revisions, 1);
    assert!(state.votes.is_empty());
    let last = state.history.last().unwrap();
    assert_eq!((last.from, last.to), (PhaseId::PlanReview, PhaseId::PlanDraft));
}

#[tokio::test]
async fn refused_move_is_audited_and_the_epoch_waits() {
    let audit = Arc::new(InMemoryAuditSink::new());
    let worker = worker(Arc::new(ScriptedSliceRunner::new(1)), Arc::clone(&audit));
    let handle = worker.start_epoch().unwrap();

    handle
        .phase_complete("coordinator", "skip ahead", Some(PhaseId::Release))
        .await
        .unwrap();
    complete(&handle, 1).await;
    handle.cancel().await.unwrap();

    let outcome = worker.wait(handle.epoch_id()).await.unwrap();
    assert_eq!(outcome.state().phase, PhaseId::Requirements);

    let kinds: Vec<_> = audit.events().iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![
            AuditEventKind::Rejection,
            AuditEventKind::Transition,
            AuditEventKind::Cancelled
        ]
    );
    assert!(audit.events()[0].detail.contains("release"));
}

#[tokio::test]
async fn cancel_during_fan_out_aborts_every_slice() {
    let runner = Arc::new(ScriptedSliceRunner::new(4).with_delay(Duration::from_secs(3600)));
    let audit = Arc::new(InMemoryAuditSink::new());
    let worker = worker(Arc::clone(&runner), Arc::clone(&audit));
    let handle = worker.start_epoch().unwrap();

    drive_to_implementation(&handle).await;
    tokio::time::timeout(Duration::from_secs(5), async {
        while runner.runs() < 4 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    handle.cancel().await.unwrap();

    let outcome = worker.wait(handle.epoch_id()).await.unwrap();
    assert!(matches!(outcome, EpochOutcome::Cancelled(ref s) if s.phase == PhaseId::Implementation));
    assert_eq!(runner.finished(), 0);

    let last = audit.events().pop().unwrap();
    assert_eq!(last.kind, AuditEventKind::Cancelled);
    assert_eq!(last.detail, "0 slice(s) complete, 4 aborted");
}

#[tokio::test]
async fn flaky_slices_are_retried() {
    let runner = Arc::new(ScriptedSliceRunner::new(2).flaky("s1", 2));
    let worker = worker(Arc::clone(&runner), Arc::new(InMemoryAuditSink::new()));
    let handle = worker.start_epoch().unwrap();

    drive_to_implementation(&handle).await;
    complete(&handle, 1).await;
    handle.cancel().await.unwrap();

    let outcome = worker.wait(handle.epoch_id()).await.unwrap();
    assert_eq!(outcome.state().phase, PhaseId::CodeReview);
    assert_eq!(runner.runs(), 4);
    assert_eq!(runner.finished(), 2);
}

#[tokio::test]
async fn broken_slice_fails_the_epoch() {
    let runner = Arc::new(ScriptedSliceRunner::new(3).broken("s2"));
    let worker = worker(runner, Arc::new(InMemoryAuditSink::new()));
    let handle = worker.start_epoch().unwrap();

    drive_to_implementation(&handle).await;

    let err = worker.wait(handle.epoch_id()).await.unwrap_err();
    assert!(matches!(err, WorkflowError::SliceFailed { ref slice, .. } if slice == "s2"));
    assert!(err.requires_operator());
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn missing_evaluator_needs_an_operator() {
    let worker = Worker::new(WorkerOptions::default(), canonical_schema())
        .with_activities(EpochActivities::default().with_audit(Arc::new(InMemoryAuditSink::new())))
        .with_retry(RetryPolicy::immediate(3));
    let handle = worker.start_epoch().unwrap();

    complete(&handle, 1).await;

    let err = worker.wait(handle.epoch_id()).await.unwrap_err();
    assert!(
        matches!(err, WorkflowError::Misconfigured { ref activity, .. } if activity == "check_constraints")
    );
    assert!(err.requires_operator());
}

#[tokio::test]
async fn missing_slice_runner_needs_an_operator() {
    let worker = Worker::new(WorkerOptions::default(), canonical_schema())
        .with_retry(RetryPolicy::immediate(3));
    let handle = worker.start_epoch().unwrap();

    drive_to_implementation(&handle).await;

    let err = worker.wait(handle.epoch_id()).await.unwrap_err();
    assert!(
        matches!(err, WorkflowError::Misconfigured { ref activity, .. } if activity == "plan_slices")
    );
}

#[tokio::test]
async fn resumed_epoch_replays_without_side_effects() {
    let history: Arc<dyn HistoryStore> = Arc::new(InMemoryHistory::new());

    let first_runner = Arc::new(ScriptedSliceRunner::new(2));
    let first = worker(first_runner, Arc::new(InMemoryAuditSink::new()))
        .with_history(Arc::clone(&history));
    let handle = first.start_epoch().unwrap();
    let id = handle.epoch_id();
    drive_to_implementation(&handle).await;
    complete(&handle, 1).await;
    vote_all(&handle, ACCEPT).await;
    complete(&handle, 2).await;
    let original = first.wait(id).await.unwrap();

    let second_runner = Arc::new(ScriptedSliceRunner::new(2));
    let second_audit = Arc::new(InMemoryAuditSink::new());
    let second = worker(Arc::clone(&second_runner), Arc::clone(&second_audit))
        .with_history(Arc::clone(&history));
    let _resumed = second.start_epoch_with_id(id).unwrap();
    let replayed = second.wait(id).await.unwrap();

    assert!(replayed.is_completed());
    assert_eq!(phases(&replayed), phases(&original));
    assert_eq!(second_runner.plans(), 0);
    assert_eq!(second_runner.runs(), 0);
    assert!(second_audit.is_empty());
    assert!(second.activities().ledger().records(id).is_empty());
}

async fn journal_keys(history: &Arc<dyn HistoryStore>, id: &str) -> Vec<String> {
    history
        .events(id)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.key)
        .collect()
}

#[tokio::test]
async fn interrupted_fan_out_resumes_where_it_stopped() {
    let history: Arc<dyn HistoryStore> = Arc::new(InMemoryHistory::new());

    let first_runner = Arc::new(
        ScriptedSliceRunner::new(3)
            .slow("s1", Duration::from_secs(3600))
            .slow("s2", Duration::from_secs(3600)),
    );
    let first_audit = Arc::new(InMemoryAuditSink::new());
    let first = worker(Arc::clone(&first_runner), Arc::clone(&first_audit))
        .with_history(Arc::clone(&history));
    let handle = first.start_epoch().unwrap();
    let id = handle.epoch_id();
    let run_id = id.to_string();

    drive_to_implementation(&handle).await;
    tokio::time::timeout(Duration::from_secs(5), async {
        while !journal_keys(&history, &run_id)
            .await
            .iter()
            .any(|k| k.starts_with("child:"))
        {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    // Arrive mid fan-out: journaled, set aside, not yet applied.
    let signals = |keys: Vec<String>| keys.iter().filter(|k| k.ends_with(":signal")).count();
    let before = signals(journal_keys(&history, &run_id).await);
    handle.blockers(1).await.unwrap();
    handle.blockers(0).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while signals(journal_keys(&history, &run_id).await) < before + 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    assert!(first.evict(id));
    assert_eq!(first_runner.finished(), 1);

    let second_runner = Arc::new(ScriptedSliceRunner::new(3));
    let second_audit = Arc::new(InMemoryAuditSink::new());
    let second = worker(Arc::clone(&second_runner), Arc::clone(&second_audit))
        .with_history(Arc::clone(&history));
    let resumed = second.start_epoch_with_id(id).unwrap();
    complete(&resumed, 1).await;
    vote_all(&resumed, ACCEPT).await;
    complete(&resumed, 2).await;

    let outcome = second.wait(id).await.unwrap();
    assert!(outcome.is_completed());
    assert_eq!(phases(&outcome).len(), 12);
    assert_eq!(second_runner.plans(), 0);
    assert_eq!(second_runner.runs(), 2);

    let events = second_audit.events();
    let details = |kind| {
        events
            .iter()
            .filter(|e| e.kind == kind)
            .map(|e| e.detail.clone())
            .collect::<Vec<_>>()
    };
    assert_eq!(details(AuditEventKind::Blockers), vec!["blockers = 1", "blockers = 0"]);
    let slices: Vec<String> = details(AuditEventKind::SliceCompleted)
        .iter()
        .map(|d| d.split(':').next().unwrap_or_default().to_string())
        .collect();
    assert_eq!(slices, vec!["s0", "s1", "s2"]);
    assert_eq!(details(AuditEventKind::Transition).len(), 5);

    assert!(first_audit
        .events()
        .iter()
        .all(|e| e.kind != AuditEventKind::Blockers));
}
