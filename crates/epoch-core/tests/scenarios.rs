use epoch_core::{EpochMachine, IllegalTransition};
use epoch_schema::{canonical, PhaseId, ReviewAxis, VoteType};
use pretty_assertions::assert_eq;
use std::sync::Arc;

fn through_plan_review() -> EpochMachine {
    let mut m = EpochMachine::from_schema(canonical::schema().unwrap());
    m.advance(PhaseId::Requirements, "coordinator", "request captured").unwrap();
    m.advance(PhaseId::PlanDraft, "coordinator", "requirements agreed").unwrap();
    m.advance(PhaseId::PlanReview, "architect", "plan drafted").unwrap();
    m
}

#[test]
fn unanimous_accept_reaches_plan_approval() {
    let mut m = through_plan_review();
    for axis in [
        ReviewAxis::correctness(),
        ReviewAxis::test_quality(),
        ReviewAxis::elegance(),
    ] {
        m.record_vote(axis, VoteType::Accept).unwrap();
    }

    m.advance(PhaseId::PlanApproval, "reviewer", "every review axis accepts the plan")
        .unwrap();
    assert_eq!(m.phase(), PhaseId::PlanApproval);

    let trail: Vec<(PhaseId, PhaseId)> =
        m.state().history.iter().map(|r| (r.from, r.to)).collect();
    assert_eq!(
        trail,
        vec![
            (PhaseId::Intake, PhaseId::Requirements),
            (PhaseId::Requirements, PhaseId::PlanDraft),
            (PhaseId::PlanDraft, PhaseId::PlanReview),
            (PhaseId::PlanReview, PhaseId::PlanApproval),
        ]
    );
}

#[test]
fn split_vote_is_a_consensus_rejection() {
    let mut m = through_plan_review();
    m.record_vote(ReviewAxis::correctness(), VoteType::Accept).unwrap();
    m.record_vote(ReviewAxis::test_quality(), VoteType::Accept).unwrap();
    m.record_vote(ReviewAxis::elegance(), VoteType::Revise).unwrap();

    let err = m
        .advance(PhaseId::PlanApproval, "reviewer", "every review axis accepts the plan")
        .unwrap_err();
    assert!(matches!(err, IllegalTransition::VotesNotAccepted { .. }));
    assert_eq!(m.phase(), PhaseId::PlanReview);
    assert_eq!(m.state().history.len(), 3);
}

#[test]
fn snapshot_resumes_where_it_left_off() {
    let m = through_plan_review();
    let schema = Arc::clone(m.schema());
    let evaluator = Arc::clone(m.evaluator());

    let json = serde_json::to_string(m.state()).unwrap();
    let state = serde_json::from_str(&json).unwrap();
    let mut resumed = EpochMachine::restore(schema, evaluator, state).unwrap();

    assert_eq!(resumed.phase(), PhaseId::PlanReview);
    resumed.advance(PhaseId::PlanDraft, "reviewer", "plan consensus not reached").unwrap();
    assert_eq!(resumed.state().next_seq(), 5);
}
