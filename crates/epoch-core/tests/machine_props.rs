use epoch_core::{EpochMachine, EpochState};
use epoch_schema::{canonical, PhaseId, ReviewAxis, VoteType};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Vote(usize, VoteType),
    Blockers(u32),
    Advance(PhaseId),
}

fn axis(idx: usize) -> ReviewAxis {
    [
        ReviewAxis::correctness(),
        ReviewAxis::test_quality(),
        ReviewAxis::elegance(),
    ][idx % 3]
        .clone()
}

fn vote_type() -> impl Strategy<Value = VoteType> {
    prop_oneof![
        3 => Just(VoteType::Accept),
        1 => Just(VoteType::Revise),
        1 => Just(VoteType::Reject),
    ]
}

fn phase_id() -> impl Strategy<Value = PhaseId> {
    (0usize..13).prop_map(|idx| PhaseId::ORDERED.get(idx).copied().unwrap_or(PhaseId::Complete))
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        2 => (0usize..3, vote_type()).prop_map(|(a, v)| Op::Vote(a, v)),
        1 => (0u32..3).prop_map(Op::Blockers),
        4 => phase_id().prop_map(Op::Advance),
    ]
}

fn machine() -> EpochMachine {
    EpochMachine::from_schema(canonical::schema().unwrap())
}

fn apply(machine: &mut EpochMachine, op: &Op) -> bool {
    match op {
        Op::Vote(a, v) => machine.record_vote(axis(*a), *v).is_ok(),
        Op::Blockers(n) => machine.set_blockers(*n).is_ok(),
        Op::Advance(target) => machine.advance(*target, "prop", "generated").is_ok(),
    }
}

fn assert_history_ordered(state: &EpochState) {
    for (idx, record) in state.history.iter().enumerate() {
        assert_eq!(record.seq, idx as u64 + 1);
        if idx > 0 {
            assert_eq!(record.from, state.history[idx - 1].to);
        }
    }
    if let Some(last) = state.history.last() {
        assert_eq!(last.to, state.phase);
    }
}

proptest! {
    #[test]
    fn prop_phase_is_always_valid(ops in prop::collection::vec(op(), 0..80)) {
        let schema = canonical::schema().unwrap();
        let mut m = machine();

        for op in &ops {
            apply(&mut m, op);
            let phase = m.phase();
            prop_assert!(phase == PhaseId::Complete || schema.phase(phase).is_some());
        }
        if m.is_complete() {
            prop_assert!(m.legal_targets().is_empty());
        }
    }

    #[test]
    fn prop_history_is_strictly_ordered(ops in prop::collection::vec(op(), 0..80)) {
        let mut m = machine();
        for op in &ops {
            apply(&mut m, op);
        }
        assert_history_ordered(m.state());
    }

    #[test]
    fn prop_refused_operations_leave_state_unchanged(
        ops in prop::collection::vec(op(), 0..60),
        extra in op(),
    ) {
        let mut m = machine();
        for op in &ops {
            apply(&mut m, op);
        }

        let before = m.state().clone();
        if !apply(&mut m, &extra) {
            prop_assert_eq!(m.state(), &before);
        }
    }

    #[test]
    fn prop_vote_on_one_axis_leaves_others(
        first in vote_type(),
        second in vote_type(),
        a in 0usize..3,
        offset in 1usize..3,
    ) {
        let mut m = machine();
        m.advance(PhaseId::Requirements, "prop", "x").unwrap();
        m.advance(PhaseId::PlanDraft, "prop", "x").unwrap();
        m.advance(PhaseId::PlanReview, "prop", "x").unwrap();

        let other = (a + offset) % 3;
        m.record_vote(axis(other), first).unwrap();
        m.record_vote(axis(a), second).unwrap();

        prop_assert_eq!(m.state().vote(&axis(other)), Some(first));
        prop_assert_eq!(m.state().vote(&axis(a)), Some(second));
    }
}

#[test]
fn revision_re_entry_clears_votes() {
    let mut m = machine();
    for target in [PhaseId::Requirements, PhaseId::PlanDraft, PhaseId::PlanReview] {
        m.advance(target, "test", "walked").unwrap();
    }
    m.record_vote(ReviewAxis::correctness(), VoteType::Accept).unwrap();
    m.record_vote(ReviewAxis::elegance(), VoteType::Reject).unwrap();

    m.advance(PhaseId::PlanDraft, "reviewer", "rejected").unwrap();
    m.advance(PhaseId::PlanReview, "architect", "redrafted").unwrap();

    assert_eq!(m.phase(), PhaseId::PlanReview);
    assert!(m.state().votes.is_empty());
    assert_eq!(m.state().revisions, 1);
}
