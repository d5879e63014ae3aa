//! Tree statistics tests driven by hand through the request queue
//!
//! No dispatcher runs here: each test pops requests and answers them itself.

mod common;

use std::sync::{Arc, Barrier};
use std::thread;

use common::*;
use rshogi_mcts::MctsError;
use rshogi_mcts::SearchPosition;
use rshogi_mcts::eval::{EvalResponse, ResponseQueue};
use rshogi_mcts::position::RepetitionState;
use rshogi_mcts::queue::MtQueue;
use rshogi_mcts::search::{Mcts, SimulationOutcome};
use rshogi_mcts::tt::NodeRef;

const EPS: f32 = 1e-5;

/// Create and evaluate the root, answering its request with value 0
fn evaluated_root(
    mcts: &Mcts<ScriptPos>,
    pos: &ScriptPos,
    requests: &rshogi_mcts::eval::RequestQueue<u16>,
    responses: &Arc<ResponseQueue<u16>>,
) -> NodeRef {
    let status = mcts.create_root(pos, responses).unwrap();
    assert!(status.submitted, "fresh root must be submitted");
    answer(requests.try_pop().unwrap(), 0.0);
    mcts.apply_response(responses.try_pop().unwrap()).unwrap();
    status.node
}

fn drain_one(requests: &rshogi_mcts::eval::RequestQueue<u16>, responses: &ResponseQueue<u16>, mcts: &Mcts<ScriptPos>, value: f32) {
    answer(requests.try_pop().expect("a pending request"), value);
    mcts.apply_response(responses.try_pop().expect("a response")).unwrap();
}

fn root_edge(mcts: &Mcts<ScriptPos>, root: NodeRef, edge: usize) -> (i32, f32) {
    mcts.with_tree(|t| {
        let node = t.node(root).unwrap();
        (node.children[edge].visits, node.children[edge].value_sum)
    })
}

#[test]
fn test_duplicate_leaf_is_evaluated_once() {
    let mut b = ScriptBuilder::new();
    let leaf = b.child(0, 0);
    b.fill(leaf, 2, 1);
    let mut pos = b.build();

    let (mcts, requests) = manual_mcts(64, params(1));
    let responses = Arc::new(MtQueue::new());
    let root = evaluated_root(&mcts, &pos, &requests, &responses);

    let outcomes: Vec<_> = (0..4)
        .map(|_| mcts.run_simulation(root, &mut pos, &responses).unwrap())
        .collect();
    assert_eq!(outcomes[0], SimulationOutcome::Submitted);
    assert!(outcomes[1..].iter().all(|&o| o == SimulationOutcome::Duplicate));
    assert_eq!(requests.len(), 1, "only one request for the shared leaf");
    assert_eq!(pos.id(), 0, "simulation must restore the root position");

    // 4 paths are holding virtual loss on the single root edge
    assert_eq!(root_edge(&mcts, root, 0), (4, -4.0));

    drain_one(&requests, &responses, &mcts, 0.5);
    let (visits, value_sum) = root_edge(&mcts, root, 0);
    assert_eq!(visits, 4, "one backup per waiting path");
    assert!((value_sum - 4.0 * -0.99 * 0.5).abs() < EPS, "value_sum {value_sum}");
    mcts.with_tree(|t| {
        assert_visits_conserved(t);
        let leaf_ref = t.find(0x1000 + leaf as u64, 1).unwrap();
        assert_eq!(t.node(leaf_ref).unwrap().dup_chain_len(), 0);
    });
}

#[test]
fn test_concurrent_visitors_share_one_request() {
    const THREADS: usize = 8;
    let mut b = ScriptBuilder::new();
    let leaf = b.child(0, 0);
    b.fill(leaf, 2, 1);
    let pos = b.build();

    let (mcts, requests) = manual_mcts(64, params(1));
    let responses = Arc::new(MtQueue::new());
    let root = evaluated_root(&mcts, &pos, &requests, &responses);

    let barrier = Barrier::new(THREADS);
    let outcomes: Vec<SimulationOutcome> = thread::scope(|s| {
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let mut pos = pos.clone();
                let (mcts, barrier, responses) = (&mcts, &barrier, &responses);
                s.spawn(move || {
                    barrier.wait();
                    mcts.run_simulation(root, &mut pos, responses).unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let submitted = outcomes.iter().filter(|&&o| o == SimulationOutcome::Submitted).count();
    let duplicates = outcomes.iter().filter(|&&o| o == SimulationOutcome::Duplicate).count();
    assert_eq!((submitted, duplicates), (1, THREADS - 1), "outcomes {outcomes:?}");
    assert_eq!(requests.len(), 1, "the shared leaf must be requested exactly once");
    assert_eq!(root_edge(&mcts, root, 0).0, THREADS as i32);

    drain_one(&requests, &responses, &mcts, 0.5);
    assert!(requests.is_empty());
    let (visits, value_sum) = root_edge(&mcts, root, 0);
    assert_eq!(visits, THREADS as i32, "one backup per visiting thread");
    assert!((value_sum - THREADS as f32 * -0.99 * 0.5).abs() < 1e-4, "value_sum {value_sum}");
    mcts.with_tree(|t| {
        assert_visits_conserved(t);
        assert_no_waiting_paths(t);
    });
}

#[test]
fn test_backup_is_damped_per_ply() {
    // X -0-> c1 -0-> leaf -0-> (below)
    let mut b = ScriptBuilder::new();
    let c1 = b.child(0, 0);
    let leaf = b.child(c1, 0);
    b.child(leaf, 0);
    let mut pos = b.build();

    let (mcts, requests) = manual_mcts(64, params(1));
    let responses = Arc::new(MtQueue::new());
    let root = evaluated_root(&mcts, &pos, &requests, &responses);

    assert_eq!(mcts.run_simulation(root, &mut pos, &responses).unwrap(), SimulationOutcome::Submitted);
    drain_one(&requests, &responses, &mcts, 0.3);
    let (_, after_c1) = root_edge(&mcts, root, 0);
    assert!((after_c1 - (-0.99 * 0.3)).abs() < EPS);

    assert_eq!(mcts.run_simulation(root, &mut pos, &responses).unwrap(), SimulationOutcome::Submitted);
    drain_one(&requests, &responses, &mcts, 0.5);
    let (visits, value_sum) = root_edge(&mcts, root, 0);
    assert_eq!(visits, 2);
    assert!(
        (value_sum - after_c1 - 0.99 * 0.99 * 0.5).abs() < EPS,
        "root edge should gain 0.99^2 of the leaf value, got {}",
        value_sum - after_c1
    );
    mcts.with_tree(|t| {
        let c1_ref = t.find(0x1000 + c1 as u64, 1).unwrap();
        let edge = &t.node(c1_ref).unwrap().children[0];
        assert_eq!(edge.visits, 1);
        assert!((edge.value_sum - (-0.99 * 0.5)).abs() < EPS);
        assert_visits_conserved(t);
    });
}

#[test]
fn test_no_legal_moves_resolves_without_inference() {
    let mut b = ScriptBuilder::new();
    b.child(0, 0); // no moves: mated
    let mut pos = b.build();

    let (mcts, requests) = manual_mcts(64, params(1));
    let responses = Arc::new(MtQueue::new());
    let root = evaluated_root(&mcts, &pos, &requests, &responses);

    for round in 1..=2 {
        assert_eq!(mcts.run_simulation(root, &mut pos, &responses).unwrap(), SimulationOutcome::Terminal);
        assert!(requests.is_empty(), "terminal leaves never reach the request queue");
        let (visits, value_sum) = root_edge(&mcts, root, 0);
        assert_eq!(visits, round);
        assert!((value_sum - 0.99 * round as f32).abs() < EPS, "mate for the mover backs up as a win");
    }
    assert_eq!(mcts.best_move(root).unwrap(), Some(0));
}

#[test]
fn test_repetition_is_scored_from_the_path() {
    let mut b = ScriptBuilder::new();
    let rep = b.child(0, 0);
    b.child(rep, 0);
    b.repetition(rep, RepetitionState::Win);
    let mut pos = b.build();

    let (mcts, requests) = manual_mcts(64, params(1));
    let responses = Arc::new(MtQueue::new());
    let root = evaluated_root(&mcts, &pos, &requests, &responses);

    // First visit creates and evaluates the node as usual
    assert_eq!(mcts.run_simulation(root, &mut pos, &responses).unwrap(), SimulationOutcome::Submitted);
    drain_one(&requests, &responses, &mcts, 0.0);

    assert_eq!(mcts.run_simulation(root, &mut pos, &responses).unwrap(), SimulationOutcome::Terminal);
    let (visits, value_sum) = root_edge(&mcts, root, 0);
    assert_eq!(visits, 2);
    assert!((value_sum - (-0.99)).abs() < EPS, "a won repetition for the mover is bad for the parent");
    mcts.with_tree(|t| {
        let r = t.find(0x1000 + rep as u64, 1).unwrap();
        assert!(!t.node(r).unwrap().terminal, "repetition must not be stored in the node");
    });
}

#[test]
fn test_cycle_hits_path_length_cap() {
    // root -> A -> B -> A -> ...
    let mut b = ScriptBuilder::new();
    let a = b.child(0, 0);
    let bb = b.child(a, 0);
    b.link(bb, 0, a);
    let mut pos = b.build();

    let (mcts, requests) = manual_mcts(64, params(1));
    let responses = Arc::new(MtQueue::new());
    let root = evaluated_root(&mcts, &pos, &requests, &responses);

    for _ in 0..2 {
        assert_eq!(mcts.run_simulation(root, &mut pos, &responses).unwrap(), SimulationOutcome::Submitted);
        drain_one(&requests, &responses, &mcts, 0.0);
    }
    assert_eq!(mcts.run_simulation(root, &mut pos, &responses).unwrap(), SimulationOutcome::Terminal);
    assert_eq!(pos.id(), 0);
    assert_eq!(root_edge(&mcts, root, 0), (3, 0.0));
    mcts.with_tree(|t| {
        assert_visits_conserved(t);
        let a_ref = t.find(0x1000 + a as u64, 1).unwrap();
        // The 64-node path leaves A through its edge 31 times
        assert_eq!(t.node(a_ref).unwrap().children[0].visits, 1 + 31);
    });
}

#[test]
fn test_failed_response_retires_virtual_loss() {
    let mut b = ScriptBuilder::new();
    let leaf = b.child(0, 0);
    b.child(leaf, 0);
    let mut pos = b.build();

    let (mcts, requests) = manual_mcts(64, params(3));
    let responses = Arc::new(MtQueue::new());
    let root = evaluated_root(&mcts, &pos, &requests, &responses);

    assert_eq!(mcts.run_simulation(root, &mut pos, &responses).unwrap(), SimulationOutcome::Submitted);
    assert_eq!(mcts.run_simulation(root, &mut pos, &responses).unwrap(), SimulationOutcome::Duplicate);
    assert_eq!(root_edge(&mcts, root, 0), (6, -6.0));

    let request = requests.try_pop().unwrap();
    let failed = EvalResponse::Failed {
        path: request.path,
        reason: "device lost".to_string(),
    };
    match mcts.apply_response(failed) {
        Err(MctsError::BackendUnavailable(reason)) => assert_eq!(reason, "device lost"),
        other => panic!("expected BackendUnavailable, got {other:?}"),
    }
    assert_eq!(root_edge(&mcts, root, 0), (0, 0.0), "both paths must be restored");
    mcts.with_tree(|t| assert_eq!(t.node(root).unwrap().visit_sum, 0));
}

#[test]
fn test_abandoned_leaf_is_submitted_again() {
    let mut b = ScriptBuilder::new();
    let leaf = b.child(0, 0);
    b.child(leaf, 0);
    let mut pos = b.build();

    let (mcts, requests) = manual_mcts(64, params(3));
    let responses = Arc::new(MtQueue::new());
    let root = evaluated_root(&mcts, &pos, &requests, &responses);

    assert_eq!(mcts.run_simulation(root, &mut pos, &responses).unwrap(), SimulationOutcome::Submitted);
    let request = requests.try_pop().unwrap();
    let failed = EvalResponse::Failed {
        path: request.path,
        reason: "device lost".to_string(),
    };
    assert!(mcts.apply_response(failed).is_err());

    // The next visitor requests the leaf again instead of parking on it
    assert_eq!(mcts.run_simulation(root, &mut pos, &responses).unwrap(), SimulationOutcome::Submitted);
    assert_eq!(requests.len(), 1);
    assert_eq!(mcts.run_simulation(root, &mut pos, &responses).unwrap(), SimulationOutcome::Duplicate);
    assert_eq!(root_edge(&mcts, root, 0), (6, -6.0));

    drain_one(&requests, &responses, &mcts, 0.5);
    let (visits, value_sum) = root_edge(&mcts, root, 0);
    assert_eq!(visits, 2);
    assert!((value_sum - 2.0 * -0.99 * 0.5).abs() < EPS, "value_sum {value_sum}");
    mcts.with_tree(|t| {
        assert_visits_conserved(t);
        assert_no_waiting_paths(t);
    });
}

#[test]
fn test_table_exhaustion_aborts_only_the_simulation() {
    let mut b = ScriptBuilder::new();
    b.fill(0, 4, 2);
    let mut pos = b.build();

    // Two slots: the root and one pending leaf leave nothing to evict
    let (mcts, requests) = manual_mcts(2, params(1));
    let responses = Arc::new(MtQueue::new());
    let root = evaluated_root(&mcts, &pos, &requests, &responses);

    assert_eq!(mcts.run_simulation(root, &mut pos, &responses).unwrap(), SimulationOutcome::Submitted);
    let err = mcts.run_simulation(root, &mut pos, &responses).unwrap_err();
    assert!(matches!(err, MctsError::TableExhausted), "got {err:?}");
    assert!(err.is_recoverable());
    assert_eq!(pos.id(), 0);
    mcts.with_tree(|t| {
        let node = t.node(root).unwrap();
        assert_eq!(node.visit_sum, 1, "only the pending leaf keeps its virtual loss");
        assert_eq!(node.children[1].visits, 0);
    });

    // Once the leaf is evaluated the tree keeps working
    drain_one(&requests, &responses, &mcts, 0.0);
    mcts.with_tree(assert_visits_conserved);
}

#[test]
fn test_begin_search_allows_reuse_of_older_plies() {
    let mut b = ScriptBuilder::new();
    let c = b.child(0, 0);
    let d = b.child(c, 0);
    b.fill(d, 2, 2);
    let mut pos = b.build();

    let (mcts, requests) = manual_mcts(2, params(1));
    let responses = Arc::new(MtQueue::new());
    evaluated_root(&mcts, &pos, &requests, &responses);

    // Advance two plies: root (ply 0) and c (ply 1) become reusable
    pos.do_move(0);
    pos.do_move(0);
    mcts.begin_search(pos.game_ply());
    let status = mcts.create_root(&pos, &responses).unwrap();
    assert!(status.submitted);
    drain_one(&requests, &responses, &mcts, 0.0);
    assert_eq!(mcts.run_simulation(status.node, &mut pos, &responses).unwrap(), SimulationOutcome::Submitted);
    drain_one(&requests, &responses, &mcts, 0.0);
    mcts.with_tree(|t| {
        assert_eq!(t.used(), 2);
        assert!(t.find(0x1000, 0).is_none(), "old root must have been recycled");
    });
}
