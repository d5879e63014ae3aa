//! Dispatcher batching tests with an echoing in-process backend

use std::collections::HashMap;
use std::sync::Arc;

use rshogi_mcts::config::DispatchParams;
use rshogi_mcts::eval::backend::{BackendError, BackendShape, BatchOutput, FnBackend};
use rshogi_mcts::eval::{DispatchShared, Dispatcher, EvalRequest, EvalResponse, ResponseQueue};
use rshogi_mcts::queue::MtQueue;
use rshogi_mcts::tt::{NodeTable, SearchPath};

const SAMPLE: usize = 4;
const POLICY: usize = 8;

/// Backend that writes each sample's marker (feature 0) into its own outputs:
/// policy logit at index 0 = marker, value logits = (marker * 0.1, 0)
fn echo_backend() -> FnBackend<impl FnMut(&[f32], usize, &mut BatchOutput) -> Result<(), BackendError> + Send> {
    FnBackend::new(
        "echo",
        BackendShape::new(SAMPLE, POLICY),
        |input: &[f32], batch, out: &mut BatchOutput| {
            for i in 0..batch {
                let marker = input[i * SAMPLE];
                out.policy[i * POLICY] = marker;
                out.value[i * 2] = marker * 0.1;
            }
            Ok(())
        },
    )
}

fn params(batch_size: usize) -> DispatchParams {
    DispatchParams {
        batch_size,
        warm_up: false,
        ..DispatchParams::default()
    }
}

#[test]
fn test_batch_results_stay_with_their_requests() {
    for n in 1..=8usize {
        let mut table = NodeTable::<u16>::with_slots(64, 4);
        let requests = Arc::new(MtQueue::new());
        let responses: Arc<ResponseQueue<u16>> = Arc::new(MtQueue::new());
        let mut expected = HashMap::new();

        for i in 0..n {
            let (leaf, _) = table.find_or_create(100 + i as u64, 0).unwrap();
            let marker = i as f32 * 0.5 - 1.0;
            expected.insert(leaf, marker);
            let mut features = vec![0.0; SAMPLE];
            features[0] = marker;
            let request = EvalRequest {
                path: SearchPath::new(leaf),
                features,
                moves: vec![(10u16, 0), (11u16, 5)],
                mate_found: false,
                response: Arc::clone(&responses),
            };
            assert!(requests.push(request).is_ok());
        }

        // Everything is queued before the dispatcher starts, so it forms one batch
        let shared = Arc::new(DispatchShared::new(Arc::clone(&requests)));
        let handle = Dispatcher::new(0, Box::new(echo_backend()), Arc::clone(&shared), params(n))
            .spawn()
            .unwrap();
        let mut received = 0;
        while received < n {
            let Some(EvalResponse::Ready(result)) = responses.pop() else {
                panic!("batch {n}: expected a ready result");
            };
            let marker = expected[&result.path.leaf()];
            assert_eq!(result.moves.len(), 2);
            assert_eq!(result.moves[0].0, 10);
            let p0 = marker.exp() / (marker.exp() + 1.0);
            assert!(
                (result.moves[0].1 - p0).abs() < 1e-5,
                "batch {n}: policy of marker {marker} was {}",
                result.moves[0].1
            );
            assert!((result.moves[0].1 + result.moves[1].1 - 1.0).abs() < 1e-5);
            assert!((result.value - (marker * 0.1).tanh()).abs() < 1e-5, "batch {n}: value mismatch");
            received += 1;
        }

        requests.close();
        handle.join().unwrap();
        let stats = shared.stats();
        assert_eq!(stats.batches, 1, "batch size {n}");
        assert_eq!(stats.samples, n as u64);
    }
}

#[test]
fn test_mate_found_overrides_value() {
    let mut table = NodeTable::<u16>::with_slots(8, 4);
    let (leaf, _) = table.find_or_create(1, 0).unwrap();
    let requests = Arc::new(MtQueue::new());
    let responses: Arc<ResponseQueue<u16>> = Arc::new(MtQueue::new());
    let mut features = vec![0.0; SAMPLE];
    features[0] = -3.0;
    let request = EvalRequest {
        path: SearchPath::new(leaf),
        features,
        moves: vec![(1u16, 0)],
        mate_found: true,
        response: Arc::clone(&responses),
    };
    assert!(requests.push(request).is_ok());

    let shared = Arc::new(DispatchShared::new(Arc::clone(&requests)));
    let handle = Dispatcher::new(0, Box::new(echo_backend()), shared, params(4)).spawn().unwrap();
    match responses.pop() {
        Some(EvalResponse::Ready(result)) => {
            assert_eq!(result.value, 1.0);
            assert!(result.mate_found);
            assert_eq!(result.moves, vec![(1u16, 1.0)]);
        }
        other => panic!("expected a ready result, got {other:?}"),
    }
    requests.close();
    handle.join().unwrap();
}
