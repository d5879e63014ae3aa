//! バッチ推論ディスパッチャ
//!
//! バックエンド1つにつきスレッド1つ。要求キューから最大 batch_size 件を取り出し、
//! 特徴量を連続バッファに詰めて1回だけ推論し、結果を各要求の応答キューへ返す。

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use log::{error, info, trace, warn};
use parking_lot::Mutex;

use super::backend::{BackendError, BatchOutput, InferenceBackend};
use super::postprocess::{softmax_legal, value_from_logits};
use super::request::{EvalRequest, EvalResponse, EvalResult, RequestQueue};
use crate::config::DispatchParams;
use crate::error::{MctsError, MctsResult};

/// スループット計測用カウンタ
#[derive(Debug, Default)]
pub struct DispatchStats {
    batches: AtomicU64,
    samples: AtomicU64,
}

/// カウンタの読み出し結果
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub batches: u64,
    pub samples: u64,
}

impl StatsSnapshot {
    /// 平均バッチ充填数
    pub fn average_batch(&self) -> f64 {
        if self.batches == 0 {
            0.0
        } else {
            self.samples as f64 / self.batches as f64
        }
    }
}

/// ディスパッチャ間で共有する状態
pub struct DispatchShared<M> {
    requests: Arc<RequestQueue<M>>,
    stats: DispatchStats,
    /// 稼働中のディスパッチャ数
    alive: AtomicUsize,
    /// 最初に起きた致命的エラー
    fatal: Mutex<Option<String>>,
}

impl<M> DispatchShared<M> {
    pub fn new(requests: Arc<RequestQueue<M>>) -> Self {
        Self {
            requests,
            stats: DispatchStats::default(),
            alive: AtomicUsize::new(0),
            fatal: Mutex::new(None),
        }
    }

    pub fn requests(&self) -> &Arc<RequestQueue<M>> {
        &self.requests
    }

    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            batches: self.stats.batches.load(Ordering::Relaxed),
            samples: self.stats.samples.load(Ordering::Relaxed),
        }
    }

    pub fn alive(&self) -> usize {
        self.alive.load(Ordering::Acquire)
    }

    pub fn fatal(&self) -> Option<String> {
        self.fatal.lock().clone()
    }
}

/// ディスパッチャ1つ分
pub struct Dispatcher<M> {
    id: usize,
    backend: Box<dyn InferenceBackend>,
    shared: Arc<DispatchShared<M>>,
    params: DispatchParams,
    batch: Vec<EvalRequest<M>>,
    input: Vec<f32>,
    output: BatchOutput,
    indices: Vec<u32>,
    probs: Vec<f32>,
}

impl<M: Copy + Send + 'static> Dispatcher<M> {
    pub fn new(
        id: usize,
        backend: Box<dyn InferenceBackend>,
        shared: Arc<DispatchShared<M>>,
        params: DispatchParams,
    ) -> Self {
        let sample_size = backend.shape().sample_size;
        Self {
            id,
            input: Vec::with_capacity(params.batch_size * sample_size),
            batch: Vec::with_capacity(params.batch_size),
            backend,
            shared,
            params,
            output: BatchOutput::default(),
            indices: Vec::new(),
            probs: Vec::new(),
        }
    }

    /// ゼロ入力で1回推論して初回呼び出しのコストを吸収する
    pub fn warm_up(&mut self) -> Result<(), BackendError> {
        let start = Instant::now();
        let batch = self.params.batch_size;
        self.input.clear();
        self.input.resize(batch * self.backend.shape().sample_size, 0.0);
        self.backend.infer(&self.input, batch, &mut self.output)?;
        info!(
            "[Dispatcher {}] warm-up done in {} ms (batch {batch})",
            self.id,
            start.elapsed().as_millis()
        );
        Ok(())
    }

    /// 取り出し済みのバッチ（`self.batch`）を処理する
    fn process_batch(&mut self) -> Result<(), BackendError> {
        let shape = self.backend.shape();
        let n = self.batch.len();

        self.input.clear();
        for req in &self.batch {
            if req.features.len() != shape.sample_size {
                return Err(BackendError::Protocol(format!(
                    "request carries {} features, backend expects {}",
                    req.features.len(),
                    shape.sample_size
                )));
            }
            self.input.extend_from_slice(&req.features);
        }

        self.backend.infer(&self.input, n, &mut self.output)?;
        if self.output.policy.len() != n * shape.policy_size || self.output.value.len() != n * shape.value_size {
            return Err(BackendError::Protocol(format!(
                "backend returned {}/{} outputs for batch {n}",
                self.output.policy.len(),
                self.output.value.len()
            )));
        }

        for (i, req) in self.batch.drain(..).enumerate() {
            let policy = &self.output.policy[i * shape.policy_size..(i + 1) * shape.policy_size];
            let value = &self.output.value[i * shape.value_size..(i + 1) * shape.value_size];

            self.indices.clear();
            self.indices.extend(req.moves.iter().map(|&(_, idx)| idx));
            softmax_legal(policy, &self.indices, self.params.policy_temperature, &mut self.probs);

            let value = if req.mate_found {
                1.0
            } else {
                let v0 = value.first().copied().unwrap_or(0.0);
                let v1 = value.get(1).copied().unwrap_or(0.0);
                value_from_logits(v0, v1, self.params.value_temperature, self.params.value_scale)
            };
            let moves = req.moves.iter().zip(&self.probs).map(|(&(mv, _), &p)| (mv, p)).collect();
            let result = EvalResult {
                path: req.path,
                moves,
                value,
                mate_found: req.mate_found,
            };
            if req.response.push(EvalResponse::Ready(result)).is_err() {
                warn!("[Dispatcher {}] response queue closed; result dropped", self.id);
            }
        }

        self.shared.stats.batches.fetch_add(1, Ordering::Relaxed);
        self.shared.stats.samples.fetch_add(n as u64, Ordering::Relaxed);
        trace!("[Dispatcher {}] batch of {n}", self.id);
        Ok(())
    }

    /// 要求キューが閉じられるまで処理を続ける
    pub fn run(mut self) -> MctsResult<()> {
        info!("[Dispatcher {}] started (backend {})", self.id, self.backend.name());
        if self.params.warm_up {
            if let Err(e) = self.warm_up() {
                let reason = format!("{} warm-up: {e}", self.backend.name());
                self.fail(reason.clone());
                return Err(MctsError::BackendUnavailable(reason));
            }
        }

        let max = self.params.batch_size;
        loop {
            self.batch.clear();
            if self.shared.requests.pop_batch(max, &mut self.batch) == 0 {
                break;
            }
            if let Err(e) = self.process_batch() {
                let reason = format!("{}: {e}", self.backend.name());
                self.fail(reason.clone());
                return Err(MctsError::BackendUnavailable(reason));
            }
        }

        self.shared.alive.fetch_sub(1, Ordering::AcqRel);
        let stats = self.shared.stats();
        info!(
            "[Dispatcher {}] stopped (total batches {} samples {})",
            self.id, stats.batches, stats.samples
        );
        Ok(())
    }

    /// 致命的エラー: 処理中のバッチを失敗として返し、最後の1つなら残りの要求もすべて返す
    fn fail(&mut self, reason: String) {
        error!("[Dispatcher {}] backend failure: {reason}", self.id);
        self.shared.fatal.lock().get_or_insert_with(|| reason.clone());

        for req in self.batch.drain(..) {
            respond_failed(req, &reason);
        }

        if self.shared.alive.fetch_sub(1, Ordering::AcqRel) == 1 {
            // 他に処理できるディスパッチャがいない
            self.shared.requests.close();
            let mut rest = Vec::new();
            self.shared.requests.try_pop_batch(usize::MAX, &mut rest);
            if !rest.is_empty() {
                warn!("[Dispatcher {}] failing {} queued requests", self.id, rest.len());
            }
            for req in rest {
                respond_failed(req, &reason);
            }
        }
    }

    /// スレッドを起動する
    pub fn spawn(self) -> std::io::Result<DispatcherHandle> {
        let id = self.id;
        let shared = Arc::clone(&self.shared);
        shared.alive.fetch_add(1, Ordering::AcqRel);
        let spawned = thread::Builder::new()
            .name(format!("dispatcher-{id}"))
            .spawn(move || self.run());
        match spawned {
            Ok(join) => Ok(DispatcherHandle { id, join: Some(join) }),
            Err(e) => {
                shared.alive.fetch_sub(1, Ordering::AcqRel);
                Err(e)
            }
        }
    }
}

fn respond_failed<M>(req: EvalRequest<M>, reason: &str) {
    let response = EvalResponse::Failed {
        path: req.path,
        reason: reason.to_string(),
    };
    if req.response.push(response).is_err() {
        warn!("[Dispatcher] response queue closed; failure notice dropped");
    }
}

/// 起動済みディスパッチャ
pub struct DispatcherHandle {
    id: usize,
    join: Option<JoinHandle<MctsResult<()>>>,
}

impl DispatcherHandle {
    pub fn id(&self) -> usize {
        self.id
    }

    /// 終了を待つ。要求キューは呼び出し側で閉じておくこと
    pub fn join(mut self) -> MctsResult<()> {
        self.join_inner()
    }

    fn join_inner(&mut self) -> MctsResult<()> {
        match self.join.take() {
            Some(handle) => handle
                .join()
                .unwrap_or_else(|_| Err(MctsError::BackendUnavailable(format!("dispatcher {} panicked", self.id)))),
            None => Ok(()),
        }
    }
}

impl Drop for DispatcherHandle {
    fn drop(&mut self) {
        if let Err(e) = self.join_inner() {
            warn!("[Dispatcher {}] exited with error: {e}", self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::backend::{BackendShape, FnBackend};
    use crate::eval::request::ResponseQueue;
    use crate::queue::MtQueue;
    use crate::tt::{NodeRef, SearchPath};

    fn path(tag: u32) -> SearchPath {
        SearchPath::new(NodeRef {
            index: tag,
            generation: 0,
        })
    }

    fn request(tag: u32, features: Vec<f32>, moves: Vec<(u32, u32)>, response: &Arc<ResponseQueue<u32>>) -> EvalRequest<u32> {
        EvalRequest {
            path: path(tag),
            features,
            moves,
            mate_found: false,
            response: Arc::clone(response),
        }
    }

    fn params(batch_size: usize) -> DispatchParams {
        DispatchParams {
            batch_size,
            warm_up: false,
            ..DispatchParams::default()
        }
    }

    #[test]
    fn test_process_batch_scatters_results() {
        let shape = BackendShape::new(2, 3);
        let backend = FnBackend::new("fixed", shape, |_input: &[f32], batch, out: &mut BatchOutput| {
            for i in 0..batch {
                out.policy[i * 3..(i + 1) * 3].copy_from_slice(&[2.0, 1.0, 0.0]);
                out.value[i * 2] = 0.5;
            }
            Ok(())
        });
        let requests = Arc::new(MtQueue::new());
        let shared = Arc::new(DispatchShared::new(Arc::clone(&requests)));
        let mut dispatcher = Dispatcher::new(0, Box::new(backend), Arc::clone(&shared), params(4));

        let responses: Arc<ResponseQueue<u32>> = Arc::new(MtQueue::new());
        dispatcher.batch.push(request(1, vec![0.0; 2], vec![(100, 0), (101, 1), (102, 2)], &responses));
        let mut mate = request(2, vec![0.0; 2], vec![(200, 2)], &responses);
        mate.mate_found = true;
        dispatcher.batch.push(mate);
        dispatcher.process_batch().unwrap();

        let EvalResponse::Ready(first) = responses.try_pop().unwrap() else {
            panic!("expected a result");
        };
        assert_eq!(first.path, path(1));
        let probs: Vec<f32> = first.moves.iter().map(|m| m.1).collect();
        assert!((probs[0] - 0.665).abs() < 1e-3);
        assert!((probs[1] - 0.245).abs() < 1e-3);
        assert!((probs[2] - 0.090).abs() < 1e-3);
        assert!((first.value - 0.5f32.tanh()).abs() < 1e-6);

        let EvalResponse::Ready(second) = responses.try_pop().unwrap() else {
            panic!("expected a result");
        };
        // 詰みが見つかっていれば value は最大値
        assert_eq!(second.value, 1.0);
        assert_eq!(second.moves, vec![(200, 1.0)]);

        assert_eq!(shared.stats(), StatsSnapshot { batches: 1, samples: 2 });
    }

    #[test]
    fn test_backend_failure_answers_every_request() {
        let shape = BackendShape::new(1, 1);
        let backend = FnBackend::new("broken", shape, |_: &[f32], _, _: &mut BatchOutput| {
            Err(BackendError::Runtime("device lost".into()))
        });
        let requests = Arc::new(MtQueue::new());
        let shared = Arc::new(DispatchShared::new(Arc::clone(&requests)));
        let responses: Arc<ResponseQueue<u32>> = Arc::new(MtQueue::new());
        for tag in 0..5 {
            requests.push(request(tag, vec![0.0], vec![(0, 0)], &responses)).ok().unwrap();
        }
        let handle = Dispatcher::new(0, Box::new(backend), Arc::clone(&shared), params(2))
            .spawn()
            .unwrap();
        assert!(matches!(handle.join(), Err(MctsError::BackendUnavailable(_))));

        // 失敗したバッチの2件 + キューに残っていた3件
        let mut failed = 0;
        while let Some(resp) = responses.try_pop() {
            assert!(matches!(resp, EvalResponse::Failed { .. }));
            failed += 1;
        }
        assert_eq!(failed, 5);
        assert!(requests.is_closed());
        assert!(shared.fatal().unwrap().contains("device lost"));
        assert_eq!(shared.alive(), 0);
    }

    #[test]
    fn test_warm_up_uses_full_batch() {
        let shape = BackendShape::new(3, 1);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let backend = {
            let seen = Arc::clone(&seen);
            FnBackend::new("probe", shape, move |input: &[f32], batch, _: &mut BatchOutput| {
                seen.lock().push((batch, input.len(), input.iter().all(|&x| x == 0.0)));
                Ok(())
            })
        };
        let requests: Arc<RequestQueue<u32>> = Arc::new(MtQueue::new());
        let shared = Arc::new(DispatchShared::new(Arc::clone(&requests)));
        let dispatcher = Dispatcher::new(
            0,
            Box::new(backend),
            Arc::clone(&shared),
            DispatchParams {
                batch_size: 8,
                warm_up: true,
                ..DispatchParams::default()
            },
        );
        let handle = dispatcher.spawn().unwrap();
        requests.close();
        handle.join().unwrap();
        assert_eq!(*seen.lock(), vec![(8, 24, true)]);
        // ウォームアップはスループットに数えない
        assert_eq!(shared.stats(), StatsSnapshot::default());
    }
}
