//! 探索エンジン
//!
//! 要求キュー・ディスパッチャ群・置換表をまとめて所有する文脈オブジェクト。
//! 探索スレッドは `search` の間だけ scoped thread として起動する。

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::thread;
use std::time::{Duration, Instant};

use log::{info, warn};
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;

use super::admission::PendingPolicy;
use super::mcts::{Mcts, PrincipalVariation};
use super::worker::{SearchControl, SearchWorker, WorkerStats};
use crate::config::EngineConfig;
use crate::error::{MctsError, MctsResult};
use crate::eval::backend::{BackendShape, InferenceBackend, open_backend};
use crate::eval::{DispatchShared, Dispatcher, DispatcherHandle, ResponseQueue, StatsSnapshot};
use crate::position::{FeatureEncoder, MateSearcher, SearchPosition};
use crate::queue::MtQueue;
use crate::tt::{NodeRef, NodeTable};

/// 探索の打ち切り条件
#[derive(Clone, Debug, Default)]
pub struct SearchLimits {
    /// シミュレーション回数
    pub nodes: Option<u64>,
    pub time: Option<Duration>,
    /// 外部からの停止要求
    pub stop: Option<Arc<AtomicBool>>,
}

impl SearchLimits {
    pub fn nodes(nodes: u64) -> Self {
        Self {
            nodes: Some(nodes),
            ..Self::default()
        }
    }

    pub fn time(time: Duration) -> Self {
        Self {
            time: Some(time),
            ..Self::default()
        }
    }
}

/// 探索結果
#[derive(Clone, Debug)]
pub struct SearchReport<M> {
    /// None なら投了（ルートが終局）
    pub best_move: Option<M>,
    pub pv: PrincipalVariation<M>,
    pub workers: WorkerStats,
    /// この探索中にディスパッチャが処理した量
    pub dispatch: StatsSnapshot,
    pub root_visits: u64,
    pub hash_fullness: u32,
    pub elapsed: Duration,
}

impl<M> SearchReport<M> {
    /// 1秒あたりのシミュレーション数
    pub fn simulations_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.workers.simulations as f64 / secs
        } else {
            0.0
        }
    }
}

/// 探索エンジン
pub struct SearchEngine<P: SearchPosition> {
    config: EngineConfig,
    mcts: Mcts<P>,
    shared: Arc<DispatchShared<P::Move>>,
    backend_count: usize,
    rng: Mutex<Xoshiro256PlusPlus>,
    dispatchers: Vec<DispatcherHandle>,
}

impl<P: SearchPosition> SearchEngine<P> {
    /// 開いたバックエンドごとにディスパッチャを起動する
    pub fn new(
        config: EngineConfig,
        encoder: Arc<dyn FeatureEncoder<P>>,
        backends: Vec<Box<dyn InferenceBackend>>,
        mate_searcher: Option<Arc<dyn MateSearcher<P>>>,
    ) -> MctsResult<Self> {
        config.validate()?;
        if backends.is_empty() {
            return Err(MctsError::Config("at least one backend is required".into()));
        }
        let expected = BackendShape::new(encoder.sample_size(), encoder.policy_size());
        for backend in &backends {
            if backend.shape() != expected {
                return Err(MctsError::Config(format!(
                    "backend {} has shape {:?}, encoder expects {:?}",
                    backend.name(),
                    backend.shape(),
                    expected
                )));
            }
        }

        let table = NodeTable::with_memory_budget(config.hash_mb * 1024 * 1024, config.search.max_children);
        info!(
            "[Table] {} slots for {} MiB (max_children {})",
            table.capacity(),
            config.hash_mb,
            config.search.max_children
        );

        let requests = Arc::new(MtQueue::new());
        let shared = Arc::new(DispatchShared::new(Arc::clone(&requests)));
        let backend_count = backends.len();
        let mut dispatchers = Vec::with_capacity(backend_count);
        for (id, backend) in backends.into_iter().enumerate() {
            let dispatcher = Dispatcher::new(id, backend, Arc::clone(&shared), config.dispatch.clone());
            match dispatcher.spawn() {
                Ok(handle) => dispatchers.push(handle),
                Err(e) => {
                    // 起動済みの分は Drop で join される
                    requests.close();
                    return Err(e.into());
                }
            }
        }

        let mcts = Mcts::new(table, config.search.clone(), encoder, mate_searcher, requests);
        Ok(Self {
            config,
            mcts,
            shared,
            backend_count,
            rng: Mutex::new(Xoshiro256PlusPlus::seed_from_u64(rand::rng().random())),
            dispatchers,
        })
    }

    /// 設定の `backends` を開いてから `new` する
    pub fn from_config(
        config: EngineConfig,
        encoder: Arc<dyn FeatureEncoder<P>>,
        mate_searcher: Option<Arc<dyn MateSearcher<P>>>,
    ) -> MctsResult<Self> {
        config.validate()?;
        let shape = BackendShape::new(encoder.sample_size(), encoder.policy_size());
        let mut backends = Vec::with_capacity(config.backends.len());
        for (id, backend) in config.backends.iter().enumerate() {
            backends.push(open_backend(backend, shape, config.dispatch.batch_size, id)?);
        }
        Self::new(config, encoder, backends, mate_searcher)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn mcts(&self) -> &Mcts<P> {
        &self.mcts
    }

    /// ディスパッチャ全体の累計
    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats()
    }

    pub fn hash_fullness(&self) -> u32 {
        self.mcts.hash_fullness()
    }

    /// 稼働中のディスパッチャ数
    pub fn dispatchers_alive(&self) -> usize {
        self.shared.alive()
    }

    /// 置換表を空にする（新規対局・致命的エラーの後）
    pub fn reset(&self) {
        self.mcts.reset();
    }

    /// 方策抽選用の乱数の種を固定する
    pub fn set_seed(&self, seed: u64) {
        *self.rng.lock() = Xoshiro256PlusPlus::seed_from_u64(seed);
    }

    /// バックエンドが1つでも落ちていれば以後の探索は即座に失敗させる
    fn ensure_backends(&self) -> MctsResult<()> {
        if let Some(reason) = self.shared.fatal() {
            return Err(MctsError::BackendUnavailable(reason));
        }
        if self.mcts.requests().is_closed() {
            return Err(MctsError::BackendUnavailable("dispatchers stopped".into()));
        }
        Ok(())
    }

    /// ルートを用意し、評価要求を出したならその応答を待って反映する
    fn prepare_root(&self, pos: &P) -> MctsResult<NodeRef> {
        self.ensure_backends()?;
        self.mcts.begin_search(pos.game_ply());
        let responses: Arc<ResponseQueue<P::Move>> = Arc::new(MtQueue::new());
        let status = self.mcts.create_root(pos, &responses)?;
        if status.submitted {
            match responses.pop() {
                Some(response) => self.mcts.apply_response(response)?,
                None => return Err(MctsError::BackendUnavailable("response queue closed".into())),
            }
        }
        Ok(status.node)
    }

    /// 探索して最善手を返す
    pub fn search(&self, pos: &P, limits: &SearchLimits) -> MctsResult<SearchReport<P::Move>> {
        let start = Instant::now();
        let before = self.shared.stats();
        let root = self.prepare_root(pos)?;

        let stop = limits.stop.clone().unwrap_or_else(|| Arc::new(AtomicBool::new(false)));
        let control = SearchControl::new(stop, limits.time.map(|t| start + t), limits.nodes);

        let searchable = self
            .mcts
            .with_tree(|tree| tree.node(root).map(|n| !n.terminal && !n.children.is_empty()))?;

        let mut workers = WorkerStats::default();
        if searchable {
            let threads = self.config.threads;
            let policy = PendingPolicy::adaptive(
                &self.config.search,
                self.config.dispatch.batch_size,
                self.backend_count,
                threads,
            );
            let results: Vec<MctsResult<WorkerStats>> = thread::scope(|s| {
                let handles: Vec<_> = (0..threads)
                    .map(|id| {
                        let worker = SearchWorker::new(id, &self.mcts, &control, root, pos.clone(), policy);
                        s.spawn(move || worker.run())
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|h| {
                        h.join()
                            .unwrap_or_else(|_| Err(MctsError::BackendUnavailable("search thread panicked".into())))
                    })
                    .collect()
            });
            for result in results {
                workers += result?;
            }
        }

        let best_move = self.mcts.best_move(root)?;
        let pv = self.mcts.principal_variation(root, pos)?;
        let after = self.shared.stats();
        let report = SearchReport {
            best_move,
            pv,
            workers,
            dispatch: StatsSnapshot {
                batches: after.batches - before.batches,
                samples: after.samples - before.samples,
            },
            root_visits: self.mcts.root_visits(root),
            hash_fullness: self.mcts.hash_fullness(),
            elapsed: start.elapsed(),
        };
        info!(
            "[MCTS] search done: {} simulations in {} ms ({:.0}/s), root visits {}, batches {} (avg {:.1}), hashfull {}",
            report.workers.simulations,
            report.elapsed.as_millis(),
            report.simulations_per_second(),
            report.root_visits,
            report.dispatch.batches,
            report.dispatch.average_batch(),
            report.hash_fullness
        );
        Ok(report)
    }

    /// ルートだけ評価して事前確率から指し手を選ぶ
    ///
    /// `temperature <= 0` なら最大確率の手。None は投了。
    pub fn policy_move(&self, pos: &P, temperature: f32) -> MctsResult<Option<P::Move>> {
        let root = self.prepare_root(pos)?;
        let mut rng = self.rng.lock();
        self.mcts.policy_move(root, temperature, &mut *rng)
    }

    /// 要求キューを閉じてディスパッチャを止める
    pub fn shutdown(mut self) -> MctsResult<()> {
        self.mcts.requests().close();
        let mut first_error = None;
        for handle in std::mem::take(&mut self.dispatchers) {
            if let Err(e) = handle.join() {
                warn!("[MCTS] dispatcher exited with error: {e}");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl<P: SearchPosition> Drop for SearchEngine<P> {
    fn drop(&mut self) {
        // ディスパッチャの join は DispatcherHandle の Drop で行われる
        self.mcts.requests().close();
    }
}
