//! 探索スレッド
//!
//! シミュレーションを繰り返しながら自分の応答キューを回収する。
//! 停止後も投入済みの要求の応答をすべて受け取るまで抜けない。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use log::{debug, error};

use super::admission::{PendingLimiter, PendingPolicy};
use super::mcts::{Mcts, SimulationOutcome};
use crate::error::{MctsError, MctsResult};
use crate::eval::{EvalResponse, ResponseQueue};
use crate::position::SearchPosition;
use crate::queue::MtQueue;
use crate::tt::NodeRef;

/// 探索全体の停止条件（スレッド間で共有）
pub struct SearchControl {
    stop: Arc<AtomicBool>,
    deadline: Option<Instant>,
    node_limit: Option<u64>,
    simulations: AtomicU64,
}

impl SearchControl {
    pub fn new(stop: Arc<AtomicBool>, deadline: Option<Instant>, node_limit: Option<u64>) -> Self {
        Self {
            stop,
            deadline,
            node_limit,
            simulations: AtomicU64::new(0),
        }
    }

    /// 停止条件のない制御（外部から `request_stop` するまで続く）
    pub fn unbounded() -> Self {
        Self::new(Arc::new(AtomicBool::new(false)), None, None)
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn should_stop(&self) -> bool {
        if self.stop.load(Ordering::Acquire) {
            return true;
        }
        if self.node_limit.is_some_and(|limit| self.simulations.load(Ordering::Relaxed) >= limit) {
            return true;
        }
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    fn count_simulation(&self) {
        self.simulations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn simulations(&self) -> u64 {
        self.simulations.load(Ordering::Relaxed)
    }
}

/// 探索スレッド1本分の集計
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub simulations: u64,
    pub submitted: u64,
    pub duplicates: u64,
    pub terminals: u64,
    /// 置換表が一杯などで中断したシミュレーション
    pub aborted: u64,
    pub completed: u64,
}

impl std::ops::AddAssign for WorkerStats {
    fn add_assign(&mut self, rhs: Self) {
        self.simulations += rhs.simulations;
        self.submitted += rhs.submitted;
        self.duplicates += rhs.duplicates;
        self.terminals += rhs.terminals;
        self.aborted += rhs.aborted;
        self.completed += rhs.completed;
    }
}

/// 探索スレッド
pub struct SearchWorker<'a, P: SearchPosition> {
    id: usize,
    mcts: &'a Mcts<P>,
    control: &'a SearchControl,
    root: NodeRef,
    pos: P,
    responses: Arc<ResponseQueue<P::Move>>,
    limiter: PendingLimiter,
    stats: WorkerStats,
    fatal: Option<MctsError>,
}

impl<'a, P: SearchPosition> SearchWorker<'a, P> {
    pub fn new(
        id: usize,
        mcts: &'a Mcts<P>,
        control: &'a SearchControl,
        root: NodeRef,
        pos: P,
        policy: PendingPolicy,
    ) -> Self {
        Self {
            id,
            mcts,
            control,
            root,
            pos,
            responses: Arc::new(MtQueue::new()),
            limiter: PendingLimiter::new(policy),
            stats: WorkerStats::default(),
            fatal: None,
        }
    }

    /// このスレッドの応答キュー
    pub fn responses(&self) -> &Arc<ResponseQueue<P::Move>> {
        &self.responses
    }

    pub fn run(mut self) -> MctsResult<WorkerStats> {
        loop {
            if self.fatal.is_some() || self.control.should_stop() {
                // 停止後は投入済みの分を回収し切ってから抜ける
                if self.limiter.in_flight() == 0 {
                    break;
                }
                self.wait_one();
                continue;
            }

            if !self.limiter.can_submit() {
                // pending 上限: 結果が1つ届くまで待つ
                self.wait_one();
                continue;
            }

            if self.limiter.due() {
                let visits = self.mcts.root_visits(self.root);
                self.limiter.recompute(visits);
            }

            let outcome = self.mcts.run_simulation(self.root, &mut self.pos, &self.responses);
            self.control.count_simulation();
            self.stats.simulations += 1;
            match outcome {
                Ok(SimulationOutcome::Submitted) => {
                    self.limiter.on_submit();
                    self.stats.submitted += 1;
                }
                Ok(SimulationOutcome::Duplicate) => {
                    self.stats.duplicates += 1;
                    // 他の要求の結果待ち。自分の分があればそれを待ち、なければ譲る
                    if self.limiter.in_flight() > 0 {
                        self.wait_one();
                    } else {
                        std::thread::yield_now();
                    }
                }
                Ok(SimulationOutcome::Terminal) => self.stats.terminals += 1,
                Err(e) if e.is_recoverable() => {
                    debug!("[MCTS] worker {} simulation aborted: {e}", self.id);
                    self.stats.aborted += 1;
                }
                Err(e) => self.set_fatal(e),
            }

            while let Some(response) = self.responses.try_pop() {
                self.handle(response);
            }
        }

        match self.fatal {
            Some(e) => Err(e),
            None => Ok(self.stats),
        }
    }

    fn wait_one(&mut self) {
        if let Some(response) = self.responses.pop() {
            self.handle(response);
        }
    }

    fn handle(&mut self, response: EvalResponse<P::Move>) {
        self.limiter.on_complete();
        self.stats.completed += 1;
        if let Err(e) = self.mcts.apply_response(response) {
            self.set_fatal(e);
        }
    }

    fn set_fatal(&mut self, e: MctsError) {
        if self.fatal.is_none() {
            error!("[MCTS] worker {} aborting search: {e}", self.id);
            self.fatal = Some(e);
        }
        self.control.request_stop();
    }
}
