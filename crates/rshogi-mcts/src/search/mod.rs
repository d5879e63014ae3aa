//! MCTS 探索
//!
//! - mcts: 選択・展開・backup（木ロック下）と最善手・読み筋
//! - admission: 探索スレッドごとの評価要求の流量制御
//! - worker: 探索スレッド1本のループ
//! - engine: キュー・ディスパッチャ・木をまとめて持つエンジン文脈

mod admission;
mod engine;
mod mcts;
mod worker;

pub use admission::{PendingLimiter, PendingPolicy, compute_pending_limit};
pub use engine::{SearchEngine, SearchLimits, SearchReport};
pub use mcts::{Mcts, PrincipalVariation, RootStatus, SimulationOutcome};
pub use worker::{SearchControl, SearchWorker, WorkerStats};

/// 1回のシミュレーションで辿るノード数の上限（到達したら引き分け扱い）
pub const MAX_SEARCH_PATH_LENGTH: usize = 64;
