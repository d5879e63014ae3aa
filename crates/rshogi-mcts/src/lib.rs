//! バッチ推論と組み合わせる並列 MCTS
//!
//! 探索スレッドは置換表上の木を辿って新規リーフの評価要求を要求キューへ積み、
//! ディスパッチャがそれをバッチにまとめて推論バックエンドへ渡す。
//! 結果は要求ごとの応答キューで探索スレッドに戻り、木へ backup される。
//!
//! ```text
//! SearchWorker --EvalRequest--> RequestQueue --> Dispatcher --> InferenceBackend
//!      ^                                            |
//!      +------------ ResponseQueue <--EvalResult----+
//! ```
//!
//! 盤面・特徴量・詰み探索は `position` のトレイトで外から与える。

pub mod config;
pub mod error;
pub mod eval;
pub mod mate;
pub mod position;
pub mod queue;
pub mod search;
pub mod toy;
pub mod tt;

pub use config::{BackendConfig, DispatchParams, EngineConfig, SearchParams};
pub use error::{MctsError, MctsResult};
pub use position::{FeatureEncoder, MateSearcher, RepetitionState, SearchPosition};
pub use search::{SearchEngine, SearchLimits, SearchReport};
