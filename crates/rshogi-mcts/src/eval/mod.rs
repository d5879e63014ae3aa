//! 評価要求のバッチ化と推論バックエンド
//!
//! - request: 探索スレッドとディスパッチャの間を move で行き来する要求・応答
//! - postprocess: 合法手 softmax と value 変換
//! - backend: 推論バックエンド（プロセス内 / ソケット転送 / 共有メモリ）
//! - dispatcher: 要求をバッチにまとめてバックエンドを呼ぶループ

pub mod backend;
mod dispatcher;
mod postprocess;
mod request;

pub use dispatcher::{DispatchShared, DispatchStats, Dispatcher, DispatcherHandle, StatsSnapshot};
pub use postprocess::{softmax_legal, value_from_logits};
pub use request::{EvalRequest, EvalResponse, EvalResult, RequestQueue, ResponseQueue};
