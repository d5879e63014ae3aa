//! 評価要求と評価結果
//!
//! 要求はキューを通して所有権ごと受け渡され、常にどちらか一方だけが持つ。

use std::sync::Arc;

use crate::queue::MtQueue;
use crate::tt::SearchPath;

pub type RequestQueue<M> = MtQueue<EvalRequest<M>>;
pub type ResponseQueue<M> = MtQueue<EvalResponse<M>>;

/// 新規リーフの評価要求
pub struct EvalRequest<M> {
    /// ルートからリーフまでの経路（結果の書き戻し先）
    pub path: SearchPath,
    /// 特徴量（長さは sample_size）
    pub features: Vec<f32>,
    /// 合法手と policy 出力の添字
    pub moves: Vec<(M, u32)>,
    /// リーフ詰み探索で詰みが見つかった
    pub mate_found: bool,
    /// 結果を返す先
    pub response: Arc<ResponseQueue<M>>,
}

/// 評価結果
#[derive(Debug)]
pub struct EvalResult<M> {
    pub path: SearchPath,
    /// 合法手と確率（softmax 済み、合計1）
    pub moves: Vec<(M, f32)>,
    /// 手番側から見た価値
    pub value: f32,
    pub mate_found: bool,
}

/// 応答キューに届くもの
#[derive(Debug)]
pub enum EvalResponse<M> {
    Ready(EvalResult<M>),
    /// バックエンドが落ちて評価できなかった（経路の virtual loss は呼び出し側で回収する）
    Failed { path: SearchPath, reason: String },
}
