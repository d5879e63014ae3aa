//! 探索コアのエラー型

use thiserror::Error;

/// MCTS / 推論パイプラインのエラー
#[derive(Error, Debug)]
pub enum MctsError {
    /// 置換表に空き・再利用可能なスロットがない（そのシミュレーションだけ中断）
    #[error("node table exhausted: no reusable slot in the probe window")]
    TableExhausted,

    /// 推論バックエンドの呼び出し失敗・転送路の切断（探索全体の中断）
    #[error("inference backend unavailable: {0}")]
    BackendUnavailable(String),

    /// 記録済みの経路・読み筋の指し手が再生時に非合法
    #[error("illegal move while replaying a recorded line")]
    IllegalReplay,

    /// 再利用済みスロットへの参照
    #[error("stale node reference: slot {index} generation {generation}")]
    StaleIdentity { index: u32, generation: u32 },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl MctsError {
    /// シミュレーション単位で握りつぶしてよいエラーか
    pub fn is_recoverable(&self) -> bool {
        matches!(self, MctsError::TableExhausted | MctsError::StaleIdentity { .. })
    }
}

pub type MctsResult<T> = Result<T, MctsError>;
