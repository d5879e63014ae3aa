//! 探索コアが外部に要求するインターフェース
//!
//! - SearchPosition: 局面（合法手生成・千日手判定・宣言勝ち判定はゲーム側の責務）
//! - FeatureEncoder: 局面を固定長テンソルへ、指し手を policy 出力の添字へ変換
//! - MateSearcher: 新規リーフで任意に呼ばれる詰み探索

use std::fmt::Debug;

/// 千日手判定の結果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RepetitionState {
    None,
    Draw,
    Win,
    Lose,
    Superior,
    Inferior,
}

impl RepetitionState {
    /// 手番側から見た確定スコア。千日手でなければ None
    pub fn score(self) -> Option<f32> {
        match self {
            RepetitionState::None => None,
            RepetitionState::Draw => Some(0.0),
            RepetitionState::Win | RepetitionState::Superior => Some(1.0),
            RepetitionState::Lose | RepetitionState::Inferior => Some(-1.0),
        }
    }
}

/// 探索対象の局面
///
/// 探索スレッドはルート局面を clone した私有コピーに対して
/// `do_move` / `undo_move` を繰り返す。
pub trait SearchPosition: Clone + Send {
    type Move: Copy + Eq + Debug + Send + Sync + 'static;

    /// 局面のハッシュキー
    fn key(&self) -> u64;

    /// 初期局面からの手数
    fn game_ply(&self) -> u32;

    fn legal_moves(&self) -> Vec<Self::Move>;

    fn is_legal(&self, mv: Self::Move) -> bool;

    fn do_move(&mut self, mv: Self::Move);

    fn undo_move(&mut self, mv: Self::Move);

    /// 千日手判定。`search_ply` は探索ルートからの手数で、
    /// それより前の履歴をどう扱うかは実装側が決める
    fn repetition(&self, _search_ply: u32) -> RepetitionState {
        RepetitionState::None
    }

    /// 手番側の宣言勝ちが成立しているか
    fn declaration_win(&self) -> bool {
        false
    }

    /// 手番側に1手詰めがあるか
    fn mate_in_one(&self) -> bool {
        false
    }

    /// 合法手がないときの手番側スコア（詰み・ステイルメイト）
    fn no_moves_score(&self) -> f32 {
        -1.0
    }
}

/// 盤面・指し手の特徴量変換
///
/// 形式は小さな整数 ID でバージョン管理され、複数の形式が共存できる。
pub trait FeatureEncoder<P: SearchPosition>: Send + Sync {
    /// 盤面表現の形式 ID
    fn board_format(&self) -> u32;

    /// 指し手表現の形式 ID
    fn move_format(&self) -> u32;

    /// 1サンプルあたりの入力要素数
    fn sample_size(&self) -> usize;

    /// 1サンプルあたりの policy 出力要素数
    fn policy_size(&self) -> usize;

    /// `out`（長さ `sample_size()`）に局面を書き込む
    fn encode(&self, pos: &P, out: &mut [f32]);

    fn move_to_index(&self, pos: &P, mv: P::Move) -> usize;

    /// 合法手と policy 添字の組
    fn legal_move_list(&self, pos: &P) -> Vec<(P::Move, usize)> {
        pos.legal_moves()
            .into_iter()
            .map(|mv| (mv, self.move_to_index(pos, mv)))
            .collect()
    }
}

/// リーフ詰み探索
///
/// 結果は助言にすぎず、見つからなければ通常どおり評価に回る。
pub trait MateSearcher<P: SearchPosition>: Send + Sync {
    /// 手番側の詰み手順を `depth` 手以内で探す
    fn solve(&self, pos: &P, depth: u32) -> Option<Vec<P::Move>>;
}
