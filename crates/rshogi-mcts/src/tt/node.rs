//! 探索ノード

use super::path::SearchPath;

/// 子への辺（候補手1つ分の統計）
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ChildEdge<M> {
    pub mv: M,
    /// 訪問数（未回収の virtual loss を含む）
    pub visits: i32,
    /// 価値の累積（親の手番から見た値）
    pub value_sum: f32,
    /// 事前確率
    pub prior: f32,
}

/// ノードの状態
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    /// 作成直後（評価要求も終局判定もまだ）
    Unvisited,
    /// 評価要求を出して結果待ち
    EvalPending,
    Evaluated,
    /// 勝敗確定。以後評価に回さない
    Terminal,
}

/// 1局面分の探索統計
///
/// テーブルが所有し、スロットの再利用時に `reset` される。
#[derive(Debug)]
pub struct SearchNode<M> {
    /// 子の訪問数の総和（virtual loss を含む）
    pub visit_sum: i32,
    pub terminal: bool,
    pub evaluated: bool,
    pub(crate) pending: bool,
    /// 手番側から見たスコア [-1, 1]（評価済み・終局時のみ有効）
    pub score: f32,
    pub children: Vec<ChildEdge<M>>,
    /// 評価待ちの間にこのノードへ到達した経路（到着順）
    pub(crate) dup_chain: Vec<SearchPath>,
}

impl<M> Default for SearchNode<M> {
    fn default() -> Self {
        Self {
            visit_sum: 0,
            terminal: false,
            evaluated: false,
            pending: false,
            score: 0.0,
            children: Vec::new(),
            dup_chain: Vec::new(),
        }
    }
}

impl<M: Copy> SearchNode<M> {
    /// ゼロ初期化（確保済みのバッファは保持する）
    pub(crate) fn reset(&mut self) {
        self.visit_sum = 0;
        self.terminal = false;
        self.evaluated = false;
        self.pending = false;
        self.score = 0.0;
        self.children.clear();
        self.dup_chain.clear();
    }

    pub fn state(&self) -> NodeState {
        if self.terminal {
            NodeState::Terminal
        } else if self.evaluated {
            NodeState::Evaluated
        } else if self.pending {
            NodeState::EvalPending
        } else {
            NodeState::Unvisited
        }
    }

    /// 評価結果も終局判定もまだ反映されていない（到達した経路は dup_chain 行き）
    pub fn awaiting_result(&self) -> bool {
        !self.terminal && !self.evaluated
    }

    pub fn dup_chain_len(&self) -> usize {
        self.dup_chain.len()
    }

    /// 子の訪問数の総和を数え直す
    pub fn child_visit_total(&self) -> i64 {
        self.children.iter().map(|c| c.visits as i64).sum()
    }

    /// ノード全体の平均価値（未訪問の子の Q の代わり）
    pub fn mean_value(&self) -> f32 {
        if self.visit_sum <= 0 {
            return 0.0;
        }
        let w_sum: f32 = self.children.iter().map(|c| c.value_sum).sum();
        w_sum / self.visit_sum as f32
    }

    /// PUCT で子を選ぶ。同点は添字の小さい方
    ///
    /// `U = prior * c_puct * (sqrt(visit_sum) + 0.001) / (1 + visits)`。
    /// 0.001 は visit_sum == 0 でも最初の1手を事前確率に沿わせるため。
    pub fn select_edge(&self, c_puct: f32) -> Option<usize> {
        if self.children.is_empty() {
            return None;
        }
        let sqrt_sum = (self.visit_sum.max(0) as f32).sqrt() + 0.001;
        let mean = self.mean_value();
        let mut best = 0;
        let mut best_value = f32::NEG_INFINITY;
        for (i, child) in self.children.iter().enumerate() {
            let u = child.prior / (child.visits + 1) as f32 * c_puct * sqrt_sum;
            let q = if child.visits > 0 {
                child.value_sum / child.visits as f32
            } else {
                mean
            };
            let v = q + u;
            if v > best_value {
                best_value = v;
                best = i;
            }
        }
        Some(best)
    }

    /// 選択時の virtual loss
    pub fn add_virtual_loss(&mut self, edge: usize, loss: i32) {
        let child = &mut self.children[edge];
        child.visits += loss;
        child.value_sum -= loss as f32;
        self.visit_sum += loss;
    }

    /// virtual loss を回収して実際の結果（訪問1回・価値 score）に置き換える
    pub fn apply_backup(&mut self, edge: usize, score: f32, loss: i32) {
        let child = &mut self.children[edge];
        child.visits += 1 - loss;
        child.value_sum += score + loss as f32;
        self.visit_sum += 1 - loss;
    }

    /// virtual loss の回収のみ（シミュレーション中断時）
    pub fn retire_virtual_loss(&mut self, edge: usize, loss: i32) {
        let child = &mut self.children[edge];
        child.visits -= loss;
        child.value_sum += loss as f32;
        self.visit_sum -= loss;
    }

    /// 評価結果を書き込む
    ///
    /// `moves` は (指し手, 確率)。確率の降順に並べ替えて上位 `max_children` 手だけ残す。
    pub fn set_evaluated(&mut self, moves: &mut [(M, f32)], value: f32, max_children: usize) {
        moves.sort_by(|a, b| b.1.total_cmp(&a.1));
        let keep = moves.len().min(max_children);
        self.children.clear();
        self.children.reserve(keep);
        self.children.extend(moves[..keep].iter().map(|&(mv, prior)| ChildEdge {
            mv,
            visits: 0,
            value_sum: 0.0,
            prior,
        }));
        self.visit_sum = 0;
        self.score = value;
        self.evaluated = true;
        self.pending = false;
    }

    /// 勝敗確定として書き込む
    pub fn set_terminal(&mut self, score: f32) {
        self.terminal = true;
        self.score = score;
        self.pending = false;
    }

    /// 訪問数最大の子（同数なら先頭）
    pub fn most_visited_edge(&self) -> Option<usize> {
        let mut best: Option<(usize, i32)> = None;
        for (i, c) in self.children.iter().enumerate() {
            if best.is_none_or(|(_, n)| c.visits > n) {
                best = Some((i, c.visits));
            }
        }
        best.map(|(i, _)| i)
    }

    pub(crate) fn take_dup_chain(&mut self) -> Vec<SearchPath> {
        std::mem::take(&mut self.dup_chain)
    }
}
