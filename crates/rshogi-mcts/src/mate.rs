//! リーフ用の詰み探索
//!
//! 攻め方（手番側）の全合法手 × 受け方の全合法手を深さ制限付きで読む AND/OR 探索。
//! 奇数手の反復深化で最短の詰み手順を返す。受け方の合法手がなく
//! `no_moves_score() < 0` なら詰み。

use crate::position::{MateSearcher, SearchPosition};

/// 深さ制限付き AND/OR 詰み探索
#[derive(Clone, Copy, Debug)]
pub struct AndOrMateSearcher {
    /// 1回の `solve` で展開する局面数の上限
    node_limit: u64,
}

impl Default for AndOrMateSearcher {
    fn default() -> Self {
        Self { node_limit: 100_000 }
    }
}

impl AndOrMateSearcher {
    pub fn new(node_limit: u64) -> Self {
        Self { node_limit }
    }

    pub fn node_limit(&self) -> u64 {
        self.node_limit
    }
}

impl<P: SearchPosition> MateSearcher<P> for AndOrMateSearcher {
    fn solve(&self, pos: &P, depth: u32) -> Option<Vec<P::Move>> {
        let mut pos = pos.clone();
        let mut budget = self.node_limit;
        let mut d = 1;
        while d <= depth {
            let mut line = Vec::new();
            if attack(&mut pos, d, &mut budget, &mut line) {
                line.reverse();
                return Some(line);
            }
            if budget == 0 {
                break;
            }
            d += 2;
        }
        None
    }
}

/// OR ノード: どれか1手で詰めば成功。`line` には手順を逆順に積む
fn attack<P: SearchPosition>(pos: &mut P, depth: u32, budget: &mut u64, line: &mut Vec<P::Move>) -> bool {
    if depth == 0 {
        return false;
    }
    for mv in pos.legal_moves() {
        if *budget == 0 {
            return false;
        }
        *budget -= 1;
        let mut tail = Vec::new();
        pos.do_move(mv);
        let mated = defend(pos, depth - 1, budget, &mut tail);
        pos.undo_move(mv);
        if mated {
            line.extend(tail);
            line.push(mv);
            return true;
        }
    }
    false
}

/// AND ノード: 受け方のすべての手に対して詰めば成功
fn defend<P: SearchPosition>(pos: &mut P, depth: u32, budget: &mut u64, line: &mut Vec<P::Move>) -> bool {
    let moves = pos.legal_moves();
    if moves.is_empty() {
        return pos.no_moves_score() < 0.0;
    }
    if depth == 0 {
        return false;
    }
    let mut first: Option<Vec<P::Move>> = None;
    for mv in moves {
        let mut tail = Vec::new();
        pos.do_move(mv);
        let mated = attack(pos, depth - 1, budget, &mut tail);
        pos.undo_move(mv);
        if !mated {
            return false;
        }
        if first.is_none() {
            tail.push(mv);
            first = Some(tail);
        }
    }
    line.extend(first.unwrap_or_default());
    true
}
