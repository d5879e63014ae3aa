//! NodeTable本体
//!
//! - SlotEntry: スロットの識別子（ハッシュキー, 手数）と使用中フラグ
//! - NodeTable: スロット配列とノード配列
//! - find_or_create / find / clear / hash_fullness

use log::debug;

use super::MAX_PROBE;
use super::node::{ChildEdge, SearchNode};
use super::path::NodeRef;
use crate::error::{MctsError, MctsResult};

/// スロットの識別子
#[derive(Clone, Copy, Debug, Default)]
struct SlotEntry {
    key: u64,
    ply: u32,
    /// 再利用のたびに進める世代
    generation: u32,
    in_use: bool,
}

/// 探索木のノード置き場
///
/// スロット数は2の冪で、`key & mask` から線形探索する。
/// 手数が obsolete 水位より小さいエントリは上書き可能。
/// すべての操作は呼び出し側が木のロックを保持している前提。
pub struct NodeTable<M> {
    entries: Vec<SlotEntry>,
    nodes: Vec<SearchNode<M>>,
    mask: usize,
    /// 使用中スロット数
    used: usize,
    obsolete_ply: u32,
    max_children: usize,
}

impl<M: Copy> NodeTable<M> {
    /// 1スロットあたりのバイト数（候補手バッファ込み）
    pub fn slot_bytes(max_children: usize) -> usize {
        std::mem::size_of::<SlotEntry>()
            + std::mem::size_of::<SearchNode<M>>()
            + max_children * std::mem::size_of::<ChildEdge<M>>()
    }

    /// メモリ予算に収まる最大の2の冪スロット数（最小1）
    pub fn slot_count_for_budget(budget_bytes: usize, max_children: usize) -> usize {
        let fits = budget_bytes / Self::slot_bytes(max_children);
        if fits == 0 {
            1
        } else {
            1usize << (usize::BITS - 1 - fits.leading_zeros())
        }
    }

    /// メモリ予算（バイト）から作成
    pub fn with_memory_budget(budget_bytes: usize, max_children: usize) -> Self {
        Self::with_slots(Self::slot_count_for_budget(budget_bytes, max_children), max_children)
    }

    /// スロット数を指定して作成（2の冪に切り下げる）
    pub fn with_slots(slots: usize, max_children: usize) -> Self {
        let slots = if slots <= 1 {
            1
        } else {
            1usize << (usize::BITS - 1 - slots.leading_zeros())
        };
        let mut nodes = Vec::with_capacity(slots);
        nodes.resize_with(slots, SearchNode::default);
        Self {
            entries: vec![SlotEntry::default(); slots],
            nodes,
            mask: slots - 1,
            used: 0,
            obsolete_ply: 0,
            max_children,
        }
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn max_children(&self) -> usize {
        self.max_children
    }

    /// 使用率（千分率）
    pub fn hash_fullness(&self) -> u32 {
        (self.used * 1000 / self.capacity()) as u32
    }

    pub fn obsolete_ply(&self) -> u32 {
        self.obsolete_ply
    }

    /// obsolete 水位を設定する。探索と探索の間でのみ呼ぶこと
    pub fn set_obsolete_ply(&mut self, ply: u32) {
        self.obsolete_ply = ply;
    }

    fn probe_limit(&self) -> usize {
        self.capacity().min(MAX_PROBE)
    }

    fn node_ref(&self, index: usize) -> NodeRef {
        NodeRef {
            index: index as u32,
            generation: self.entries[index].generation,
        }
    }

    /// 識別子に一致するノードを探す。なければ作成する
    ///
    /// 戻り値の bool は新規作成かどうか。
    pub fn find_or_create(&mut self, key: u64, ply: u32) -> MctsResult<(NodeRef, bool)> {
        self.find_or_create_pinned(key, ply, &[])
    }

    /// `pinned` に含まれるノードは最終手段の追い出し対象から外す
    pub fn find_or_create_pinned(
        &mut self,
        key: u64,
        ply: u32,
        pinned: &[NodeRef],
    ) -> MctsResult<(NodeRef, bool)> {
        let start = key as usize & self.mask;
        let limit = self.probe_limit();
        // 最初に見つかった空き、または obsolete なスロット
        let mut free = None;
        for i in 0..limit {
            let index = (start + i) & self.mask;
            let entry = &self.entries[index];
            if !entry.in_use {
                free.get_or_insert(index);
                break;
            }
            if entry.key == key && entry.ply == ply {
                return Ok((self.node_ref(index), false));
            }
            if free.is_none() && entry.ply < self.obsolete_ply {
                free = Some(index);
            }
        }

        let index = match free {
            Some(index) => index,
            None => {
                let victim = self.least_visited_slot(start, limit, pinned).ok_or(MctsError::TableExhausted)?;
                debug!(
                    "[Table] evicting slot {victim} (visits {}) for key {key:016x} ply {ply}",
                    self.nodes[victim].visit_sum
                );
                victim
            }
        };
        Ok((self.claim(index, key, ply), true))
    }

    /// 最終手段の追い出し候補（評価待ちでなく訪問数が最小のスロット）
    fn least_visited_slot(&self, start: usize, limit: usize, pinned: &[NodeRef]) -> Option<usize> {
        let mut best: Option<(usize, i32)> = None;
        for i in 0..limit {
            let index = (start + i) & self.mask;
            let node = &self.nodes[index];
            if node.awaiting_result() || !node.dup_chain.is_empty() {
                continue;
            }
            if pinned.iter().any(|r| r.index as usize == index) {
                continue;
            }
            if best.is_none_or(|(_, visits)| node.visit_sum < visits) {
                best = Some((index, node.visit_sum));
            }
        }
        best.map(|(index, _)| index)
    }

    fn claim(&mut self, index: usize, key: u64, ply: u32) -> NodeRef {
        let entry = &mut self.entries[index];
        if !entry.in_use {
            self.used += 1;
        }
        entry.key = key;
        entry.ply = ply;
        entry.in_use = true;
        entry.generation = entry.generation.wrapping_add(1);
        let node = &mut self.nodes[index];
        node.reset();
        if node.children.capacity() < self.max_children {
            node.children.reserve_exact(self.max_children);
        }
        self.node_ref(index)
    }

    /// 識別子に一致するノードを探す（作成しない）
    pub fn find(&self, key: u64, ply: u32) -> Option<NodeRef> {
        let start = key as usize & self.mask;
        for i in 0..self.probe_limit() {
            let index = (start + i) & self.mask;
            let entry = &self.entries[index];
            if !entry.in_use {
                return None;
            }
            if entry.key == key && entry.ply == ply {
                return Some(self.node_ref(index));
            }
        }
        None
    }

    /// 参照がまだ同じノードを指しているか
    pub fn is_live(&self, r: NodeRef) -> bool {
        self.entries
            .get(r.index as usize)
            .is_some_and(|e| e.in_use && e.generation == r.generation)
    }

    fn check(&self, r: NodeRef) -> MctsResult<usize> {
        if self.is_live(r) {
            Ok(r.index as usize)
        } else {
            Err(MctsError::StaleIdentity {
                index: r.index,
                generation: r.generation,
            })
        }
    }

    pub fn node(&self, r: NodeRef) -> MctsResult<&SearchNode<M>> {
        let index = self.check(r)?;
        Ok(&self.nodes[index])
    }

    pub fn node_mut(&mut self, r: NodeRef) -> MctsResult<&mut SearchNode<M>> {
        let index = self.check(r)?;
        Ok(&mut self.nodes[index])
    }

    /// 使用中ノードを列挙する（検査用）
    pub fn live_nodes(&self) -> impl Iterator<Item = (NodeRef, &SearchNode<M>)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.in_use)
            .map(|(i, _)| (self.node_ref(i), &self.nodes[i]))
    }

    /// 全スロットを空にする。既存の参照はすべて無効になる
    pub fn clear(&mut self)
    where
        M: Send,
    {
        self.used = 0;
        self.obsolete_ply = 0;
        let len = self.entries.len();
        let threads = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);

        // サイズが小さい場合やスレッド数が1の場合は逐次クリア
        if threads <= 1 || len < threads * 1024 {
            for (entry, node) in self.entries.iter_mut().zip(self.nodes.iter_mut()) {
                clear_slot(entry, node);
            }
            return;
        }

        let chunk = len.div_ceil(threads);
        std::thread::scope(|scope| {
            for (entries, nodes) in self.entries.chunks_mut(chunk).zip(self.nodes.chunks_mut(chunk)) {
                scope.spawn(move || {
                    for (entry, node) in entries.iter_mut().zip(nodes.iter_mut()) {
                        clear_slot(entry, node);
                    }
                });
            }
        });
    }
}

fn clear_slot<M: Copy>(entry: &mut SlotEntry, node: &mut SearchNode<M>) {
    entry.in_use = false;
    // 世代は残して進める（古い NodeRef を確実に無効化する）
    entry.generation = entry.generation.wrapping_add(1);
    node.reset();
}
