//! 評価要求の流量制御
//!
//! 探索スレッドごとに `in_flight = submitted - completed` を数え、
//! 上限に達したら新しいシミュレーションを始めずに応答キューで待つ。

use crate::config::SearchParams;

/// pending 上限の決め方
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum PendingPolicy {
    /// 固定値
    Fixed(usize),
    /// 木の大きさとバッチ容量から定期的に再計算する
    Adaptive {
        batch_size: usize,
        backends: usize,
        threads: usize,
        headroom: f32,
        ramp_visits: u32,
        interval: u32,
    },
}

impl PendingPolicy {
    pub fn adaptive(params: &SearchParams, batch_size: usize, backends: usize, threads: usize) -> Self {
        PendingPolicy::Adaptive {
            batch_size,
            backends,
            threads,
            headroom: params.pending_headroom,
            ramp_visits: params.pending_ramp_visits,
            interval: params.pending_recompute_interval,
        }
    }
}

/// `effective_batch * backends * headroom / threads`（最小1）
///
/// 実効バッチサイズはルート訪問数 `ramp_visits` ごとに1ずつ増え、`batch_size` で頭打ち。
/// 木が小さいうちに同じリーフへの重複要求が殺到するのを防ぐ。
pub fn compute_pending_limit(
    batch_size: usize,
    backends: usize,
    threads: usize,
    headroom: f32,
    root_visits: u64,
    ramp_visits: u32,
) -> usize {
    let ramp = root_visits / ramp_visits.max(1) as u64 + 1;
    let effective = (ramp as usize).clamp(1, batch_size.max(1));
    let limit = (effective * backends.max(1)) as f32 * headroom / threads.max(1) as f32;
    (limit.ceil() as usize).max(1)
}

/// 探索スレッド1つ分のカウンタ
#[derive(Debug)]
pub struct PendingLimiter {
    policy: PendingPolicy,
    limit: usize,
    submitted: u64,
    completed: u64,
    since_recompute: u32,
}

impl PendingLimiter {
    pub fn new(policy: PendingPolicy) -> Self {
        let limit = match policy {
            PendingPolicy::Fixed(n) => n.max(1),
            PendingPolicy::Adaptive {
                batch_size,
                backends,
                threads,
                headroom,
                ramp_visits,
                ..
            } => compute_pending_limit(batch_size, backends, threads, headroom, 0, ramp_visits),
        };
        Self {
            policy,
            limit,
            submitted: 0,
            completed: 0,
            since_recompute: 0,
        }
    }

    /// 再計算の時期なら true（呼び出し側がルート訪問数を渡して `recompute` する）
    pub fn due(&mut self) -> bool {
        let PendingPolicy::Adaptive { interval, .. } = self.policy else {
            return false;
        };
        self.since_recompute += 1;
        if self.since_recompute >= interval {
            self.since_recompute = 0;
            true
        } else {
            false
        }
    }

    pub fn recompute(&mut self, root_visits: u64) {
        if let PendingPolicy::Adaptive {
            batch_size,
            backends,
            threads,
            headroom,
            ramp_visits,
            ..
        } = self.policy
        {
            self.limit = compute_pending_limit(batch_size, backends, threads, headroom, root_visits, ramp_visits);
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn in_flight(&self) -> u64 {
        self.submitted - self.completed
    }

    pub fn can_submit(&self) -> bool {
        self.in_flight() < self.limit as u64
    }

    pub fn on_submit(&mut self) {
        self.submitted += 1;
    }

    pub fn on_complete(&mut self) {
        debug_assert!(self.completed < self.submitted, "completion without submission");
        self.completed += 1;
    }

    pub fn submitted(&self) -> u64 {
        self.submitted
    }
}
