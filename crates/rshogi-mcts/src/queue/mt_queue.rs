//! プロセス内の多対多キュー

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// ブロッキング pop を備えた FIFO キュー
///
/// `close()` 後の push は要素を呼び出し側へ返す。pop 系は残りを取り出し切ると
/// 待たずに空を返すので、終了時に待機中のスレッドを起こせる。
pub struct MtQueue<T> {
    state: Mutex<QueueState<T>>,
    not_empty: Condvar,
}

impl<T> Default for MtQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MtQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                closed: false,
            }),
            not_empty: Condvar::new(),
        }
    }

    pub fn push(&self, item: T) -> Result<(), T> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(item);
        }
        state.items.push_back(item);
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// まとめて push する。閉じていれば全要素を返す
    pub fn push_batch<I: IntoIterator<Item = T>>(&self, items: I) -> Result<(), Vec<T>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(items.into_iter().collect());
        }
        let before = state.items.len();
        state.items.extend(items);
        let pushed = state.items.len() - before;
        drop(state);
        match pushed {
            0 => {}
            1 => {
                self.not_empty.notify_one();
            }
            _ => {
                self.not_empty.notify_all();
            }
        }
        Ok(())
    }

    /// 要素が来るまで待つ。閉じられて空なら None
    pub fn pop(&self) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }
            if state.closed {
                return None;
            }
            self.not_empty.wait(&mut state);
        }
    }

    pub fn try_pop(&self) -> Option<T> {
        self.state.lock().items.pop_front()
    }

    /// 最大 `max` 個を `out` に取り出す
    ///
    /// 空のときだけ待ち、1個以上あればその時点で取れる分だけ返す。
    /// 戻り値は取り出した個数（閉じられて空なら 0）。
    pub fn pop_batch(&self, max: usize, out: &mut Vec<T>) -> usize {
        let mut state = self.state.lock();
        while state.items.is_empty() && !state.closed {
            self.not_empty.wait(&mut state);
        }
        Self::drain_into(&mut state, max, out)
    }

    pub fn try_pop_batch(&self, max: usize, out: &mut Vec<T>) -> usize {
        let mut state = self.state.lock();
        Self::drain_into(&mut state, max, out)
    }

    fn drain_into(state: &mut QueueState<T>, max: usize, out: &mut Vec<T>) -> usize {
        let n = state.items.len().min(max);
        out.extend(state.items.drain(..n));
        n
    }

    /// 以後の push を拒否し、待機中の consumer を全て起こす
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.not_empty.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
