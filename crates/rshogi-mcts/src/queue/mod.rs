//! 要求・応答の受け渡しに使うキュー
//!
//! - MtQueue: プロセス内 MPMC FIFO（Condvar で待機）
//! - IpcRing: プロセス間共有メモリ ring（unix のみ、バックオフ付きポーリング）

mod mt_queue;

#[cfg(unix)]
mod ipc_ring;

pub use mt_queue::MtQueue;

#[cfg(unix)]
pub use ipc_ring::{IpcRing, process_alive};
