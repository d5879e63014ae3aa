//! 探索木のノード置き場（置換表）
//!
//! - NodeRef: スロット番号 + 世代による安定参照
//! - SearchPath: ルートからリーフまでのノード参照と選択した子の添字
//! - SearchNode: 1局面分の統計（子ごとの訪問数・価値和・事前確率）
//! - NodeTable: オープンアドレス法のテーブル本体

mod node;
mod path;
mod table;

pub use node::{ChildEdge, NodeState, SearchNode};
pub use path::{NodeRef, SearchPath};
pub use table::NodeTable;

/// find_or_create が一度に調べるスロット数の上限
pub const MAX_PROBE: usize = 256;
