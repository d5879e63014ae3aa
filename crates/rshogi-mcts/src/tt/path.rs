//! ノード参照と探索経路

use smallvec::SmallVec;

/// テーブル内ノードへの参照
///
/// スロットが再利用されると世代が進むので、古い参照は NodeTable 側で検出できる。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeRef {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl NodeRef {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

/// ルートからリーフまでの経路
///
/// `nodes[i]` で選んだ子の添字が `edges[i]`、その子が `nodes[i + 1]`。
/// 評価結果を受け取ったときに木を辿り直さず backup するために使う。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SearchPath {
    nodes: SmallVec<[NodeRef; 16]>,
    edges: SmallVec<[u16; 16]>,
}

impl SearchPath {
    pub fn new(root: NodeRef) -> Self {
        let mut nodes = SmallVec::new();
        nodes.push(root);
        Self {
            nodes,
            edges: SmallVec::new(),
        }
    }

    pub fn push(&mut self, edge: u16, child: NodeRef) {
        self.edges.push(edge);
        self.nodes.push(child);
    }

    /// 経路上のノード数（ルートを含む）
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// ルートのみの経路か
    pub fn is_root_only(&self) -> bool {
        self.edges.is_empty()
    }

    pub fn root(&self) -> NodeRef {
        self.nodes[0]
    }

    pub fn leaf(&self) -> NodeRef {
        self.nodes[self.nodes.len() - 1]
    }

    pub fn nodes(&self) -> &[NodeRef] {
        &self.nodes
    }

    pub fn edges(&self) -> &[u16] {
        &self.edges
    }

    /// (親ノード, 選んだ子の添字) をリーフ側から順に返す
    pub fn steps_from_leaf(&self) -> impl Iterator<Item = (NodeRef, usize)> + '_ {
        self.edges
            .iter()
            .enumerate()
            .rev()
            .map(|(i, &edge)| (self.nodes[i], edge as usize))
    }
}
