//! Common test utilities for rshogi-mcts integration tests

#![allow(dead_code)] // Each test binary uses a different subset

use std::sync::Arc;
use std::time::{Duration, Instant};

use rshogi_mcts::config::SearchParams;
use rshogi_mcts::eval::{EvalRequest, EvalResponse, EvalResult, RequestQueue};
use rshogi_mcts::position::{FeatureEncoder, RepetitionState, SearchPosition};
use rshogi_mcts::queue::MtQueue;
use rshogi_mcts::search::Mcts;
use rshogi_mcts::tt::{NodeState, NodeTable};

pub const T_WAIT: Duration = Duration::from_secs(5);

/// Policy width of the scripted game (moves are labelled 0..POLICY_SIZE)
pub const POLICY_SIZE: usize = 16;
/// Feature layout: [node id, ply, 0, 0]
pub const SAMPLE_SIZE: usize = 4;

struct ScriptNode {
    key: u64,
    ply: u32,
    edges: Vec<(u16, usize)>,
    repetition: RepetitionState,
    no_moves_score: f32,
}

/// Builder for a hand-written game graph
///
/// Node 0 is the root. Edges may point at existing nodes to create
/// transpositions.
pub struct ScriptBuilder {
    nodes: Vec<ScriptNode>,
}

impl Default for ScriptBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptBuilder {
    pub fn new() -> Self {
        Self {
            nodes: vec![ScriptNode {
                key: 0x1000,
                ply: 0,
                edges: Vec::new(),
                repetition: RepetitionState::None,
                no_moves_score: -1.0,
            }],
        }
    }

    /// Add a fresh child of `parent` reached by `mv`
    pub fn child(&mut self, parent: usize, mv: u16) -> usize {
        let id = self.nodes.len();
        let ply = self.nodes[parent].ply + 1;
        self.nodes.push(ScriptNode {
            key: 0x1000 + id as u64,
            ply,
            edges: Vec::new(),
            repetition: RepetitionState::None,
            no_moves_score: -1.0,
        });
        self.nodes[parent].edges.push((mv, id));
        id
    }

    /// Add an edge to an existing node
    pub fn link(&mut self, parent: usize, mv: u16, target: usize) {
        self.nodes[parent].edges.push((mv, target));
    }

    pub fn repetition(&mut self, node: usize, state: RepetitionState) {
        self.nodes[node].repetition = state;
    }

    pub fn no_moves_score(&mut self, node: usize, score: f32) {
        self.nodes[node].no_moves_score = score;
    }

    /// Complete tree of the given branching factor and depth below `parent`
    pub fn fill(&mut self, parent: usize, branching: u16, depth: u32) {
        if depth == 0 {
            return;
        }
        for mv in 0..branching {
            let child = self.child(parent, mv);
            self.fill(child, branching, depth - 1);
        }
    }

    pub fn build(self) -> ScriptPos {
        ScriptPos {
            game: Arc::new(self.nodes),
            stack: vec![0],
        }
    }
}

/// Position in a scripted game
#[derive(Clone)]
pub struct ScriptPos {
    game: Arc<Vec<ScriptNode>>,
    stack: Vec<usize>,
}

impl ScriptPos {
    /// Current node id
    pub fn id(&self) -> usize {
        self.stack.last().copied().unwrap_or(0)
    }

    fn node(&self) -> &ScriptNode {
        &self.game[self.id()]
    }

    /// Position after playing `moves` from the root
    pub fn after(&self, moves: &[u16]) -> ScriptPos {
        let mut pos = self.clone();
        for &mv in moves {
            pos.do_move(mv);
        }
        pos
    }
}

impl SearchPosition for ScriptPos {
    type Move = u16;

    fn key(&self) -> u64 {
        self.node().key
    }

    fn game_ply(&self) -> u32 {
        self.node().ply
    }

    fn legal_moves(&self) -> Vec<u16> {
        self.node().edges.iter().map(|&(mv, _)| mv).collect()
    }

    fn is_legal(&self, mv: u16) -> bool {
        self.node().edges.iter().any(|&(m, _)| m == mv)
    }

    fn do_move(&mut self, mv: u16) {
        let next = self
            .node()
            .edges
            .iter()
            .find(|&&(m, _)| m == mv)
            .map(|&(_, target)| target)
            .unwrap_or_else(|| panic!("illegal move {mv} at node {}", self.id()));
        self.stack.push(next);
    }

    fn undo_move(&mut self, _mv: u16) {
        assert!(self.stack.len() > 1, "undo past the root");
        self.stack.pop();
    }

    fn repetition(&self, _search_ply: u32) -> RepetitionState {
        self.node().repetition
    }

    fn no_moves_score(&self) -> f32 {
        self.node().no_moves_score
    }
}

/// Encoder writing the node id as a marker so backends can echo it back
#[derive(Clone, Copy, Debug, Default)]
pub struct ScriptEncoder;

impl FeatureEncoder<ScriptPos> for ScriptEncoder {
    fn board_format(&self) -> u32 {
        7
    }

    fn move_format(&self) -> u32 {
        7
    }

    fn sample_size(&self) -> usize {
        SAMPLE_SIZE
    }

    fn policy_size(&self) -> usize {
        POLICY_SIZE
    }

    fn encode(&self, pos: &ScriptPos, out: &mut [f32]) {
        out.fill(0.0);
        out[0] = pos.id() as f32;
        out[1] = pos.game_ply() as f32;
    }

    fn move_to_index(&self, _pos: &ScriptPos, mv: u16) -> usize {
        mv as usize
    }
}

/// Search parameters with the defaults but a given virtual loss
pub fn params(virtual_loss: i32) -> SearchParams {
    SearchParams {
        virtual_loss,
        ..SearchParams::default()
    }
}

/// Mcts over a scripted game with a request queue the test drains by hand
pub fn manual_mcts(slots: usize, params: SearchParams) -> (Mcts<ScriptPos>, Arc<RequestQueue<u16>>) {
    let requests = Arc::new(MtQueue::new());
    let table = NodeTable::with_slots(slots, params.max_children);
    let mcts = Mcts::new(table, params, Arc::new(ScriptEncoder), None, Arc::clone(&requests));
    (mcts, requests)
}

/// Answer a request with uniform priors and the given value
pub fn answer(request: EvalRequest<u16>, value: f32) {
    let n = request.moves.len().max(1) as f32;
    let result = EvalResult {
        path: request.path,
        moves: request.moves.iter().map(|&(mv, _)| (mv, 1.0 / n)).collect(),
        value,
        mate_found: request.mate_found,
    };
    request
        .response
        .push(EvalResponse::Ready(result))
        .unwrap_or_else(|_| panic!("response queue closed"));
}

/// Poll `cond` until it holds or the timeout expires
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    cond()
}

/// Assert that every evaluated node's visit sum matches its children
pub fn assert_visits_conserved<M: Copy>(table: &NodeTable<M>) {
    for (r, node) in table.live_nodes() {
        assert_eq!(
            node.visit_sum as i64,
            node.child_visit_total(),
            "visit sum of node {} does not match its children",
            r.index()
        );
        for child in &node.children {
            assert!(child.visits >= 0, "negative visit count left behind");
        }
    }
}

/// Assert that no search path is still parked on a node after the workers drained
pub fn assert_no_waiting_paths<M: Copy>(table: &NodeTable<M>) {
    for (r, node) in table.live_nodes() {
        assert_eq!(node.dup_chain_len(), 0, "node {} still holds waiting paths", r.index());
        assert_ne!(
            node.state(),
            NodeState::EvalPending,
            "node {} is still waiting for a result",
            r.index()
        );
    }
}
