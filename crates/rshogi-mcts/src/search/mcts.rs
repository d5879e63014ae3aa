//! MCTS 本体
//!
//! 木全体を1つの Mutex で守る。選択・ノード作成・backup はロック中に行い、
//! 特徴量の作成と評価要求の投入はロックを外して行う。

use std::sync::Arc;

use log::{debug, error, warn};
use parking_lot::{Mutex, MutexGuard};
use rand::Rng;
use smallvec::SmallVec;

use super::MAX_SEARCH_PATH_LENGTH;
use crate::config::SearchParams;
use crate::error::{MctsError, MctsResult};
use crate::eval::{EvalRequest, EvalResponse, EvalResult, RequestQueue, ResponseQueue};
use crate::position::{FeatureEncoder, MateSearcher, SearchPosition};
use crate::tt::{NodeRef, NodeTable, SearchPath};

/// シミュレーション1回の結果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SimulationOutcome {
    /// 新規リーフの評価要求を投入した
    Submitted,
    /// 評価待ちのノードに到達し、重複評価チェーンに登録した
    Duplicate,
    /// 終局・千日手・手数上限などで即座に backup した
    Terminal,
}

/// ルート作成の結果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RootStatus {
    pub node: NodeRef,
    /// 評価要求を投入した（応答を1つ待つ必要がある）
    pub submitted: bool,
}

/// 読み筋
#[derive(Clone, Debug, PartialEq)]
pub struct PrincipalVariation<M> {
    pub moves: Vec<M>,
    /// ルート手番から見た評価値 [-1, 1]
    pub value: f32,
}

type Tree<M> = NodeTable<M>;

/// 探索エンジンの文脈
///
/// 置換表と要求キューを所有し、探索スレッドからは参照で共有される。
pub struct Mcts<P: SearchPosition> {
    tree: Mutex<Tree<P::Move>>,
    params: SearchParams,
    encoder: Arc<dyn FeatureEncoder<P>>,
    mate_searcher: Option<Arc<dyn MateSearcher<P>>>,
    requests: Arc<RequestQueue<P::Move>>,
}

impl<P: SearchPosition> Mcts<P> {
    pub fn new(
        table: NodeTable<P::Move>,
        params: SearchParams,
        encoder: Arc<dyn FeatureEncoder<P>>,
        mate_searcher: Option<Arc<dyn MateSearcher<P>>>,
        requests: Arc<RequestQueue<P::Move>>,
    ) -> Self {
        Self {
            tree: Mutex::new(table),
            params,
            encoder,
            mate_searcher,
            requests,
        }
    }

    pub fn params(&self) -> &SearchParams {
        &self.params
    }

    pub fn requests(&self) -> &Arc<RequestQueue<P::Move>> {
        &self.requests
    }

    /// 木をロックして読む（診断・検査用）
    pub fn with_tree<R>(&self, f: impl FnOnce(&NodeTable<P::Move>) -> R) -> R {
        f(&self.tree.lock())
    }

    pub fn hash_fullness(&self) -> u32 {
        self.tree.lock().hash_fullness()
    }

    /// 置換表を空にする
    pub fn reset(&self) {
        self.tree.lock().clear();
    }

    /// obsolete 水位を進める（探索開始前のみ）
    pub fn begin_search(&self, root_ply: u32) {
        self.tree.lock().set_obsolete_ply(root_ply);
    }

    /// ルートの訪問数
    pub fn root_visits(&self, root: NodeRef) -> u64 {
        self.tree
            .lock()
            .node(root)
            .map(|n| n.visit_sum.max(0) as u64)
            .unwrap_or(0)
    }

    /// ルートノードを用意する
    ///
    /// 新規（または評価されないまま残っていた）ルートなら評価要求を出す。
    pub fn create_root(&self, pos: &P, responses: &Arc<ResponseQueue<P::Move>>) -> MctsResult<RootStatus> {
        let mut tree = self.tree.lock();
        let (root, created) = tree.find_or_create(pos.key(), pos.game_ply())?;
        let orphaned = !created && tree.node(root)?.awaiting_result();
        if created || orphaned {
            tree.node_mut(root)?.pending = true;
        }
        drop(tree);

        if !created && !orphaned {
            return Ok(RootStatus {
                node: root,
                submitted: false,
            });
        }
        if orphaned {
            debug!("[MCTS] re-submitting unevaluated root");
        }
        let outcome = self.expand(SearchPath::new(root), pos, responses)?;
        debug!("[MCTS] created root (created {created}, outcome {outcome:?})");
        Ok(RootStatus {
            node: root,
            submitted: outcome == SimulationOutcome::Submitted,
        })
    }

    /// シミュレーションを1回行う
    ///
    /// `pos` はルート局面。終了時には元の局面に戻っている。
    pub fn run_simulation(
        &self,
        root: NodeRef,
        pos: &mut P,
        responses: &Arc<ResponseQueue<P::Move>>,
    ) -> MctsResult<SimulationOutcome> {
        let mut played: SmallVec<[P::Move; 64]> = SmallVec::new();
        let result = self.descend(root, pos, responses, &mut played);
        for &mv in played.iter().rev() {
            pos.undo_move(mv);
        }
        result
    }

    fn descend(
        &self,
        root: NodeRef,
        pos: &mut P,
        responses: &Arc<ResponseQueue<P::Move>>,
        played: &mut SmallVec<[P::Move; 64]>,
    ) -> MctsResult<SimulationOutcome> {
        let loss = self.params.virtual_loss;
        let mut tree = self.tree.lock();
        let mut path = SearchPath::new(root);

        loop {
            let current = path.leaf();
            if path.len() >= MAX_SEARCH_PATH_LENGTH {
                // 千日手模様などで深くなりすぎた。引き分け扱い
                self.backup_locked(&mut tree, &path, 0.0);
                return Ok(SimulationOutcome::Terminal);
            }

            let node = tree.node(current)?;
            if node.terminal {
                let score = node.score;
                self.backup_locked(&mut tree, &path, score);
                return Ok(SimulationOutcome::Terminal);
            }

            // 千日手は経路に依存するのでノードには書かない。ルートは判定しない
            if !path.is_root_only() {
                if let Some(score) = pos.repetition((path.len() - 1) as u32).score() {
                    self.backup_locked(&mut tree, &path, score);
                    return Ok(SimulationOutcome::Terminal);
                }
            }

            if node.awaiting_result() {
                let node = tree.node_mut(current)?;
                if node.pending {
                    node.dup_chain.push(path);
                    return Ok(SimulationOutcome::Duplicate);
                }
                // 評価に失敗して放棄されたノード。この経路で評価し直す
                node.pending = true;
                drop(tree);
                debug!("[MCTS] re-submitting an abandoned leaf");
                return self.expand(path, pos, responses);
            }

            let Some(edge) = node.select_edge(self.params.c_puct) else {
                // 候補手がない評価済みノード（結果の合法手が空）
                let score = node.score;
                self.backup_locked(&mut tree, &path, score);
                return Ok(SimulationOutcome::Terminal);
            };
            let mv = node.children[edge].mv;
            tree.node_mut(current)?.add_virtual_loss(edge, loss);

            pos.do_move(mv);
            played.push(mv);

            match tree.find_or_create_pinned(pos.key(), pos.game_ply(), path.nodes()) {
                Ok((child, created)) => {
                    path.push(edge as u16, child);
                    if created {
                        // ロックを外す前に評価待ちにして、後続の経路を dup_chain へ回す
                        tree.node_mut(child)?.pending = true;
                        drop(tree);
                        return self.expand(path, pos, responses);
                    }
                }
                Err(e) => {
                    // このシミュレーションだけ中断し、課した virtual loss を戻す
                    if let Ok(node) = tree.node_mut(current) {
                        node.retire_virtual_loss(edge, loss);
                    }
                    self.retire_locked(&mut tree, &path);
                    return Err(e);
                }
            }
        }
    }

    /// 新規ノードの処理（ロック外、ノードは pending 済み）
    ///
    /// 宣言勝ち・1手詰め・合法手なしは推論を通さず確定させる。
    /// それ以外は特徴量を作って要求キューへ投入する。
    fn expand(
        &self,
        path: SearchPath,
        pos: &P,
        responses: &Arc<ResponseQueue<P::Move>>,
    ) -> MctsResult<SimulationOutcome> {
        // ルートでは指し手が必要なので通常どおり評価する
        if !path.is_root_only() && (pos.declaration_win() || pos.mate_in_one()) {
            return self.resolve_terminal(&path, 1.0);
        }

        let legal: Vec<(P::Move, usize)> = self.encoder.legal_move_list(pos);
        if legal.is_empty() {
            return self.resolve_terminal(&path, pos.no_moves_score());
        }

        let mut features = vec![0.0f32; self.encoder.sample_size()];
        self.encoder.encode(pos, &mut features);
        debug_assert!(
            legal.iter().all(|&(_, idx)| idx < self.encoder.policy_size()),
            "move index out of policy range"
        );
        let moves = legal.into_iter().map(|(mv, idx)| (mv, idx as u32)).collect();

        let mate_found = match &self.mate_searcher {
            Some(searcher) if self.params.use_mate_search => {
                searcher.solve(pos, self.params.mate_search_depth).is_some()
            }
            _ => false,
        };

        let request = EvalRequest {
            path,
            features,
            moves,
            mate_found,
            response: Arc::clone(responses),
        };
        if let Err(request) = self.requests.push(request) {
            // ディスパッチャが全滅して要求キューが閉じられている
            self.abandon(&request.path);
            return Err(MctsError::BackendUnavailable("request queue closed".into()));
        }
        Ok(SimulationOutcome::Submitted)
    }

    /// 新規ノードを勝敗確定として backup し、その間に溜まった重複経路も backup する
    fn resolve_terminal(&self, path: &SearchPath, score: f32) -> MctsResult<SimulationOutcome> {
        let mut tree = self.tree.lock();
        let node = tree.node_mut(path.leaf())?;
        node.set_terminal(score);
        let chain = node.take_dup_chain();
        self.backup_locked(&mut tree, path, score);
        for dup in &chain {
            self.backup_locked(&mut tree, dup, score);
        }
        Ok(SimulationOutcome::Terminal)
    }

    /// 応答を木に反映する
    ///
    /// 失敗応答なら経路の virtual loss を回収したうえで BackendUnavailable を返す。
    pub fn apply_response(&self, response: EvalResponse<P::Move>) -> MctsResult<()> {
        match response {
            EvalResponse::Ready(result) => {
                self.backup_result(result);
                Ok(())
            }
            EvalResponse::Failed { path, reason } => {
                self.abandon(&path);
                Err(MctsError::BackendUnavailable(reason))
            }
        }
    }

    fn backup_result(&self, mut result: EvalResult<P::Move>) {
        let mut tree = self.tree.lock();
        let max_children = tree.max_children();
        let node = match tree.node_mut(result.path.leaf()) {
            Ok(node) => node,
            Err(e) => {
                warn!("[MCTS] result for a recycled slot dropped: {e}");
                self.retire_locked(&mut tree, &result.path);
                return;
            }
        };
        node.set_evaluated(&mut result.moves, result.value, max_children);
        let score = if result.mate_found {
            node.set_terminal(1.0);
            1.0
        } else {
            result.value
        };
        let chain = node.take_dup_chain();
        self.backup_locked(&mut tree, &result.path, score);
        for dup in &chain {
            self.backup_locked(&mut tree, dup, score);
        }
    }

    /// 評価できなかった経路（と重複経路）の virtual loss を回収する
    ///
    /// ノードは未評価・非 pending に戻り、次に到達した経路が評価要求を出し直す。
    fn abandon(&self, path: &SearchPath) {
        let mut tree = self.tree.lock();
        let chain = match tree.node_mut(path.leaf()) {
            Ok(node) => {
                node.pending = false;
                node.take_dup_chain()
            }
            Err(_) => Vec::new(),
        };
        self.retire_locked(&mut tree, path);
        for dup in &chain {
            self.retire_locked(&mut tree, dup);
        }
    }

    /// リーフの親からルートへ、virtual loss を実際の結果に置き換えながら値を伝える
    ///
    /// 1手ごとに符号を反転し damping を掛ける。
    fn backup_locked(&self, tree: &mut MutexGuard<'_, Tree<P::Move>>, path: &SearchPath, leaf_score: f32) {
        let loss = self.params.virtual_loss;
        let mut score = leaf_score;
        for (parent, edge) in path.steps_from_leaf() {
            score *= -self.params.damping;
            match tree.node_mut(parent) {
                Ok(node) => node.apply_backup(edge, score, loss),
                Err(e) => warn!("[MCTS] backup skipped a recycled node: {e}"),
            }
        }
    }

    fn retire_locked(&self, tree: &mut MutexGuard<'_, Tree<P::Move>>, path: &SearchPath) {
        let loss = self.params.virtual_loss;
        for (parent, edge) in path.steps_from_leaf() {
            if let Ok(node) = tree.node_mut(parent) {
                node.retire_virtual_loss(edge, loss);
            }
        }
    }

    /// 最善手: 訪問数 + 事前確率 が最大の子。子がなければ None（投了）
    pub fn best_move(&self, root: NodeRef) -> MctsResult<Option<P::Move>> {
        let tree = self.tree.lock();
        let node = tree.node(root)?;
        let mut best: Option<(P::Move, f32)> = None;
        for child in &node.children {
            let key = child.visits as f32 + child.prior;
            if best.is_none_or(|(_, b)| key > b) {
                best = Some((child.mv, key));
            }
        }
        Ok(best.map(|(mv, _)| mv))
    }

    /// 事前確率だけで指し手を選ぶ（木探索なし）
    ///
    /// `temperature <= 0` なら最大の事前確率、そうでなければ `p^(1/T)` に比例して抽選する。
    pub fn policy_move<R: Rng + ?Sized>(
        &self,
        root: NodeRef,
        temperature: f32,
        rng: &mut R,
    ) -> MctsResult<Option<P::Move>> {
        let tree = self.tree.lock();
        let node = tree.node(root)?;
        if node.terminal || node.children.is_empty() {
            return Ok(None);
        }
        if temperature <= 0.0 {
            let mut best = &node.children[0];
            for child in &node.children[1..] {
                if child.prior > best.prior {
                    best = child;
                }
            }
            return Ok(Some(best.mv));
        }
        let weights: Vec<f64> = node
            .children
            .iter()
            .map(|c| (c.prior.max(0.0) as f64).powf(1.0 / temperature as f64))
            .collect();
        let total: f64 = weights.iter().sum();
        if !(total > 0.0) {
            return Ok(Some(node.children[0].mv));
        }
        let mut x = rng.random::<f64>() * total;
        for (child, w) in node.children.iter().zip(&weights) {
            if x < *w {
                return Ok(Some(child.mv));
            }
            x -= w;
        }
        Ok(node.children.last().map(|c| c.mv))
    }

    /// 読み筋（各局面で訪問数最大の子を辿る）
    pub fn principal_variation(&self, root: NodeRef, pos: &P) -> MctsResult<PrincipalVariation<P::Move>> {
        let tree = self.tree.lock();
        let root_node = tree.node(root)?;
        if root_node.terminal {
            return Ok(PrincipalVariation {
                moves: Vec::new(),
                value: root_node.score,
            });
        }
        let value = match root_node.most_visited_edge().map(|e| &root_node.children[e]) {
            Some(child) if child.visits > 0 => child.value_sum / child.visits as f32,
            _ => 0.0,
        };

        let mut pos = pos.clone();
        let mut moves = Vec::new();
        let mut current = root;
        while moves.len() < MAX_SEARCH_PATH_LENGTH {
            let node = tree.node(current)?;
            if node.terminal {
                break;
            }
            let Some(edge) = node.most_visited_edge() else {
                break;
            };
            let child = &node.children[edge];
            if child.visits <= 0 {
                break;
            }
            if !pos.is_legal(child.mv) {
                error!("[MCTS] illegal move {:?} while replaying the principal variation", child.mv);
                return Err(MctsError::IllegalReplay);
            }
            pos.do_move(child.mv);
            moves.push(child.mv);
            // 読み筋が途切れたらそこまで
            let Some(next) = tree.find(pos.key(), pos.game_ply()) else {
                break;
            };
            current = next;
        }
        Ok(PrincipalVariation { moves, value })
    }
}
