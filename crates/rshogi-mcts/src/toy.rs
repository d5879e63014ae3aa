//! 三目並べ
//!
//! 探索パイプライン全体を将棋なしで動かすための小さな盤面実装。
//! テスト・ベンチ・tools のバイナリが使う。

use crate::position::{FeatureEncoder, SearchPosition};

const LINES: [[usize; 3]; 8] = [
    [0, 1, 2],
    [3, 4, 5],
    [6, 7, 8],
    [0, 3, 6],
    [1, 4, 7],
    [2, 5, 8],
    [0, 4, 8],
    [2, 4, 6],
];

const fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

/// [マス][石] の Zobrist 値と手番の値
const ZOBRIST: [[u64; 2]; 9] = {
    let mut table = [[0u64; 2]; 9];
    let mut i = 0;
    while i < 9 {
        table[i][0] = splitmix64((i * 2) as u64 + 1);
        table[i][1] = splitmix64((i * 2) as u64 + 2);
        i += 1;
    }
    table
};
const ZOBRIST_SIDE: u64 = splitmix64(0x5151);

/// 手番（先手 X / 後手 O）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stone {
    X,
    O,
}

impl Stone {
    fn index(self) -> usize {
        match self {
            Stone::X => 0,
            Stone::O => 1,
        }
    }

    pub fn opponent(self) -> Stone {
        match self {
            Stone::X => Stone::O,
            Stone::O => Stone::X,
        }
    }
}

/// 三目並べの局面。指し手はマス番号 0..9（左上から行優先）
#[derive(Clone, Debug)]
pub struct TicTacToe {
    cells: [Option<Stone>; 9],
    side: Stone,
    ply: u32,
    key: u64,
}

impl Default for TicTacToe {
    fn default() -> Self {
        Self::new()
    }
}

impl TicTacToe {
    pub fn new() -> Self {
        Self {
            cells: [None; 9],
            side: Stone::X,
            ply: 0,
            key: 0,
        }
    }

    /// 初期局面から指し手列を進めた局面。非合法手があれば None
    pub fn from_moves(moves: &[u8]) -> Option<Self> {
        let mut pos = Self::new();
        for &mv in moves {
            if !pos.is_legal(mv) {
                return None;
            }
            pos.do_move(mv);
        }
        Some(pos)
    }

    pub fn side_to_move(&self) -> Stone {
        self.side
    }

    pub fn cell(&self, sq: usize) -> Option<Stone> {
        self.cells[sq]
    }

    /// 3つ並べた側
    pub fn winner(&self) -> Option<Stone> {
        LINES.iter().find_map(|&[a, b, c]| match self.cells[a] {
            Some(s) if self.cells[b] == Some(s) && self.cells[c] == Some(s) => Some(s),
            _ => None,
        })
    }

    pub fn is_full(&self) -> bool {
        self.cells.iter().all(Option::is_some)
    }

    fn completes_line(&self, sq: usize, stone: Stone) -> bool {
        LINES.iter().any(|line| {
            line.contains(&sq) && line.iter().all(|&c| c == sq || self.cells[c] == Some(stone))
        })
    }
}

impl SearchPosition for TicTacToe {
    type Move = u8;

    fn key(&self) -> u64 {
        self.key
    }

    fn game_ply(&self) -> u32 {
        self.ply
    }

    fn legal_moves(&self) -> Vec<u8> {
        if self.winner().is_some() {
            return Vec::new();
        }
        (0..9u8).filter(|&sq| self.cells[sq as usize].is_none()).collect()
    }

    fn is_legal(&self, mv: u8) -> bool {
        (mv as usize) < 9 && self.cells[mv as usize].is_none() && self.winner().is_none()
    }

    fn do_move(&mut self, mv: u8) {
        let sq = mv as usize;
        debug_assert!(self.cells[sq].is_none(), "square {sq} is occupied");
        self.cells[sq] = Some(self.side);
        self.key ^= ZOBRIST[sq][self.side.index()] ^ ZOBRIST_SIDE;
        self.side = self.side.opponent();
        self.ply += 1;
    }

    fn undo_move(&mut self, mv: u8) {
        let sq = mv as usize;
        let mover = self.side.opponent();
        debug_assert_eq!(self.cells[sq], Some(mover), "square {sq} was not played by {mover:?}");
        self.cells[sq] = None;
        self.key ^= ZOBRIST[sq][mover.index()] ^ ZOBRIST_SIDE;
        self.side = mover;
        self.ply -= 1;
    }

    fn mate_in_one(&self) -> bool {
        self.winner().is_none()
            && (0..9).any(|sq| self.cells[sq].is_none() && self.completes_line(sq, self.side))
    }

    /// 直前の手で3つ並んでいれば負け、盤が埋まっただけなら引き分け
    fn no_moves_score(&self) -> f32 {
        if self.winner().is_some() { -1.0 } else { 0.0 }
    }
}

/// 三目並べの特徴量: 手番側の石 9 + 相手の石 9、policy はマス番号そのまま
#[derive(Clone, Copy, Debug, Default)]
pub struct TicTacToeEncoder;

impl TicTacToeEncoder {
    pub const SAMPLE_SIZE: usize = 18;
    pub const POLICY_SIZE: usize = 9;
}

impl FeatureEncoder<TicTacToe> for TicTacToeEncoder {
    fn board_format(&self) -> u32 {
        1
    }

    fn move_format(&self) -> u32 {
        1
    }

    fn sample_size(&self) -> usize {
        Self::SAMPLE_SIZE
    }

    fn policy_size(&self) -> usize {
        Self::POLICY_SIZE
    }

    fn encode(&self, pos: &TicTacToe, out: &mut [f32]) {
        out.fill(0.0);
        for (sq, cell) in pos.cells.iter().enumerate() {
            match cell {
                Some(s) if *s == pos.side => out[sq] = 1.0,
                Some(_) => out[9 + sq] = 1.0,
                None => {}
            }
        }
    }

    fn move_to_index(&self, _pos: &TicTacToe, mv: u8) -> usize {
        mv as usize
    }
}
