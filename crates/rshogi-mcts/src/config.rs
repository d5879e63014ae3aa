//! 探索・推論パイプラインの設定
//!
//! TOML から読み込み、欠けた項目は既定値で埋める。
//!
//! ```toml
//! hash_mb = 256
//! threads = 4
//!
//! [search]
//! c_puct = 1.0
//! damping = 0.99
//!
//! [dispatch]
//! batch_size = 64
//!
//! [[backends]]
//! kind = "socket"
//! listen = "127.0.0.1:7380"
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{MctsError, MctsResult};

/// バッチサイズの上限
pub const MAX_BATCH_SIZE: usize = 65536;

/// 子ノード候補数の上限（経路の子添字は u16 に収める）
pub const MAX_CHILDREN_LIMIT: usize = u16::MAX as usize;

/// MCTS の探索パラメータ
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchParams {
    /// PUCT の探索項係数
    pub c_puct: f32,
    /// 選択時に辺へ課す virtual loss の大きさ
    pub virtual_loss: i32,
    /// 1手ごとの backup 減衰率（符号反転と同時に掛ける）
    pub damping: f32,
    /// ノードに保持する候補手の上限 K（事前確率上位）
    pub max_children: usize,
    /// 新規リーフで詰み探索を行うか
    pub use_mate_search: bool,
    pub mate_search_depth: u32,
    /// pending 上限計算の余裕係数
    pub pending_headroom: f32,
    /// ルート訪問数がこの値ごとに実効バッチサイズを1増やす
    pub pending_ramp_visits: u32,
    /// pending 上限を再計算する間隔（シミュレーション数）
    pub pending_recompute_interval: u32,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            c_puct: 1.0,
            virtual_loss: 1,
            damping: 0.99,
            max_children: 32,
            use_mate_search: false,
            mate_search_depth: 5,
            pending_headroom: 2.0,
            pending_ramp_visits: 16,
            pending_recompute_interval: 64,
        }
    }
}

/// ディスパッチャ（バッチ推論）のパラメータ
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchParams {
    pub batch_size: usize,
    /// policy softmax の温度
    pub policy_temperature: f32,
    /// value = tanh((v0 - v1) / value_temperature) * value_scale
    pub value_temperature: f32,
    pub value_scale: f32,
    /// 起動時にゼロ入力で1回推論して初回コストを吸収する
    pub warm_up: bool,
}

impl Default for DispatchParams {
    fn default() -> Self {
        Self {
            batch_size: 16,
            policy_temperature: 1.0,
            value_temperature: 1.0,
            value_scale: 1.0,
            warm_up: true,
        }
    }
}

/// 推論バックエンドの選択（起動時に実行時決定）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    /// 外部推論プロセスからの TCP 接続を待ち受ける
    Socket { listen: String },
    /// 共有メモリ ring の組で外部推論プロセスとやり取りする
    SharedMemory {
        dir: PathBuf,
        name: String,
        #[serde(default = "default_ring_slots")]
        slots: u32,
    },
    /// 一様 policy・value 0 を返す合成バックエンド（ベンチ・試験用）
    Uniform {
        #[serde(default)]
        delay_us: u64,
    },
}

fn default_ring_slots() -> u32 {
    4
}

/// エンジン全体の設定
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// 置換表のメモリ予算（MiB）
    pub hash_mb: usize,
    /// 探索スレッド数
    pub threads: usize,
    pub search: SearchParams,
    pub dispatch: DispatchParams,
    /// デバイスごとに1エントリ。ディスパッチャも同数起動する
    pub backends: Vec<BackendConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            hash_mb: 64,
            threads: 1,
            search: SearchParams::default(),
            dispatch: DispatchParams::default(),
            backends: vec![BackendConfig::Uniform { delay_us: 0 }],
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(text: &str) -> MctsResult<Self> {
        let config: EngineConfig =
            toml::from_str(text).map_err(|e| MctsError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> MctsResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// 値域チェック
    pub fn validate(&self) -> MctsResult<()> {
        let fail = |msg: String| Err(MctsError::Config(msg));
        if self.hash_mb == 0 {
            return fail("hash_mb must be >= 1".into());
        }
        if self.threads == 0 {
            return fail("threads must be >= 1".into());
        }
        if self.backends.is_empty() {
            return fail("at least one backend is required".into());
        }

        let s = &self.search;
        if !(s.c_puct > 0.0) {
            return fail(format!("c_puct must be positive, got {}", s.c_puct));
        }
        if s.virtual_loss < 0 {
            return fail(format!("virtual_loss must be >= 0, got {}", s.virtual_loss));
        }
        if !(s.damping > 0.0 && s.damping <= 1.0) {
            return fail(format!("damping must be in (0, 1], got {}", s.damping));
        }
        if s.max_children == 0 || s.max_children > MAX_CHILDREN_LIMIT {
            return fail(format!(
                "max_children must be in 1..={MAX_CHILDREN_LIMIT}, got {}",
                s.max_children
            ));
        }
        if !(s.pending_headroom > 0.0) {
            return fail(format!("pending_headroom must be positive, got {}", s.pending_headroom));
        }
        if s.pending_ramp_visits == 0 || s.pending_recompute_interval == 0 {
            return fail("pending_ramp_visits and pending_recompute_interval must be >= 1".into());
        }

        let d = &self.dispatch;
        if d.batch_size == 0 || d.batch_size > MAX_BATCH_SIZE {
            return fail(format!("batch_size must be in 1..={MAX_BATCH_SIZE}, got {}", d.batch_size));
        }
        if !(d.policy_temperature > 0.0) || !(d.value_temperature > 0.0) {
            return fail("temperatures must be positive".into());
        }

        for backend in &self.backends {
            if let BackendConfig::SharedMemory { slots, .. } = backend {
                if *slots < 2 {
                    return fail(format!("shared memory ring needs >= 2 slots, got {slots}"));
                }
            }
        }
        Ok(())
    }
}
