//! 推論バックエンド
//!
//! 転送路ごとに1実装。どれを使うかは起動時に設定から決める。
//!
//! - FnBackend: プロセス内の推論呼び出し（クロージャ）
//! - SocketBackend: 外部推論プロセスへ TCP で転送
//! - ShmBackend: 外部推論プロセスと共有メモリ ring でやり取り（unix）
//! - UniformBackend: 一様 policy・value 0 の合成バックエンド

pub mod codec;
mod func;
#[cfg(unix)]
mod shm;
mod socket;
mod uniform;

use std::time::Duration;

use thiserror::Error;

use crate::config::BackendConfig;
use crate::error::{MctsError, MctsResult};

pub use func::FnBackend;
#[cfg(unix)]
pub use shm::{ShmBackend, ring_paths, serve_ring_pair};
pub use socket::{SocketBackend, serve_connection};
pub use uniform::UniformBackend;

/// value head の出力数（勝ち・負けの2ロジット）
pub const VALUE_SIZE: usize = 2;

/// バックエンドの入出力形状（1サンプルあたり）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackendShape {
    pub sample_size: usize,
    pub policy_size: usize,
    pub value_size: usize,
}

impl BackendShape {
    pub fn new(sample_size: usize, policy_size: usize) -> Self {
        Self {
            sample_size,
            policy_size,
            value_size: VALUE_SIZE,
        }
    }

    /// 応答1サンプルあたりの f32 数
    pub fn output_size(&self) -> usize {
        self.policy_size + self.value_size
    }
}

/// 1バッチ分の出力
#[derive(Clone, Debug, Default)]
pub struct BatchOutput {
    /// batch * policy_size
    pub policy: Vec<f32>,
    /// batch * value_size
    pub value: Vec<f32>,
}

impl BatchOutput {
    /// 長さを揃えて0埋めする
    pub fn prepare(&mut self, shape: &BackendShape, batch: usize) {
        self.policy.clear();
        self.policy.resize(batch * shape.policy_size, 0.0);
        self.value.clear();
        self.value.resize(batch * shape.value_size, 0.0);
    }

    /// 応答形式（サンプルごとに policy → value）から詰め替える
    pub fn fill_from_interleaved(&mut self, shape: &BackendShape, batch: usize, data: &[f32]) {
        self.prepare(shape, batch);
        let stride = shape.output_size();
        for (i, sample) in data.chunks_exact(stride).take(batch).enumerate() {
            let (policy, value) = sample.split_at(shape.policy_size);
            self.policy[i * shape.policy_size..(i + 1) * shape.policy_size].copy_from_slice(policy);
            self.value[i * shape.value_size..(i + 1) * shape.value_size].copy_from_slice(value);
        }
    }

    /// 応答形式に並べる
    pub fn write_interleaved(&self, shape: &BackendShape, batch: usize, out: &mut Vec<f32>) {
        out.clear();
        out.reserve(batch * shape.output_size());
        for i in 0..batch {
            out.extend_from_slice(&self.policy[i * shape.policy_size..(i + 1) * shape.policy_size]);
            out.extend_from_slice(&self.value[i * shape.value_size..(i + 1) * shape.value_size]);
        }
    }
}

/// バックエンドのエラー
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("transport closed by peer")]
    Closed,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("inference failed: {0}")]
    Runtime(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// 推論バックエンド
///
/// ディスパッチャ1つが1インスタンスを専有し、バッチごとに同期的に呼ぶ。
pub trait InferenceBackend: Send {
    fn name(&self) -> &str;

    fn shape(&self) -> BackendShape;

    /// `input`（batch * sample_size）を推論して `output` を埋める
    fn infer(&mut self, input: &[f32], batch: usize, output: &mut BatchOutput) -> Result<(), BackendError>;
}

/// 設定からバックエンドを開く
///
/// socket は外部プロセスの接続を、shared_memory は ring を作って推論プロセスの attach を待ってから返る。
pub fn open_backend(
    config: &BackendConfig,
    shape: BackendShape,
    batch_capacity: usize,
    id: usize,
) -> MctsResult<Box<dyn InferenceBackend>> {
    match config {
        BackendConfig::Socket { listen } => {
            let backend = SocketBackend::listen(listen, shape, id)?;
            Ok(Box::new(backend))
        }
        #[cfg(unix)]
        BackendConfig::SharedMemory { dir, name, slots } => {
            let backend = ShmBackend::create(dir, name, *slots, batch_capacity, shape)?;
            backend.wait_for_peer(None)?;
            Ok(Box::new(backend))
        }
        #[cfg(not(unix))]
        BackendConfig::SharedMemory { .. } => {
            let _ = batch_capacity;
            Err(MctsError::Config("shared_memory backend requires a unix platform".into()))
        }
        BackendConfig::Uniform { delay_us } => Ok(Box::new(UniformBackend::new(
            shape,
            Duration::from_micros(*delay_us),
        ))),
    }
}

impl From<BackendError> for MctsError {
    fn from(e: BackendError) -> Self {
        MctsError::BackendUnavailable(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interleave_roundtrip_keeps_samples_apart() {
        let shape = BackendShape::new(4, 3);
        let mut output = BatchOutput::default();
        output.prepare(&shape, 2);
        output.policy.copy_from_slice(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        output.value.copy_from_slice(&[0.1, 0.2, 0.3, 0.4]);

        let mut wire = Vec::new();
        output.write_interleaved(&shape, 2, &mut wire);
        assert_eq!(wire, vec![1.0, 2.0, 3.0, 0.1, 0.2, 4.0, 5.0, 6.0, 0.3, 0.4]);

        let mut back = BatchOutput::default();
        back.fill_from_interleaved(&shape, 2, &wire);
        assert_eq!(back.policy, output.policy);
        assert_eq!(back.value, output.value);
    }

    #[test]
    fn test_open_uniform_backend() {
        let shape = BackendShape::new(9, 9);
        let mut backend = open_backend(&BackendConfig::Uniform { delay_us: 0 }, shape, 8, 0).unwrap();
        assert_eq!(backend.shape(), shape);
        let mut out = BatchOutput::default();
        backend.infer(&[0.0; 18], 2, &mut out).unwrap();
        assert_eq!(out.policy.len(), 18);
        assert_eq!(out.value.len(), 4);
    }
}
