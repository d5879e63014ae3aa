//! プロセス内推論（任意のクロージャを包む）

use super::{BackendError, BackendShape, BatchOutput, InferenceBackend};

/// クロージャで推論するバックエンド
///
/// 呼び出し前に `output` は形状どおり0埋めされている。
pub struct FnBackend<F> {
    name: String,
    shape: BackendShape,
    f: F,
}

impl<F> FnBackend<F>
where
    F: FnMut(&[f32], usize, &mut BatchOutput) -> Result<(), BackendError> + Send,
{
    pub fn new(name: impl Into<String>, shape: BackendShape, f: F) -> Self {
        Self {
            name: name.into(),
            shape,
            f,
        }
    }
}

impl<F> InferenceBackend for FnBackend<F>
where
    F: FnMut(&[f32], usize, &mut BatchOutput) -> Result<(), BackendError> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn shape(&self) -> BackendShape {
        self.shape
    }

    fn infer(&mut self, input: &[f32], batch: usize, output: &mut BatchOutput) -> Result<(), BackendError> {
        output.prepare(&self.shape, batch);
        (self.f)(input, batch, output)
    }
}
