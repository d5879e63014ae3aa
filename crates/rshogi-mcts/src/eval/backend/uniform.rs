//! 合成バックエンド

use std::time::Duration;

use super::{BackendError, BackendShape, BatchOutput, InferenceBackend};

/// policy ロジットがすべて0（合法手上で一様）、value 0 を返す
///
/// `delay` で推論時間を模擬できる。
pub struct UniformBackend {
    shape: BackendShape,
    delay: Duration,
}

impl UniformBackend {
    pub fn new(shape: BackendShape, delay: Duration) -> Self {
        Self { shape, delay }
    }
}

impl InferenceBackend for UniformBackend {
    fn name(&self) -> &str {
        "uniform"
    }

    fn shape(&self) -> BackendShape {
        self.shape
    }

    fn infer(&mut self, input: &[f32], batch: usize, output: &mut BatchOutput) -> Result<(), BackendError> {
        if input.len() != batch * self.shape.sample_size {
            return Err(BackendError::Protocol(format!(
                "input of {} floats for batch {batch}",
                input.len()
            )));
        }
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        output.prepare(&self.shape, batch);
        Ok(())
    }
}
