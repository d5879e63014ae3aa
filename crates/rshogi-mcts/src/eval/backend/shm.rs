//! 共有メモリ ring による外部推論プロセスとのやり取り
//!
//! エンジン側が要求 ring と応答 ring を作成し、推論プロセスが attach する。
//! 推論プロセスは要求 ring に pid を登録し、エンジン側は待機中にその生存を確かめる。

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use super::{BackendError, BackendShape, BatchOutput, InferenceBackend};
use crate::queue::{IpcRing, process_alive};

/// 待機中に相手プロセスの生存を確かめる間隔
const PEER_CHECK_INTERVAL: Duration = Duration::from_millis(50);

/// 要求 ring と応答 ring のパス
pub fn ring_paths(dir: &Path, name: &str) -> (PathBuf, PathBuf) {
    (
        dir.join(format!("{name}_request.ring")),
        dir.join(format!("{name}_response.ring")),
    )
}

/// 共有メモリ ring 経由のバックエンド
pub struct ShmBackend {
    name: String,
    shape: BackendShape,
    request: IpcRing,
    response: IpcRing,
    wire: Vec<f32>,
}

impl ShmBackend {
    pub fn create(
        dir: &Path,
        name: &str,
        slots: u32,
        batch_capacity: usize,
        shape: BackendShape,
    ) -> std::io::Result<Self> {
        let (req_path, res_path) = ring_paths(dir, name);
        let batch = batch_capacity as u32;
        let request = IpcRing::create(&req_path, slots, batch, shape.sample_size as u32)?;
        let response = IpcRing::create(&res_path, slots, batch, shape.output_size() as u32)?;
        info!(
            "[IpcRing] backend {name} ready at {} (batch {batch_capacity})",
            dir.display()
        );
        Ok(Self {
            name: format!("shm:{name}"),
            shape,
            request,
            response,
            wire: Vec::new(),
        })
    }

    /// 推論プロセスが attach して pid を登録するまで待つ
    pub fn wait_for_peer(&self, deadline: Option<Instant>) -> std::io::Result<u32> {
        loop {
            if let Some(pid) = self.request.peer_pid()? {
                info!("[IpcRing] {} peer attached (pid {pid})", self.name);
                return Ok(pid);
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "no inference process attached",
                ));
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

/// 相手が登録済みで、そのプロセスがまだ生きているか
fn check_peer(request: &IpcRing) -> Result<(), BackendError> {
    match request.peer_pid()? {
        Some(pid) if process_alive(pid) => Ok(()),
        Some(pid) => {
            warn!("[IpcRing] peer process {pid} is gone");
            Err(BackendError::Closed)
        }
        None => Err(BackendError::Closed),
    }
}

/// `op` を短い期限つきで繰り返し、期限切れのたびに相手の生存を確かめる
fn wait_watched<T>(
    request: &IpcRing,
    mut op: impl FnMut(Option<Instant>) -> std::io::Result<T>,
) -> Result<T, BackendError> {
    loop {
        match op(Some(Instant::now() + PEER_CHECK_INTERVAL)) {
            Ok(value) => return Ok(value),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => check_peer(request)?,
            Err(e) => return Err(e.into()),
        }
    }
}

impl InferenceBackend for ShmBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn shape(&self) -> BackendShape {
        self.shape
    }

    fn infer(&mut self, input: &[f32], batch: usize, output: &mut BatchOutput) -> Result<(), BackendError> {
        let count = batch as u32;
        let (request, response, wire) = (&self.request, &self.response, &mut self.wire);
        check_peer(request)?;
        wait_watched(request, |deadline| request.push_wait(count, input, deadline))?;
        let got = wait_watched(request, |deadline| response.pop_wait(&mut *wire, deadline))?;
        if got != count {
            return Err(BackendError::Protocol(format!(
                "response ring carried {got} samples, expected {count}"
            )));
        }
        output.fill_from_interleaved(&self.shape, batch, &self.wire);
        Ok(())
    }
}

/// 推論プロセス側: `stop` が立つまで要求 ring を処理して応答 ring へ返す
///
/// 処理中は要求 ring に自分の pid を登録しておき、終了時に外す。
/// 戻り値は処理した (バッチ数, サンプル数)。
pub fn serve_ring_pair(
    request: &IpcRing,
    response: &IpcRing,
    backend: &mut dyn InferenceBackend,
    stop: &AtomicBool,
) -> Result<(u64, u64), BackendError> {
    let shape = backend.shape();
    if request.item_floats() != shape.sample_size || response.item_floats() != shape.output_size() {
        return Err(BackendError::Protocol(format!(
            "ring shape {}/{} does not match backend {}/{}",
            request.item_floats(),
            response.item_floats(),
            shape.sample_size,
            shape.output_size()
        )));
    }
    request.register_peer(std::process::id())?;
    let served = serve_loop(request, response, backend, stop);
    request.clear_peer()?;
    served
}

fn serve_loop(
    request: &IpcRing,
    response: &IpcRing,
    backend: &mut dyn InferenceBackend,
    stop: &AtomicBool,
) -> Result<(u64, u64), BackendError> {
    let shape = backend.shape();
    let mut input = Vec::new();
    let mut output = BatchOutput::default();
    let mut wire = Vec::new();
    let (mut batches, mut samples) = (0u64, 0u64);

    while !stop.load(Ordering::Relaxed) {
        // stop を定期的に見るため短い期限つきで待つ
        let deadline = Some(Instant::now() + Duration::from_millis(50));
        let count = match request.pop_wait(&mut input, deadline) {
            Ok(count) => count,
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
            Err(e) => return Err(e.into()),
        };
        let batch = count as usize;
        backend.infer(&input, batch, &mut output)?;
        output.write_interleaved(&shape, batch, &mut wire);
        response.push_wait(count, &wire, None)?;
        batches += 1;
        samples += batch as u64;
    }
    debug!("[IpcRing] server stopped after {batches} batches / {samples} samples");
    Ok((batches, samples))
}
