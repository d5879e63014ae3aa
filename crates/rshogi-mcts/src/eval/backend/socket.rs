//! 外部推論プロセスへのソケット転送
//!
//! エンジン側が待ち受け、推論プロセス（転送ピア）が接続してくる。

use std::io::{BufReader, BufWriter};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};

use log::{debug, info};

use super::codec::{read_request, read_response, write_request, write_response};
use super::{BackendError, BackendShape, BatchOutput, InferenceBackend};

/// TCP で推論を転送するバックエンド
pub struct SocketBackend {
    name: String,
    shape: BackendShape,
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
    wire: Vec<f32>,
}

impl SocketBackend {
    /// 待ち受けて最初の接続を受け入れる（接続されるまでブロック）
    pub fn listen<A: ToSocketAddrs>(addr: A, shape: BackendShape, id: usize) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        info!("[Socket] backend {id} waiting for forwarder on {}", listener.local_addr()?);
        Self::accept(&listener, shape, id)
    }

    pub fn accept(listener: &TcpListener, shape: BackendShape, id: usize) -> std::io::Result<Self> {
        let (stream, peer) = listener.accept()?;
        info!("[Socket] backend {id} connected from {peer}");
        Self::from_stream(stream, shape, format!("socket:{peer}"))
    }

    pub fn from_stream(stream: TcpStream, shape: BackendShape, name: String) -> std::io::Result<Self> {
        stream.set_nodelay(true)?;
        let reader = BufReader::new(stream.try_clone()?);
        let writer = BufWriter::new(stream);
        Ok(Self {
            name,
            shape,
            reader,
            writer,
            wire: Vec::new(),
        })
    }
}

impl InferenceBackend for SocketBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn shape(&self) -> BackendShape {
        self.shape
    }

    fn infer(&mut self, input: &[f32], batch: usize, output: &mut BatchOutput) -> Result<(), BackendError> {
        let count = batch as u32;
        write_request(&mut self.writer, count, input)?;
        read_response(&mut self.reader, count, &self.shape, &mut self.wire)?;
        output.fill_from_interleaved(&self.shape, batch, &self.wire);
        Ok(())
    }
}

/// 転送ピア側: 接続が閉じられるまで要求を `backend` で処理して返す
///
/// 戻り値は処理した (バッチ数, サンプル数)。
pub fn serve_connection(stream: TcpStream, backend: &mut dyn InferenceBackend) -> Result<(u64, u64), BackendError> {
    stream.set_nodelay(true)?;
    let shape = backend.shape();
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = BufWriter::new(stream);
    let mut input = Vec::new();
    let mut output = BatchOutput::default();
    let mut wire = Vec::new();
    let (mut batches, mut samples) = (0u64, 0u64);

    while let Some(count) = read_request(&mut reader, shape.sample_size, &mut input)? {
        let batch = count as usize;
        backend.infer(&input, batch, &mut output)?;
        output.write_interleaved(&shape, batch, &mut wire);
        write_response(&mut writer, count, &wire)?;
        batches += 1;
        samples += batch as u64;
    }
    debug!("[Socket] peer closed after {batches} batches / {samples} samples");
    Ok((batches, samples))
}
