//! 外部推論プロセス
//!
//! エンジンの socket バックエンドへ接続するか、共有メモリ ring の組に attach して、
//! 届いたバッチを合成バックエンドで評価して返す。
//!
//! ```text
//! dnn_forwarder socket --connect 127.0.0.1:7380
//! dnn_forwarder shm --dir /dev/shm --name nn0 --duration-secs 60
//! ```

use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use rshogi_mcts::eval::backend::{BackendShape, InferenceBackend, UniformBackend, serve_connection};
use rshogi_mcts::toy::TicTacToeEncoder;
use tools::init_logging;

#[derive(Parser, Debug)]
#[command(author, version, about = "Inference peer serving engine batches with a synthetic backend")]
struct Cli {
    #[command(subcommand)]
    transport: Transport,

    /// Input floats per sample
    #[arg(long, default_value_t = TicTacToeEncoder::SAMPLE_SIZE)]
    sample_size: usize,

    /// Policy floats per sample
    #[arg(long, default_value_t = TicTacToeEncoder::POLICY_SIZE)]
    policy_size: usize,

    /// Simulated inference time per batch in microseconds
    #[arg(long, default_value_t = 0)]
    delay_us: u64,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Transport {
    /// Connect to an engine's socket backend
    Socket {
        #[arg(long)]
        connect: String,
        /// Keep retrying the connection for this long
        #[arg(long, default_value_t = 10_000)]
        retry_ms: u64,
    },
    /// Attach to a shared-memory ring pair created by the engine
    #[cfg(unix)]
    Shm {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long)]
        name: String,
        /// Stop serving after this many seconds (0 = run until killed)
        #[arg(long, default_value_t = 0)]
        duration_secs: u64,
        #[arg(long, default_value_t = 10_000)]
        retry_ms: u64,
    },
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.debug);
    if let Err(e) = run(cli) {
        log::error!("Fatal error: {e:#}");
        std::process::exit(1);
    }
}

/// 成功するか期限切れになるまで `f` を繰り返す
fn retry<T>(timeout: Duration, what: &str, mut f: impl FnMut() -> std::io::Result<T>) -> Result<T> {
    let deadline = Instant::now() + timeout;
    loop {
        match f() {
            Ok(value) => return Ok(value),
            Err(e) if Instant::now() < deadline => {
                log::debug!("{what} not ready yet: {e}");
                thread::sleep(Duration::from_millis(100));
            }
            Err(e) => return Err(e).with_context(|| format!("{what} failed")),
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let shape = BackendShape::new(cli.sample_size, cli.policy_size);
    let mut backend = UniformBackend::new(shape, Duration::from_micros(cli.delay_us));
    info!(
        "serving {} (sample {} policy {} value {})",
        backend.name(),
        shape.sample_size,
        shape.policy_size,
        shape.value_size
    );
    let start = Instant::now();

    let (batches, samples) = match cli.transport {
        Transport::Socket { connect, retry_ms } => {
            let stream = retry(Duration::from_millis(retry_ms), "connect", || TcpStream::connect(&connect))?;
            info!("connected to {connect}");
            serve_connection(stream, &mut backend).context("socket session aborted")?
        }
        #[cfg(unix)]
        Transport::Shm {
            dir,
            name,
            duration_secs,
            retry_ms,
        } => {
            use rshogi_mcts::eval::backend::{ring_paths, serve_ring_pair};
            use rshogi_mcts::queue::IpcRing;

            let (req_path, res_path) = ring_paths(&dir, &name);
            let timeout = Duration::from_millis(retry_ms);
            let request = retry(timeout, "attach request ring", || IpcRing::attach(&req_path))?;
            let response = retry(timeout, "attach response ring", || IpcRing::attach(&res_path))?;
            info!("attached to {} / {}", req_path.display(), res_path.display());

            let stop = Arc::new(AtomicBool::new(false));
            if duration_secs > 0 {
                let stop = Arc::clone(&stop);
                thread::spawn(move || {
                    thread::sleep(Duration::from_secs(duration_secs));
                    stop.store(true, Ordering::Relaxed);
                });
            }
            serve_ring_pair(&request, &response, &mut backend, &stop).context("ring session aborted")?
        }
    };

    let secs = start.elapsed().as_secs_f64();
    if batches == 0 {
        warn!("no batches served");
    }
    info!(
        "served {batches} batches / {samples} samples in {secs:.1}s ({:.0} samples/s)",
        if secs > 0.0 { samples as f64 / secs } else { 0.0 }
    );
    Ok(())
}
