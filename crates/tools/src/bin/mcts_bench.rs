//! 合成バックエンドで MCTS を回してスループットを測る
//!
//! ```text
//! mcts_bench --threads 4 --batch-size 32 --nodes 20000 --searches 5
//! mcts_bench --config engine.toml --games 3
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use log::info;
use rshogi_mcts::mate::AndOrMateSearcher;
use rshogi_mcts::position::{MateSearcher, SearchPosition};
use rshogi_mcts::toy::{TicTacToe, TicTacToeEncoder};
use rshogi_mcts::{EngineConfig, SearchEngine, SearchLimits, SearchReport};
use serde_json::json;
use tools::{init_logging, square_name};

#[derive(Parser, Debug)]
#[command(author, version, about = "MCTS throughput benchmark on a synthetic backend")]
struct Cli {
    /// Engine configuration (TOML). Defaults are used when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override search threads
    #[arg(long)]
    threads: Option<usize>,

    /// Override dispatcher batch size
    #[arg(long)]
    batch_size: Option<usize>,

    /// Override hash size (MiB)
    #[arg(long)]
    hash_mb: Option<usize>,

    /// Simulations per search
    #[arg(long, default_value_t = 10_000)]
    nodes: u64,

    /// Time budget per search in milliseconds (0 = none)
    #[arg(long, default_value_t = 0)]
    time_ms: u64,

    /// Number of searches from the initial position
    #[arg(long, default_value_t = 3)]
    searches: u32,

    /// Play self-play games instead of repeated searches
    #[arg(long, default_value_t = 0)]
    games: u32,

    /// Pick moves from root priors only (no tree search)
    #[arg(long)]
    policy_only: bool,

    /// Sampling temperature for --policy-only (0 = highest prior)
    #[arg(long, default_value_t = 0.0)]
    temperature: f32,

    /// Seed for --policy-only sampling
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Consult the leaf mate searcher
    #[arg(long)]
    mate_search: bool,

    /// Print one JSON object per search on stdout
    #[arg(long)]
    json: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.debug);
    if let Err(e) = run(cli) {
        log::error!("Fatal error: {e:#}");
        std::process::exit(1);
    }
}

fn load_config(cli: &Cli) -> Result<EngineConfig> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path).with_context(|| format!("failed to load {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(threads) = cli.threads {
        config.threads = threads;
    }
    if let Some(batch_size) = cli.batch_size {
        config.dispatch.batch_size = batch_size;
    }
    if let Some(hash_mb) = cli.hash_mb {
        config.hash_mb = hash_mb;
    }
    if cli.mate_search {
        config.search.use_mate_search = true;
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn limits(cli: &Cli) -> SearchLimits {
    SearchLimits {
        nodes: Some(cli.nodes),
        time: (cli.time_ms > 0).then(|| Duration::from_millis(cli.time_ms)),
        stop: None,
    }
}

fn format_pv(moves: &[u8]) -> String {
    moves.iter().map(|&mv| square_name(mv)).collect::<Vec<_>>().join(" ")
}

fn print_report(index: u32, report: &SearchReport<u8>, as_json: bool) {
    if as_json {
        let line = json!({
            "search": index,
            "best_move": report.best_move.map(square_name),
            "pv": report.pv.moves.iter().map(|&mv| square_name(mv)).collect::<Vec<_>>(),
            "value": report.pv.value,
            "simulations": report.workers.simulations,
            "submitted": report.workers.submitted,
            "duplicates": report.workers.duplicates,
            "terminals": report.workers.terminals,
            "aborted": report.workers.aborted,
            "batches": report.dispatch.batches,
            "samples": report.dispatch.samples,
            "average_batch": report.dispatch.average_batch(),
            "root_visits": report.root_visits,
            "hashfull": report.hash_fullness,
            "elapsed_ms": report.elapsed.as_millis() as u64,
            "sims_per_sec": report.simulations_per_second(),
        });
        println!("{line}");
    } else {
        println!(
            "search {index}: bestmove {} value {:.3} pv {} | sims {} ({:.0}/s) dup {} term {} abort {} | batches {} avg {:.1} | hashfull {}",
            report.best_move.map(square_name).unwrap_or_else(|| "resign".to_string()),
            report.pv.value,
            format_pv(&report.pv.moves),
            report.workers.simulations,
            report.simulations_per_second(),
            report.workers.duplicates,
            report.workers.terminals,
            report.workers.aborted,
            report.dispatch.batches,
            report.dispatch.average_batch(),
            report.hash_fullness
        );
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;
    info!(
        "threads {} batch {} hash {} MiB backends {}",
        config.threads,
        config.dispatch.batch_size,
        config.hash_mb,
        config.backends.len()
    );
    let mate: Option<Arc<dyn MateSearcher<TicTacToe>>> =
        config.search.use_mate_search.then(|| Arc::new(AndOrMateSearcher::default()) as _);
    let engine = SearchEngine::from_config(config, Arc::new(TicTacToeEncoder), mate)
        .context("failed to start the engine")?;
    engine.set_seed(cli.seed);

    if cli.games > 0 {
        for game in 1..=cli.games {
            play_game(&engine, &cli, game)?;
        }
    } else if cli.policy_only {
        let pos = TicTacToe::new();
        for i in 1..=cli.searches {
            let mv = engine.policy_move(&pos, cli.temperature)?;
            println!("policy {i}: {}", mv.map(square_name).unwrap_or_else(|| "resign".to_string()));
        }
    } else {
        if cli.searches == 0 {
            bail!("--searches must be >= 1");
        }
        let pos = TicTacToe::new();
        for i in 1..=cli.searches {
            engine.reset();
            let report = engine.search(&pos, &limits(&cli))?;
            print_report(i, &report, cli.json);
        }
    }

    let stats = engine.stats();
    info!(
        "total batches {} samples {} (avg {:.2})",
        stats.batches,
        stats.samples,
        stats.average_batch()
    );
    engine.shutdown()?;
    Ok(())
}

/// 自己対局。置換表は局面をまたいで使い回す
fn play_game(engine: &SearchEngine<TicTacToe>, cli: &Cli, game: u32) -> Result<()> {
    engine.reset();
    let mut pos = TicTacToe::new();
    let mut record = Vec::new();
    loop {
        let mv = if cli.policy_only {
            engine.policy_move(&pos, cli.temperature)?
        } else {
            engine.search(&pos, &limits(cli))?.best_move
        };
        let Some(mv) = mv else {
            break;
        };
        pos.do_move(mv);
        record.push(mv);
    }
    let result = match pos.winner() {
        Some(stone) => format!("{stone:?} wins"),
        None => "draw".to_string(),
    };
    println!("game {game}: {} ({result})", format_pv(&record));
    Ok(())
}
