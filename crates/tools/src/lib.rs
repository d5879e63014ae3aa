//! mcts_bench / dnn_forwarder の共通処理

use std::io::Write;

/// stderr へのロガーを初期化する（`RUST_LOG` が優先）
pub fn init_logging(debug: bool) {
    let level = if debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, level))
        .format(|buf, record| writeln!(buf, "[{}] {}: {}", record.level(), record.target(), record.args()))
        .write_style(env_logger::WriteStyle::Never)
        .target(env_logger::Target::Stderr)
        .init();
}

/// 三目並べの指し手をマス表記（a1..c3）にする
pub fn square_name(mv: u8) -> String {
    let file = (b'a' + mv % 3) as char;
    let rank = mv / 3 + 1;
    format!("{file}{rank}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_square_name() {
        assert_eq!(square_name(0), "a1");
        assert_eq!(square_name(4), "b2");
        assert_eq!(square_name(8), "c3");
    }
}
