//! Benchmark CLI.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use quest_bench::cli;

#[derive(Parser)]
#[command(
    name = "quest-bench",
    version,
    about = "Fan a quests x agents matrix out to a worker pool"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a benchmark described by a YAML config.
    Run {
        /// Benchmark config file.
        #[arg(long)]
        config: PathBuf,
        /// Verbose logging to stderr.
        #[arg(long)]
        debug: bool,
    },
    /// Print aggregated counts for a finished benchmark.
    Report {
        /// Benchmark id (printed by `run`).
        #[arg(long)]
        benchmark_id: String,
        /// SQLite database path.
        #[arg(long, default_value = "metrics.db")]
        db: PathBuf,
    },
}

fn main() {
    if let Err(err) = run() {
        eprintln!("{:#}", err);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run { config, debug } => {
            quest_runner::logging::init(debug);
            cli::run_benchmark(&config)
        }
        Command::Report { benchmark_id, db } => {
            quest_runner::logging::init(false);
            cli::report_benchmark(&db, &benchmark_id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_command() {
        let parsed = Cli::parse_from(["quest-bench", "run", "--config", "bench.yaml"]);
        assert!(matches!(parsed.command, Command::Run { .. }));
    }

    #[test]
    fn parse_report_command() {
        let parsed = Cli::parse_from(["quest-bench", "report", "--benchmark-id", "bench-1"]);
        let Command::Report { benchmark_id, db } = parsed.command else {
            panic!("expected report command");
        };
        assert_eq!(benchmark_id, "bench-1");
        assert_eq!(db, PathBuf::from("metrics.db"));
    }
}
