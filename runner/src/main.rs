//! Quest runner CLI.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use quest_runner::config::{AgentConfig, load_runner_config};
use quest_runner::llm::pricing::PriceTable;
use quest_runner::run::{RunContext, run_quest};
use quest_runner::{exit_codes, logging};

#[derive(Parser)]
#[command(
    name = "quest-runner",
    version,
    about = "Run decision agents through binary quest playthroughs"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one quest with one agent and exit with the outcome code
    /// (0 success, 1 failure, 2 timeout, 3 error).
    Run {
        /// Path to the `.qm` quest file.
        #[arg(long)]
        quest: PathBuf,
        /// Agent config TOML path or a built-in id (`random`,
        /// `random_<seed>`, `default`).
        #[arg(long)]
        agent: String,
        /// Wall-clock timeout for the run in seconds.
        #[arg(long)]
        timeout: Option<u64>,
        /// Runner config TOML (engine command, limits).
        #[arg(long)]
        config: Option<PathBuf>,
        /// SQLite database path.
        #[arg(long, default_value = "metrics.db")]
        db: PathBuf,
        /// Directory for run-summary artifacts.
        #[arg(long, default_value = "results")]
        results: PathBuf,
        /// Verbose logging to stderr.
        #[arg(long)]
        debug: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::ERROR);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Run {
            quest,
            agent,
            timeout,
            config,
            db,
            results,
            debug,
        } => {
            logging::init(debug);
            if !quest.exists() {
                bail!("quest file {} not found", quest.display());
            }

            let mut runner_config = match &config {
                Some(path) => load_runner_config(path)?,
                None => load_runner_config(&PathBuf::from("runner.toml"))?,
            };
            if let Some(timeout) = timeout {
                runner_config.run_timeout_secs = timeout;
                runner_config.validate()?;
            }

            let agent_config = AgentConfig::resolve(&agent)?;
            let database = quest_runner::db::Database::open(&db)?;
            let prices = Arc::new(PriceTable::from_env().context("build price table")?);

            let report = run_quest(
                agent_config,
                RunContext {
                    quest_path: quest.clone(),
                    runner_config,
                    db: database,
                    results_dir: results,
                    benchmark_id: None,
                    cancel: Arc::new(AtomicBool::new(false)),
                },
                prices,
            )?;

            println!(
                "run: id={} outcome={} reward={} steps={}",
                report.run_id, report.outcome, report.reward, report.steps
            );
            if let Some(path) = &report.summary_path {
                println!("run: summary={}", path.display());
            }
            Ok(exit_codes::from_outcome(report.outcome))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_command() {
        let cli = Cli::parse_from([
            "quest-runner",
            "run",
            "--quest",
            "quests/boat.qm",
            "--agent",
            "random",
            "--timeout",
            "30",
        ]);
        let Command::Run {
            quest,
            agent,
            timeout,
            debug,
            ..
        } = cli.command;
        assert_eq!(quest, PathBuf::from("quests/boat.qm"));
        assert_eq!(agent, "random");
        assert_eq!(timeout, Some(30));
        assert!(!debug);
    }
}
