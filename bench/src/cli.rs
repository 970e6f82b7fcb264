//! CLI command implementations.

use std::path::Path;

use anyhow::{Context, Result, bail};
use quest_runner::db::Database;
use tracing::info;

use crate::config::BenchmarkConfig;
use crate::scheduler::BenchmarkRunner;
use crate::summary::BenchmarkSummary;

/// Run a benchmark from a YAML config file.
pub fn run_benchmark(config_path: &Path) -> Result<()> {
    let config = BenchmarkConfig::load(config_path).context("load benchmark config")?;
    let db = Database::open(&config.db_path).context("open database")?;
    info!(config = %config_path.display(), "benchmark config loaded");

    let runner = BenchmarkRunner::new(config, db);
    let report = runner.run()?;

    let totals = &report.summary.totals;
    println!(
        "benchmark: id={} runs={} ok={} fail={} timeout={} error={}",
        report.benchmark_id,
        report.summary.total_runs,
        totals.ok,
        totals.fail,
        totals.timeout,
        totals.error
    );
    println!("benchmark: summary={}", report.summary_path.display());
    Ok(())
}

/// Print aggregated counts for a finished benchmark from the database.
pub fn report_benchmark(db_path: &Path, benchmark_id: &str) -> Result<()> {
    let db = Database::open(db_path).context("open database")?;
    let Some(raw) = db.benchmark_summary(benchmark_id)? else {
        bail!("no summary recorded for benchmark {benchmark_id}");
    };
    let summary: BenchmarkSummary =
        serde_json::from_str(&raw).context("parse recorded benchmark summary")?;

    println!(
        "report: benchmark={} runs={}",
        summary.benchmark_id, summary.total_runs
    );
    println!(
        "report: ok={} fail={} timeout={} error={}",
        summary.totals.ok, summary.totals.fail, summary.totals.timeout, summary.totals.error
    );
    for (agent_id, counts) in &summary.per_agent {
        println!(
            "report: agent {} ok={} fail={} timeout={} error={}",
            agent_id, counts.ok, counts.fail, counts.timeout, counts.error
        );
    }
    for (quest, counts) in &summary.per_quest {
        println!(
            "report: quest {} ok={} fail={} timeout={} error={}",
            quest, counts.ok, counts.fail, counts.timeout, counts.error
        );
    }
    Ok(())
}
