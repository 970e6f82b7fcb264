//! Bounded worker pool over the benchmark matrix.
//!
//! Workers pull pairs from a shared queue; each pair runs as one fully
//! independent quest run. A pair's failure is recorded and never rethrown,
//! so siblings keep draining the queue.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use quest_runner::db::Database;
use quest_runner::llm::pricing::PriceTable;
use quest_runner::run::{RunContext, RunReport, run_quest};
use tracing::{error, info, instrument, warn};

use crate::config::BenchmarkConfig;
use crate::matrix::{Pair, expand_pairs, resolve_quests};
use crate::summary::{BenchmarkSummary, PairResult, aggregate, write_benchmark_summary};

/// Upper bound for the derived benchmark budget (two hours).
const MAX_BENCHMARK_BUDGET_SECS: u64 = 7_200;
/// Safety factor over the ideal batch schedule.
const BUDGET_SAFETY_FACTOR: f64 = 1.5;

/// Executes one matrix pair. The production implementation spawns the real
/// interpreter; tests substitute scripted runs.
pub trait PairRunner: Sync {
    fn run_pair(&self, pair: &Pair, context: RunContext) -> Result<RunReport>;
}

/// Production pair runner backed by [`run_quest`].
pub struct QuestPairRunner {
    prices: Arc<PriceTable>,
}

impl QuestPairRunner {
    pub fn new(prices: Arc<PriceTable>) -> Self {
        Self { prices }
    }
}

impl PairRunner for QuestPairRunner {
    fn run_pair(&self, pair: &Pair, context: RunContext) -> Result<RunReport> {
        run_quest(pair.agent.clone(), context, Arc::clone(&self.prices))
    }
}

/// Scheduler counters, exposed to observers as a snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Progress {
    pub total: u32,
    pub running: u32,
    pub completed: u32,
    pub failed: u32,
    pub timeout: u32,
    pub error: u32,
    /// Labels of the currently active pairs.
    pub active: Vec<String>,
}

impl Progress {
    pub fn finished(&self) -> u32 {
        self.completed + self.failed + self.timeout + self.error
    }
}

/// Result of a completed benchmark.
#[derive(Debug, Clone)]
pub struct BenchmarkReport {
    pub benchmark_id: String,
    pub summary: BenchmarkSummary,
    pub summary_path: PathBuf,
}

/// Benchmark scheduler: owns the progress counters and the shutdown flag.
pub struct BenchmarkRunner {
    config: BenchmarkConfig,
    db: Database,
    progress: Arc<Mutex<Progress>>,
    cancel: Arc<AtomicBool>,
}

impl BenchmarkRunner {
    pub fn new(config: BenchmarkConfig, db: Database) -> Self {
        Self {
            config,
            db,
            progress: Arc::new(Mutex::new(Progress::default())),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Consistent snapshot of the counters.
    pub fn progress(&self) -> Progress {
        self.progress.lock().expect("progress lock").clone()
    }

    /// Shared flag observed by workers between steps.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Run the benchmark with the production pair runner.
    pub fn run(&self) -> Result<BenchmarkReport> {
        let prices = Arc::new(PriceTable::from_env().context("build price table")?);
        self.run_with(&QuestPairRunner::new(prices))
    }

    /// Run the benchmark with an explicit pair runner.
    #[instrument(skip_all, fields(name = self.config.name.as_deref().unwrap_or("unnamed")))]
    pub fn run_with<R: PairRunner>(&self, runner: &R) -> Result<BenchmarkReport> {
        let benchmark_id = self
            .config
            .benchmark_id
            .clone()
            .unwrap_or_else(|| format!("benchmark_{}", Utc::now().format("%Y%m%d_%H%M%S")));
        let config_json =
            serde_json::to_string(&self.config).context("serialize benchmark config")?;
        self.db.create_benchmark(&benchmark_id, &config_json)?;

        let expanded = resolve_quests(&self.config.quests)
            .map(|quests| expand_pairs(&quests, &self.config.agents));
        let pairs = match expanded {
            Ok(pairs) => pairs,
            Err(err) => {
                self.db.set_benchmark_status(&benchmark_id, "error")?;
                return Err(err.context("expand benchmark matrix"));
            }
        };

        let workers = self.config.max_workers.min(pairs.len().max(1));
        let budget = benchmark_budget(pairs.len(), workers, self.config.quest_timeout);
        info!(
            benchmark_id = %benchmark_id,
            pairs = pairs.len(),
            workers,
            budget_secs = budget.as_secs(),
            "benchmark starting"
        );
        {
            let mut progress = self.progress.lock().expect("progress lock");
            progress.total = pairs.len() as u32;
        }
        self.db.set_benchmark_status(&benchmark_id, "running")?;

        let queue: Mutex<VecDeque<Pair>> = Mutex::new(pairs.into());
        let results: Mutex<Vec<PairResult>> = Mutex::new(Vec::new());

        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| self.worker_loop(&benchmark_id, runner, &queue, &results));
            }
        });

        let results = results.into_inner().expect("results lock");
        let summary = aggregate(&benchmark_id, self.config.name.as_deref(), &results);
        let summary_path = write_benchmark_summary(&self.config.results_dir, &summary)?;
        self.db.finish_benchmark(
            &benchmark_id,
            "complete",
            &serde_json::to_string(&summary).context("serialize benchmark summary")?,
        )?;
        info!(
            benchmark_id = %benchmark_id,
            total = summary.total_runs,
            ok = summary.totals.ok,
            "benchmark complete"
        );

        Ok(BenchmarkReport {
            benchmark_id,
            summary,
            summary_path,
        })
    }

    fn worker_loop<R: PairRunner>(
        &self,
        benchmark_id: &str,
        runner: &R,
        queue: &Mutex<VecDeque<Pair>>,
        results: &Mutex<Vec<PairResult>>,
    ) {
        loop {
            if self.cancel.load(Ordering::SeqCst) {
                return;
            }
            let Some(pair) = queue.lock().expect("queue lock").pop_front() else {
                return;
            };
            let label = pair.label();
            {
                let mut progress = self.progress.lock().expect("progress lock");
                progress.running += 1;
                progress.active.push(label.clone());
            }

            let context = RunContext {
                quest_path: pair.quest.clone(),
                runner_config: self.config.runner_config(),
                db: self.db.clone(),
                results_dir: self.config.results_dir.clone(),
                benchmark_id: Some(benchmark_id.to_string()),
                cancel: Arc::clone(&self.cancel),
            };
            let result = match runner.run_pair(&pair, context) {
                Ok(report) => PairResult {
                    quest: pair.quest.display().to_string(),
                    agent_id: pair.agent.agent_id.clone(),
                    run_id: Some(report.run_id),
                    outcome: report.outcome,
                    reward: report.reward,
                    error: None,
                },
                Err(err) => {
                    // Log but never rethrow: one pair must not take its
                    // siblings down.
                    error!(pair = %label, error = %format!("{err:#}"), "pair failed");
                    PairResult {
                        quest: pair.quest.display().to_string(),
                        agent_id: pair.agent.agent_id.clone(),
                        run_id: None,
                        outcome: quest_runner::db::Outcome::Error,
                        reward: 0.0,
                        error: Some(format!("{err:#}")),
                    }
                }
            };

            {
                let mut progress = self.progress.lock().expect("progress lock");
                progress.running = progress.running.saturating_sub(1);
                progress.active.retain(|active| active != &label);
                match result.outcome {
                    quest_runner::db::Outcome::Success => progress.completed += 1,
                    quest_runner::db::Outcome::Failure => progress.failed += 1,
                    quest_runner::db::Outcome::Timeout => progress.timeout += 1,
                    quest_runner::db::Outcome::Error => progress.error += 1,
                }
            }
            if result.outcome == quest_runner::db::Outcome::Timeout {
                warn!(pair = %label, "pair timed out");
            }
            results.lock().expect("results lock").push(result);
        }
    }
}

/// Overall budget estimate: sequential batches times the per-run timeout,
/// padded by a safety factor and capped at two hours.
pub fn benchmark_budget(pairs: usize, workers: usize, quest_timeout_secs: u64) -> Duration {
    let batches = pairs.div_ceil(workers.max(1)) as f64;
    let padded = batches * quest_timeout_secs as f64 * BUDGET_SAFETY_FACTOR;
    Duration::from_secs((padded.ceil() as u64).min(MAX_BENCHMARK_BUDGET_SECS))
}
