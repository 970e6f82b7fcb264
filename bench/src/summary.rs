//! Benchmark aggregation and the benchmark-summary artifact.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use quest_runner::db::Outcome;
use quest_runner::summary::write_json;
use serde::{Deserialize, Serialize};

/// Result of one matrix pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairResult {
    pub quest: String,
    pub agent_id: String,
    /// `None` when the run could not even be created.
    pub run_id: Option<i64>,
    pub outcome: Outcome,
    pub reward: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome counters used for totals and per-agent/per-quest breakdowns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeCounts {
    pub ok: u32,
    pub fail: u32,
    pub timeout: u32,
    pub error: u32,
}

impl OutcomeCounts {
    pub fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Success => self.ok += 1,
            Outcome::Failure => self.fail += 1,
            Outcome::Timeout => self.timeout += 1,
            Outcome::Error => self.error += 1,
        }
    }

    pub fn total(&self) -> u32 {
        self.ok + self.fail + self.timeout + self.error
    }
}

/// The benchmark-summary artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkSummary {
    pub benchmark_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub total_runs: u32,
    pub totals: OutcomeCounts,
    pub per_agent: BTreeMap<String, OutcomeCounts>,
    pub per_quest: BTreeMap<String, OutcomeCounts>,
    pub runs: Vec<PairResult>,
}

/// Aggregate pair results into the summary.
pub fn aggregate(
    benchmark_id: &str,
    name: Option<&str>,
    results: &[PairResult],
) -> BenchmarkSummary {
    let mut totals = OutcomeCounts::default();
    let mut per_agent: BTreeMap<String, OutcomeCounts> = BTreeMap::new();
    let mut per_quest: BTreeMap<String, OutcomeCounts> = BTreeMap::new();
    for result in results {
        totals.record(result.outcome);
        per_agent
            .entry(result.agent_id.clone())
            .or_default()
            .record(result.outcome);
        per_quest
            .entry(result.quest.clone())
            .or_default()
            .record(result.outcome);
    }
    BenchmarkSummary {
        benchmark_id: benchmark_id.to_string(),
        name: name.map(str::to_string),
        total_runs: totals.total(),
        totals,
        per_agent,
        per_quest,
        runs: results.to_vec(),
    }
}

/// Artifact path: `results/benchmarks/<benchmark_id>/benchmark_summary.json`.
pub fn summary_path(results_dir: &Path, benchmark_id: &str) -> PathBuf {
    results_dir
        .join("benchmarks")
        .join(benchmark_id)
        .join("benchmark_summary.json")
}

/// Write the artifact atomically and return its path.
pub fn write_benchmark_summary(
    results_dir: &Path,
    summary: &BenchmarkSummary,
) -> Result<PathBuf> {
    let path = summary_path(results_dir, &summary.benchmark_id);
    write_json(&path, summary)?;
    Ok(path)
}
