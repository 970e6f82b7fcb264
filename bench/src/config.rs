//! Benchmark configuration (YAML).
//!
//! A benchmark file names the quests (files or directories), the agent
//! configurations to multiply them by, and the scheduling limits.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use quest_runner::config::{AgentConfig, RunnerConfig};
use serde::{Deserialize, Serialize};

/// Parsed benchmark configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BenchmarkConfig {
    /// Human-readable benchmark name.
    #[serde(default)]
    pub name: Option<String>,
    /// Stable id; generated from the clock when absent.
    #[serde(default)]
    pub benchmark_id: Option<String>,
    /// Quest files or directories (directories expand to all `.qm` below).
    pub quests: Vec<PathBuf>,
    /// Agent configurations, multiplied against the quests.
    pub agents: Vec<AgentConfig>,
    /// Per-run wall-clock timeout in seconds.
    #[serde(default = "default_quest_timeout")]
    pub quest_timeout: u64,
    /// Worker pool size.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// SQLite database path.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Artifact directory.
    #[serde(default = "default_results_dir")]
    pub results_dir: PathBuf,
    /// Runner tunables shared by every run (engine command, read budgets).
    #[serde(default)]
    pub runner: RunnerConfig,
}

fn default_quest_timeout() -> u64 {
    120
}

fn default_max_workers() -> usize {
    4
}

fn default_db_path() -> PathBuf {
    PathBuf::from("metrics.db")
}

fn default_results_dir() -> PathBuf {
    PathBuf::from("results")
}

impl BenchmarkConfig {
    /// Load and validate a benchmark config from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents =
            fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
        let config: BenchmarkConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("parse config {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("validate config {}", path.display()))?;
        Ok(config)
    }

    #[cfg(test)]
    pub fn parse_str(contents: &str) -> Result<Self> {
        let config: BenchmarkConfig = serde_yaml::from_str(contents).context("parse config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.quests.is_empty() {
            bail!("quests must be a non-empty list");
        }
        if self.agents.is_empty() {
            bail!("agents must be a non-empty list");
        }
        if self.quest_timeout == 0 {
            bail!("quest_timeout must be > 0");
        }
        if self.max_workers == 0 {
            bail!("max_workers must be > 0");
        }
        for (index, agent) in self.agents.iter().enumerate() {
            agent
                .validate()
                .with_context(|| format!("agents[{index}] invalid"))?;
        }
        let mut ids: Vec<&str> = self.agents.iter().map(|a| a.agent_id.as_str()).collect();
        ids.sort_unstable();
        for pair in ids.windows(2) {
            if pair[0] == pair[1] {
                bail!("duplicate agent_id {}", pair[0]);
            }
        }
        self.runner.validate().context("runner section invalid")?;
        Ok(())
    }

    /// The runner config for one run: shared tunables with the benchmark's
    /// per-run timeout applied.
    pub fn runner_config(&self) -> RunnerConfig {
        let mut runner = self.runner.clone();
        runner.run_timeout_secs = self.quest_timeout;
        runner
    }
}
