//! Run-summary artifact writer.
//!
//! At the end of every run a self-contained JSON artifact is materialized at
//! `results/<agent_id>/<quest_slug>/run_<id>/run_summary.json`: metadata,
//! the full step trace with decisions, and aggregate token/cost usage.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::db::{Database, EndReason, Outcome, RunRow, StepRow};

/// Aggregate usage block of a run summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageSummary {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub cost_usd: f64,
}

/// One step in the artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryStep {
    pub step_number: u32,
    pub location_id: String,
    pub observation: String,
    pub choices: Value,
    pub action: Option<u32>,
    pub reward: f64,
    pub llm_decision: Option<Value>,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub cost_usd: f64,
}

/// The run-summary artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: i64,
    pub quest_name: String,
    pub agent_id: String,
    pub agent_config: Value,
    pub benchmark_id: Option<String>,
    pub start_time: String,
    pub end_time: Option<String>,
    pub outcome: Option<Outcome>,
    pub reward: Option<f64>,
    pub end_reason: EndReason,
    pub usage: UsageSummary,
    pub steps: Vec<SummaryStep>,
}

/// Filesystem-safe slug for a quest path: the stem, lowercased, with
/// anything outside `[a-z0-9_-]` replaced by `_`.
pub fn quest_slug(quest_path: &Path) -> String {
    let stem = quest_path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "quest".to_string());
    let slug: String = stem
        .to_lowercase()
        .chars()
        .map(|ch| {
            if ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if slug.is_empty() {
        "quest".to_string()
    } else {
        slug
    }
}

/// Directory the summary for this run lands in.
pub fn run_dir(results_dir: &Path, agent_id: &str, quest_slug: &str, run_id: i64) -> PathBuf {
    results_dir
        .join(agent_id)
        .join(quest_slug)
        .join(format!("run_{run_id}"))
}

/// Build the artifact from persisted rows.
pub fn build_summary(run: &RunRow, steps: &[StepRow], end_reason: EndReason) -> RunSummary {
    let mut usage = UsageSummary::default();
    let mut summary_steps = Vec::with_capacity(steps.len());
    for step in steps {
        usage.prompt_tokens += step.prompt_tokens;
        usage.completion_tokens += step.completion_tokens;
        usage.total_tokens += step.total_tokens;
        usage.cost_usd += step.cost_usd;
        summary_steps.push(SummaryStep {
            step_number: step.step_number,
            location_id: step.location_id.clone(),
            observation: step.observation.clone(),
            choices: parse_or_string(&step.choices),
            action: step.action,
            reward: step.reward,
            llm_decision: step
                .llm_decision
                .as_deref()
                .map(parse_or_string),
            prompt_tokens: step.prompt_tokens,
            completion_tokens: step.completion_tokens,
            total_tokens: step.total_tokens,
            cost_usd: step.cost_usd,
        });
    }
    RunSummary {
        run_id: run.run_id,
        quest_name: run.quest_name.clone(),
        agent_id: run.agent_id.clone(),
        agent_config: parse_or_string(&run.agent_config),
        benchmark_id: run.benchmark_id.clone(),
        start_time: run.start_time.clone(),
        end_time: run.end_time.clone(),
        outcome: run.outcome,
        reward: run.reward,
        end_reason,
        usage,
        steps: summary_steps,
    }
}

/// Read persisted rows and write the artifact; returns its path.
pub fn write_run_summary(
    results_dir: &Path,
    db: &Database,
    run_id: i64,
    quest_path: &Path,
    end_reason: EndReason,
) -> Result<PathBuf> {
    let run = db.get_run(run_id)?;
    let steps = db.steps_for_run(run_id)?;
    let summary = build_summary(&run, &steps, end_reason);

    let dir = run_dir(results_dir, &run.agent_id, &quest_slug(quest_path), run_id);
    fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
    let path = dir.join("run_summary.json");
    write_json(&path, &summary)?;
    debug!(path = %path.display(), steps = summary.steps.len(), "run summary written");
    Ok(path)
}

/// Read a finalized artifact back.
pub fn read_run_summary(path: &Path) -> Result<RunSummary> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

fn parse_or_string(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Serialize to pretty JSON atomically (temp file + rename).
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("artifact path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut buf = serde_json::to_string_pretty(value).context("serialize artifact json")?;
    buf.push('\n');
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, &buf).with_context(|| format!("write temp {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    #[test]
    fn quest_slug_sanitizes_names() {
        assert_eq!(quest_slug(Path::new("quests/Boat.qm")), "boat");
        assert_eq!(quest_slug(Path::new("ok-name_2.qm")), "ok-name_2");
        let cyrillic = quest_slug(Path::new("Дорога домой.qm"));
        assert!(!cyrillic.is_empty());
        assert!(cyrillic.chars().all(|ch| ch == '_'));
    }

    #[test]
    fn summary_round_trips_and_aggregates_usage() {
        let temp = tempfile::tempdir().expect("tempdir");
        let db = Database::open_in_memory().expect("db");
        let run_id = db
            .create_run("boat", "random", "{\"agent_id\":\"random\"}", None)
            .expect("run");
        for number in 1..=3u32 {
            db.insert_step(
                run_id,
                &crate::db::StepRow {
                    step_number: number,
                    location_id: "loc".to_string(),
                    observation: "obs".to_string(),
                    choices: "[\"a\"]".to_string(),
                    action: (number > 1).then_some(1),
                    reward: 0.0,
                    llm_decision: Some("{\"result\":1}".to_string()),
                    prompt_tokens: 100,
                    completion_tokens: 20,
                    total_tokens: 120,
                    cost_usd: 0.01,
                    metadata: None,
                },
            )
            .expect("step");
        }
        db.commit_outcome(run_id, Outcome::Success, 1.0)
            .expect("outcome");

        let path = write_run_summary(
            temp.path(),
            &db,
            run_id,
            Path::new("quests/boat.qm"),
            EndReason::QuestSuccess,
        )
        .expect("write");
        assert!(path.ends_with(format!("random/boat/run_{run_id}/run_summary.json")));

        let summary = read_run_summary(&path).expect("read");
        assert_eq!(summary.steps.len(), 3);
        assert_eq!(summary.usage.total_tokens, 360);
        // Aggregate equals the sum of per-step totals.
        let per_step: u64 = summary.steps.iter().map(|step| step.total_tokens).sum();
        assert_eq!(summary.usage.total_tokens, per_step);

        // Re-reading the finalized artifact reproduces the same aggregates.
        let again = read_run_summary(&path).expect("read again");
        assert_eq!(again.usage, summary.usage);
    }
}
