//! Benchmark scheduler scenarios over scripted pair runs.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::Ordering;

use anyhow::{Result, bail};
use quest_bench::config::BenchmarkConfig;
use quest_bench::matrix::Pair;
use quest_bench::scheduler::{BenchmarkRunner, PairRunner};
use quest_runner::agent::DecisionAgent;
use quest_runner::db::{Database, Outcome};
use quest_runner::engine::GameStatus;
use quest_runner::run::{RunContext, RunReport, execute_run};
use quest_runner::test_support::{
    ScriptedEngine, ScriptedProvider, running_state, scripted_client, terminal_state,
};

/// Runs every pair as a scripted two-step quest whose ending depends on the
/// agent id: `good-*` agents win, everyone else fails.
struct StubPairRunner;

impl PairRunner for StubPairRunner {
    fn run_pair(&self, pair: &Pair, context: RunContext) -> Result<RunReport> {
        let ending = if pair.agent.agent_id.starts_with("good") {
            GameStatus::Win
        } else {
            GameStatus::Fail
        };
        let engine = ScriptedEngine::new(vec![
            running_state("1", "A", &[(10, "x"), (11, "y")]),
            terminal_state("2", ending),
        ]);
        let agent = DecisionAgent::with_client(
            pair.agent.clone(),
            scripted_client(ScriptedProvider::new(vec![Ok(
                ScriptedProvider::text_reply(r#"{"result": 1}"#),
            )])),
        )?;
        execute_run(engine, Ok(agent), context)
    }
}

fn write_quests(dir: &std::path::Path, names: &[&str]) -> Vec<PathBuf> {
    fs::create_dir_all(dir).expect("quest dir");
    names
        .iter()
        .map(|name| {
            let path = dir.join(name);
            fs::write(&path, b"qm").expect("write quest");
            path
        })
        .collect()
}

fn config(quests: Vec<PathBuf>, results_dir: PathBuf) -> BenchmarkConfig {
    let yaml = format!(
        r#"
name: stub-matrix
benchmark_id: bench-test
quests: {quests:?}
agents:
  - {{agent_id: good-agent, model: random_1, skip_single: true}}
  - {{agent_id: bad-agent, model: random_2, skip_single: true}}
quest_timeout: 30
max_workers: 2
results_dir: {results_dir:?}
"#,
        quests = quests
            .iter()
            .map(|path| path.display().to_string())
            .collect::<Vec<_>>(),
        results_dir = results_dir.display().to_string(),
    );
    serde_yaml::from_str(&yaml).expect("config")
}

/// S5: 2 quests x 2 agents with success/failure stubs.
#[test]
fn matrix_aggregation_counts_per_agent() {
    let temp = tempfile::tempdir().expect("tempdir");
    let quests = write_quests(&temp.path().join("quests"), &["a.qm", "b.qm"]);
    let db = Database::open_in_memory().expect("db");
    let runner = BenchmarkRunner::new(config(quests, temp.path().join("results")), db.clone());

    let report = runner.run_with(&StubPairRunner).expect("benchmark");

    assert_eq!(report.summary.total_runs, 4);
    assert_eq!(report.summary.totals.ok, 2);
    assert_eq!(report.summary.totals.fail, 2);

    let good = &report.summary.per_agent["good-agent"];
    assert_eq!((good.ok, good.fail), (2, 0));
    let bad = &report.summary.per_agent["bad-agent"];
    assert_eq!((bad.ok, bad.fail), (0, 2));

    // Run ids in the summary resolve to independently discoverable runs.
    for run in &report.summary.runs {
        let run_id = run.run_id.expect("run id");
        let row = db.get_run(run_id).expect("run row");
        assert_eq!(row.benchmark_id.as_deref(), Some("bench-test"));
    }
    assert!(report.summary_path.exists());

    let progress = runner.progress();
    assert_eq!(progress.total, 4);
    assert_eq!(progress.finished(), 4);
    assert_eq!(progress.running, 0);
    assert!(progress.active.is_empty());
}

/// One pair blowing up does not affect its siblings.
#[test]
fn pair_failure_is_isolated() {
    struct FlakyRunner;
    impl PairRunner for FlakyRunner {
        fn run_pair(&self, pair: &Pair, context: RunContext) -> Result<RunReport> {
            if pair.agent.agent_id == "bad-agent"
                && pair.quest.file_name().is_some_and(|name| name == "a.qm")
            {
                bail!("interpreter missing");
            }
            StubPairRunner.run_pair(pair, context)
        }
    }

    let temp = tempfile::tempdir().expect("tempdir");
    let quests = write_quests(&temp.path().join("quests"), &["a.qm", "b.qm"]);
    let db = Database::open_in_memory().expect("db");
    let runner = BenchmarkRunner::new(config(quests, temp.path().join("results")), db);

    let report = runner.run_with(&FlakyRunner).expect("benchmark");
    assert_eq!(report.summary.total_runs, 4);
    assert_eq!(report.summary.totals.error, 1);
    assert_eq!(report.summary.totals.ok + report.summary.totals.fail, 3);

    let failed: Vec<_> = report
        .summary
        .runs
        .iter()
        .filter(|run| run.outcome == Outcome::Error)
        .collect();
    assert_eq!(failed.len(), 1);
    assert!(failed[0].error.as_deref().unwrap().contains("interpreter missing"));
}

/// A pre-set shutdown flag drains without executing any pairs.
#[test]
fn cancelled_benchmark_runs_nothing() {
    let temp = tempfile::tempdir().expect("tempdir");
    let quests = write_quests(&temp.path().join("quests"), &["a.qm"]);
    let db = Database::open_in_memory().expect("db");
    let runner = BenchmarkRunner::new(config(quests, temp.path().join("results")), db);
    runner.cancel_flag().store(true, Ordering::SeqCst);

    let report = runner.run_with(&StubPairRunner).expect("benchmark");
    assert_eq!(report.summary.total_runs, 0);
}
