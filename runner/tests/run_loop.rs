//! End-to-end run loop scenarios over scripted engines and providers.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use quest_runner::agent::DecisionAgent;
use quest_runner::config::{AgentConfig, RunnerConfig};
use quest_runner::db::{Database, EndReason, Outcome};
use quest_runner::engine::GameStatus;
use quest_runner::llm::LlmError;
use quest_runner::llm::pricing::PriceTable;
use quest_runner::run::{RunContext, RunReport, execute_run};
use quest_runner::summary::read_run_summary;
use quest_runner::test_support::{
    ScriptedEngine, ScriptedProvider, running_state, scripted_client, terminal_state,
};

fn context(db: &Database, results: &std::path::Path) -> RunContext {
    RunContext {
        quest_path: PathBuf::from("quests/boat.qm"),
        runner_config: RunnerConfig::default(),
        db: db.clone(),
        results_dir: results.to_path_buf(),
        benchmark_id: None,
        cancel: Arc::new(AtomicBool::new(false)),
    }
}

fn agent_with_replies(
    replies: Vec<Result<quest_runner::llm::provider::ProviderReply, LlmError>>,
) -> DecisionAgent {
    let config = AgentConfig::resolve("default").expect("config");
    DecisionAgent::with_client(config, scripted_client(ScriptedProvider::new(replies)))
        .expect("agent")
}

fn three_state_quest() -> Vec<quest_runner::engine::QuestState> {
    vec![
        running_state("1", "A", &[(10, "x"), (11, "y")]),
        running_state("2", "B", &[(20, "z")]),
        terminal_state("3", GameStatus::Win),
    ]
}

/// S1: success path with deterministic choices.
#[test]
fn success_path_records_three_steps() {
    let temp = tempfile::tempdir().expect("tempdir");
    let db = Database::open_in_memory().expect("db");
    let engine = ScriptedEngine::new(three_state_quest());
    let jumps = engine.jumps();
    let closed = engine.closed_flag();
    let agent = agent_with_replies(vec![
        Ok(ScriptedProvider::text_reply(r#"{"result": 1}"#)),
        Ok(ScriptedProvider::text_reply(r#"{"result": 1}"#)),
    ]);

    let report = execute_run(engine, Ok(agent), context(&db, temp.path())).expect("run");

    assert_eq!(report.outcome, Outcome::Success);
    assert_eq!(report.reward, 1.0);
    assert_eq!(report.end_reason, EndReason::QuestSuccess);
    assert_eq!(report.steps, 3);

    let steps = db.steps_for_run(report.run_id).expect("steps");
    let numbers: Vec<u32> = steps.iter().map(|step| step.step_number).collect();
    assert_eq!(numbers, vec![1, 2, 3]);
    let actions: Vec<Option<u32>> = steps.iter().map(|step| step.action).collect();
    assert_eq!(actions, vec![None, Some(1), Some(1)]);
    assert_eq!(*jumps.lock().expect("jumps"), vec![10, 20]);
    assert!(*closed.lock().expect("closed"));

    // Exactly one terminal outcome with a non-null end time.
    let run = db.get_run(report.run_id).expect("run row");
    assert_eq!(run.outcome, Some(Outcome::Success));
    assert!(run.end_time.is_some());
    assert_eq!(run.reward, Some(1.0));
}

/// S2: a hung engine trips the watchdog; the loop's late write is a no-op.
#[test]
fn timeout_is_first_write_wins() {
    let temp = tempfile::tempdir().expect("tempdir");
    let db = Database::open_in_memory().expect("db");
    let engine =
        ScriptedEngine::new(three_state_quest()).with_delay(Duration::from_millis(2500));
    let agent = agent_with_replies(vec![Ok(ScriptedProvider::text_reply(r#"{"result": 1}"#))]);

    let mut ctx = context(&db, temp.path());
    ctx.runner_config.run_timeout_secs = 1;

    let report = execute_run(engine, Ok(agent), ctx).expect("run");
    assert_eq!(report.outcome, Outcome::Timeout);
    assert_eq!(report.end_reason, EndReason::Timeout);

    // A subsequent FAILURE write attempt must not change the outcome.
    let won = db
        .commit_outcome(report.run_id, Outcome::Failure, 0.0)
        .expect("commit");
    assert!(!won);
    let run = db.get_run(report.run_id).expect("run row");
    assert_eq!(run.outcome, Some(Outcome::Timeout));

    let events = db.events_for_run(report.run_id).expect("events");
    assert!(events.iter().any(|event| event.kind == "timeout"));
}

/// S4: a state loop flips the agent to the rotated alternative.
#[test]
fn loop_escape_is_visible_in_step_rows() {
    let temp = tempfile::tempdir().expect("tempdir");
    let db = Database::open_in_memory().expect("db");
    let same = running_state("same", "Nothing changes.", &[(10, "a"), (11, "b")]);
    let engine = ScriptedEngine::new(vec![same; 7]);
    let replies = (0..10)
        .map(|_| Ok(ScriptedProvider::text_reply(r#"{"result": 1}"#)))
        .collect();
    let agent = agent_with_replies(replies);

    let mut ctx = context(&db, temp.path());
    ctx.runner_config.max_steps = 5;

    let report = execute_run(engine, Ok(agent), ctx).expect("run");
    // Never terminal: the step cap converts the run into a failure.
    assert_eq!(report.outcome, Outcome::Failure);

    let steps = db.steps_for_run(report.run_id).expect("steps");
    let actions: Vec<Option<u32>> = steps.iter().map(|step| step.action).collect();
    assert_eq!(
        actions,
        vec![None, Some(1), Some(1), Some(2), Some(2), Some(2)]
    );
    for step in &steps[3..] {
        let decision = step.llm_decision.as_deref().expect("decision");
        assert!(decision.contains("loop_escape"), "decision: {decision}");
    }
}

/// S6: degenerate first reply, valid second reply, no fallback.
#[test]
fn degenerate_content_retries_within_the_step() {
    let temp = tempfile::tempdir().expect("tempdir");
    let db = Database::open_in_memory().expect("db");
    let engine = ScriptedEngine::new(vec![
        running_state("1", "A", &[(10, "x"), (11, "y")]),
        terminal_state("2", GameStatus::Win),
    ]);
    let agent = agent_with_replies(vec![
        Ok(quest_runner::llm::provider::ProviderReply {
            content: None,
            usage: None,
            finish_reason: Some("stop".to_string()),
        }),
        Ok(ScriptedProvider::text_reply(r#"{"result": 2}"#)),
    ]);

    let report = execute_run(engine, Ok(agent), context(&db, temp.path())).expect("run");
    assert_eq!(report.outcome, Outcome::Success);

    let steps = db.steps_for_run(report.run_id).expect("steps");
    assert_eq!(steps[1].action, Some(2));
    let decision = steps[1].llm_decision.as_deref().expect("decision");
    assert!(!decision.contains("is_default"), "decision: {decision}");
}

/// Terminal on the very first transition writes exactly two step rows.
#[test]
fn instant_terminal_writes_two_rows() {
    let temp = tempfile::tempdir().expect("tempdir");
    let db = Database::open_in_memory().expect("db");
    let engine = ScriptedEngine::new(vec![
        running_state("1", "A", &[(10, "only way")]),
        terminal_state("2", GameStatus::Fail),
    ]);
    let agent = agent_with_replies(vec![Ok(ScriptedProvider::text_reply(r#"{"result": 1}"#))]);

    let report = execute_run(engine, Ok(agent), context(&db, temp.path())).expect("run");
    assert_eq!(report.outcome, Outcome::Failure);
    assert_eq!(report.steps, 2);
}

/// An LLM that always yields empty content produces fallback-1 steps with
/// consistent error markers, never a crash.
#[test]
fn empty_llm_content_falls_back_every_step() {
    let temp = tempfile::tempdir().expect("tempdir");
    let db = Database::open_in_memory().expect("db");
    let engine = ScriptedEngine::new(vec![
        running_state("1", "A", &[(10, "x"), (11, "y")]),
        running_state("2", "B", &[(20, "z"), (21, "w")]),
        terminal_state("3", GameStatus::Fail),
    ]);
    let replies = (0..8)
        .map(|_| Ok(ScriptedProvider::text_reply("")))
        .collect();
    let agent = agent_with_replies(replies);

    let report = execute_run(engine, Ok(agent), context(&db, temp.path())).expect("run");
    assert_eq!(report.outcome, Outcome::Failure);

    let steps = db.steps_for_run(report.run_id).expect("steps");
    for step in &steps[1..] {
        assert_eq!(step.action, Some(1));
        let decision = step.llm_decision.as_deref().expect("decision");
        assert!(decision.contains("parse_error"), "decision: {decision}");
    }
}

/// Pre-set cancellation commits ERROR with cause "cancelled".
#[test]
fn cancellation_commits_error() {
    let temp = tempfile::tempdir().expect("tempdir");
    let db = Database::open_in_memory().expect("db");
    let engine = ScriptedEngine::new(three_state_quest());
    let agent = agent_with_replies(vec![Ok(ScriptedProvider::text_reply(r#"{"result": 1}"#))]);

    let ctx = context(&db, temp.path());
    ctx.cancel.store(true, std::sync::atomic::Ordering::SeqCst);

    let report = execute_run(engine, Ok(agent), ctx).expect("run");
    assert_eq!(report.outcome, Outcome::Error);
    assert_eq!(report.end_reason, EndReason::Cancelled);
}

/// Invariant 6: a seeded random_local agent replays identically.
#[test]
fn seeded_random_agent_is_reproducible() {
    fn run_once(temp: &std::path::Path) -> (RunReport, Vec<Option<u32>>) {
        let db = Database::open_in_memory().expect("db");
        let engine = ScriptedEngine::new(vec![
            running_state("1", "A", &[(10, "x"), (11, "y"), (12, "z")]),
            running_state("2", "B", &[(20, "p"), (21, "q")]),
            running_state("3", "C", &[(30, "r"), (31, "s")]),
            terminal_state("4", GameStatus::Win),
        ]);
        let config = AgentConfig::resolve("random_7").expect("config");
        let agent = DecisionAgent::new(config, Arc::new(PriceTable::builtin()));
        let report = execute_run(engine, agent, context(&db, temp)).expect("run");
        let actions = db
            .steps_for_run(report.run_id)
            .expect("steps")
            .iter()
            .map(|step| step.action)
            .collect();
        (report, actions)
    }

    let temp = tempfile::tempdir().expect("tempdir");
    let (report_a, actions_a) = run_once(temp.path());
    let (report_b, actions_b) = run_once(temp.path());
    assert_eq!(actions_a, actions_b);
    assert_eq!(report_a.outcome, report_b.outcome);
}

/// The run summary reproduces persisted usage totals (invariant 4).
#[test]
fn run_summary_matches_database() {
    let temp = tempfile::tempdir().expect("tempdir");
    let db = Database::open_in_memory().expect("db");
    let engine = ScriptedEngine::new(three_state_quest());
    let mut reply = ScriptedProvider::text_reply(r#"{"result": 1}"#);
    reply.usage = Some(quest_runner::llm::Usage {
        prompt_tokens: 100,
        completion_tokens: 10,
        total_tokens: 110,
    });
    let agent = agent_with_replies(vec![reply.clone(), reply].into_iter().map(Ok).collect());

    let report = execute_run(engine, Ok(agent), context(&db, temp.path())).expect("run");
    let summary_path = report.summary_path.expect("summary path");
    let summary = read_run_summary(&summary_path).expect("summary");

    assert_eq!(summary.run_id, report.run_id);
    assert_eq!(summary.steps.len(), 3);
    assert_eq!(summary.usage.total_tokens, 220);
    let per_step: u64 = summary.steps.iter().map(|step| step.total_tokens).sum();
    assert_eq!(summary.usage.total_tokens, per_step);
    assert_eq!(summary.end_reason, EndReason::QuestSuccess);
}
