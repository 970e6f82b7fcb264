//! Run loop: drives one agent through one quest.
//!
//! The loop itself checks its wall-clock deadline between steps; a watchdog
//! on the calling thread covers the cases where the loop is blocked inside a
//! bridge read or an LLM call. Both commit through the guarded outcome
//! update, so whichever writer is first wins and the loser's write is a
//! no-op.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{RecvTimeoutError, channel};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use anyhow::{Context, Result};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::agent::DecisionAgent;
use crate::config::{AgentConfig, RunnerConfig};
use crate::db::{Database, EndReason, EventKind, Outcome, StepRow};
use crate::engine::bridge::{BridgeConfig, EngineBridge};
use crate::engine::{GameStatus, QuestEngine};
use crate::env::QuestEnv;
use crate::llm::pricing::PriceTable;
use crate::summary::write_run_summary;

/// Everything a run needs besides its engine and agent.
pub struct RunContext {
    pub quest_path: PathBuf,
    pub runner_config: RunnerConfig,
    pub db: Database,
    pub results_dir: PathBuf,
    pub benchmark_id: Option<String>,
    /// Shared shutdown flag; honored between steps.
    pub cancel: Arc<AtomicBool>,
}

/// Result of one completed run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub run_id: i64,
    pub outcome: Outcome,
    pub reward: f64,
    pub end_reason: EndReason,
    /// Step rows written (initial state included).
    pub steps: u32,
    pub summary_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy)]
struct LoopResult {
    outcome: Outcome,
    end_reason: EndReason,
    reward: f64,
    steps: u32,
}

/// Build the production bridge and agent and execute a run.
pub fn run_quest(
    agent_config: AgentConfig,
    context: RunContext,
    prices: Arc<PriceTable>,
) -> Result<RunReport> {
    let bridge_config =
        BridgeConfig::from_runner_config(&context.runner_config, context.quest_path.clone());
    let engine = EngineBridge::new(bridge_config);
    let agent = DecisionAgent::new(agent_config, prices);
    execute_run(engine, agent, context)
}

/// Execute one run over an explicit engine and agent construction result.
///
/// The run record is created before anything can fail, so even agent
/// construction errors leave a discoverable ERROR row behind.
#[instrument(skip_all, fields(quest = %context.quest_path.display()))]
pub fn execute_run<E: QuestEngine + Send>(
    engine: E,
    agent: Result<DecisionAgent>,
    context: RunContext,
) -> Result<RunReport> {
    let quest_name = context
        .quest_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| context.quest_path.display().to_string());

    let (agent_id, agent_config_json) = match &agent {
        Ok(agent) => (
            agent.config().agent_id.clone(),
            serde_json::to_string(agent.config()).context("serialize agent config")?,
        ),
        Err(_) => ("unknown".to_string(), "{}".to_string()),
    };

    let run_id = context.db.create_run(
        &quest_name,
        &agent_id,
        &agent_config_json,
        context.benchmark_id.as_deref(),
    )?;
    info!(run_id, agent = %agent_id, "run created");

    let mut agent = match agent {
        Ok(agent) => agent,
        Err(err) => {
            warn!(run_id, %err, "agent construction failed");
            context.db.commit_outcome(run_id, Outcome::Error, 0.0)?;
            context.db.append_event(
                run_id,
                EventKind::Error,
                Some(&json!({"cause": err.to_string()}).to_string()),
            )?;
            let summary_path = write_run_summary(
                &context.results_dir,
                &context.db,
                run_id,
                &context.quest_path,
                EndReason::LlmError,
            )
            .ok();
            return Ok(RunReport {
                run_id,
                outcome: Outcome::Error,
                reward: 0.0,
                end_reason: EndReason::LlmError,
                steps: 0,
                summary_path,
            });
        }
    };

    let deadline = Instant::now() + context.runner_config.run_timeout();
    let (result_tx, result_rx) = channel::<LoopResult>();
    let mut end_reason = EndReason::Timeout;

    thread::scope(|scope| -> Result<()> {
        let db = context.db.clone();
        let cancel = Arc::clone(&context.cancel);
        let runner_config = &context.runner_config;
        scope.spawn(move || {
            let result = run_loop(run_id, engine, &mut agent, runner_config, &db, &cancel, deadline);
            let _ = result_tx.send(result);
        });

        match result_rx.recv_timeout(context.runner_config.run_timeout()) {
            Ok(result) => {
                end_reason = result.end_reason;
                Ok(())
            }
            Err(RecvTimeoutError::Timeout) => {
                // Watchdog: the loop is stuck inside a bounded read or call.
                // Commit TIMEOUT now; the loop's own late commit is a no-op.
                let won = context.db.commit_outcome(run_id, Outcome::Timeout, 0.0)?;
                context.db.append_event(
                    run_id,
                    EventKind::Timeout,
                    Some(
                        &json!({
                            "timeout_secs": context.runner_config.run_timeout_secs,
                            "by": "watchdog",
                        })
                        .to_string(),
                    ),
                )?;
                warn!(run_id, won, "watchdog committed timeout");
                context.cancel.store(true, Ordering::SeqCst);
                // All loop suspension points are time-bounded, so this drains.
                if let Ok(result) = result_rx.recv() {
                    debug!(run_id, late_outcome = %result.outcome, "late loop result discarded");
                }
                end_reason = EndReason::Timeout;
                Ok(())
            }
            Err(RecvTimeoutError::Disconnected) => {
                context.db.commit_outcome(run_id, Outcome::Error, 0.0)?;
                context.db.append_event(
                    run_id,
                    EventKind::Error,
                    Some(&json!({"cause": "run worker died"}).to_string()),
                )?;
                end_reason = EndReason::BridgeError;
                Ok(())
            }
        }
    })?;

    let run = context.db.get_run(run_id)?;
    let outcome = run.outcome.unwrap_or(Outcome::Error);
    let steps = context.db.steps_for_run(run_id)?.len() as u32;
    let summary_path = write_run_summary(
        &context.results_dir,
        &context.db,
        run_id,
        &context.quest_path,
        end_reason,
    )?;
    info!(run_id, %outcome, steps, "run finished");

    Ok(RunReport {
        run_id,
        outcome,
        reward: run.reward.unwrap_or(0.0),
        end_reason,
        steps,
        summary_path: Some(summary_path),
    })
}

/// The stepping loop. Never panics the worker on quest or LLM failures: all
/// failure paths are converted into guarded outcome commits, and the engine
/// is closed on every exit path.
fn run_loop<E: QuestEngine>(
    run_id: i64,
    engine: E,
    agent: &mut DecisionAgent,
    runner_config: &RunnerConfig,
    db: &Database,
    cancel: &AtomicBool,
    deadline: Instant,
) -> LoopResult {
    let mut env = QuestEnv::new(engine);
    let result = stepping(run_id, &mut env, agent, runner_config, db, cancel, deadline);
    env.close();

    let (outcome, end_reason, reward, steps, cause) = match result {
        Ok((result, steps)) => (result.outcome, result.end_reason, result.reward, steps, None),
        Err(failure) => {
            let (end_reason, cause) = classify_failure(&failure);
            (Outcome::Error, end_reason, 0.0, failure.steps, Some(cause))
        }
    };

    match db.commit_outcome(run_id, outcome, reward) {
        Ok(true) => {
            let payload = json!({
                "outcome": outcome.as_str(),
                "end_reason": end_reason,
                "reward": reward,
                "cause": cause,
            });
            let kind = if outcome == Outcome::Error {
                EventKind::Error
            } else {
                EventKind::Outcome
            };
            if let Err(err) = db.append_event(run_id, kind, Some(&payload.to_string())) {
                warn!(run_id, %err, "outcome event write failed");
            }
        }
        Ok(false) => debug!(run_id, "outcome already committed by another writer"),
        Err(err) => warn!(run_id, %err, "outcome commit failed"),
    }

    LoopResult {
        outcome,
        end_reason,
        reward,
        steps,
    }
}

struct LoopFailure {
    error: anyhow::Error,
    steps: u32,
}

#[derive(Debug, Clone, Copy)]
struct LoopEnd {
    outcome: Outcome,
    end_reason: EndReason,
    reward: f64,
}

fn stepping<E: QuestEngine>(
    run_id: i64,
    env: &mut QuestEnv<E>,
    agent: &mut DecisionAgent,
    runner_config: &RunnerConfig,
    db: &Database,
    cancel: &AtomicBool,
    deadline: Instant,
) -> Result<(LoopEnd, u32), LoopFailure> {
    let mut steps_written = 0u32;
    let fail = |error: anyhow::Error, steps: u32| LoopFailure { error, steps };

    let mut observation = env
        .reset()
        .map_err(|error| fail(error, steps_written))?;

    write_step(
        db,
        run_id,
        StepRow {
            step_number: 1,
            location_id: observation.location_id.clone(),
            observation: observation.render(),
            choices: choices_json(&observation.choices_rendered),
            action: None,
            reward: 0.0,
            llm_decision: None,
            prompt_tokens: 0,
            completion_tokens: 0,
            total_tokens: 0,
            cost_usd: 0.0,
            metadata: None,
        },
    )
    .map_err(|error| fail(error, steps_written))?;
    steps_written = 1;

    // Quests can begin on a terminal node (bad file or instant loss).
    if env.is_terminal() {
        let game_state = env
            .current_state()
            .map(|state| state.game_state)
            .unwrap_or(GameStatus::Fail);
        let reward = if game_state == GameStatus::Win { 1.0 } else { 0.0 };
        return Ok((terminal_end(game_state, reward), steps_written));
    }

    let mut step_count = 0u32;
    while step_count < runner_config.max_steps {
        if cancel.load(Ordering::SeqCst) {
            return Ok((
                LoopEnd {
                    outcome: Outcome::Error,
                    end_reason: EndReason::Cancelled,
                    reward: 0.0,
                },
                steps_written,
            ));
        }
        if Instant::now() >= deadline {
            return Ok((
                LoopEnd {
                    outcome: Outcome::Timeout,
                    end_reason: EndReason::Timeout,
                    reward: 0.0,
                },
                steps_written,
            ));
        }

        let decision = if agent.config().skip_single && observation.choice_map.len() == 1 {
            agent.auto_select(&observation)
        } else {
            let remaining = deadline.saturating_duration_since(Instant::now());
            agent.decide(&observation, runner_config.step_timeout().min(remaining))
        };

        let (next_observation, info) = env
            .step(decision.action)
            .map_err(|error| fail(error, steps_written))?;
        step_count += 1;

        let llm_decision = serde_json::to_string(&decision.llm).ok();
        write_step(
            db,
            run_id,
            StepRow {
                step_number: step_count + 1,
                location_id: next_observation.location_id.clone(),
                observation: next_observation.render(),
                choices: choices_json(&next_observation.choices_rendered),
                action: Some(decision.action as u32),
                reward: info.reward,
                llm_decision,
                prompt_tokens: decision.usage.prompt_tokens,
                completion_tokens: decision.usage.completion_tokens,
                total_tokens: decision.usage.total_tokens,
                cost_usd: decision.cost_usd,
                metadata: None,
            },
        )
        .map_err(|error| fail(error, steps_written))?;
        steps_written += 1;

        let payload = json!({
            "step_number": step_count + 1,
            "location_id": next_observation.location_id,
            "action": decision.action,
            "done": info.done,
        });
        if let Err(err) = db.append_event(run_id, EventKind::Step, Some(&payload.to_string())) {
            warn!(run_id, %err, "step event write failed");
        }

        if info.done {
            return Ok((terminal_end(info.game_state, info.reward), steps_written));
        }
        observation = next_observation;
    }

    // Step budget exhausted without reaching a terminal node.
    debug!(run_id, max_steps = runner_config.max_steps, "step cap reached");
    Ok((
        LoopEnd {
            outcome: Outcome::Failure,
            end_reason: EndReason::QuestFailure,
            reward: 0.0,
        },
        steps_written,
    ))
}

fn terminal_end(game_state: GameStatus, reward: f64) -> LoopEnd {
    match game_state {
        GameStatus::Win => LoopEnd {
            outcome: Outcome::Success,
            end_reason: EndReason::QuestSuccess,
            reward,
        },
        _ => LoopEnd {
            outcome: Outcome::Failure,
            end_reason: EndReason::QuestFailure,
            reward,
        },
    }
}

fn classify_failure(failure: &LoopFailure) -> (EndReason, String) {
    // LLM failures never abort the loop (the agent falls back), so anything
    // fatal here is the bridge or the persistence under it.
    (EndReason::BridgeError, format!("{:#}", failure.error))
}

fn write_step(db: &Database, run_id: i64, step: StepRow) -> Result<()> {
    db.insert_step(run_id, &step)
}

fn choices_json(choices: &[String]) -> String {
    serde_json::to_string(choices).unwrap_or_else(|_| "[]".to_string())
}
