//! SQLite persistence for runs, steps, events, and benchmarks.
//!
//! One connection per process behind a mutex; every write is a short
//! transaction. The outcome commit is the single guarded update that makes
//! outcome writes first-write-wins: a late normal-terminal writer cannot
//! overwrite an already-committed TIMEOUT.

use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Final verdict of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Success,
    Failure,
    Timeout,
    Error,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Success => "SUCCESS",
            Outcome::Failure => "FAILURE",
            Outcome::Timeout => "TIMEOUT",
            Outcome::Error => "ERROR",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "SUCCESS" => Ok(Outcome::Success),
            "FAILURE" => Ok(Outcome::Failure),
            "TIMEOUT" => Ok(Outcome::Timeout),
            "ERROR" => Ok(Outcome::Error),
            other => Err(anyhow!("unknown outcome '{other}'")),
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the run ended, more specific than the outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    QuestSuccess,
    QuestFailure,
    Timeout,
    Cancelled,
    BridgeError,
    LlmError,
}

/// Event kinds on the run timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Step,
    Timeout,
    Outcome,
    Error,
}

impl EventKind {
    fn as_str(self) -> &'static str {
        match self {
            EventKind::Step => "step",
            EventKind::Timeout => "timeout",
            EventKind::Outcome => "outcome",
            EventKind::Error => "error",
        }
    }
}

/// One row of `runs`.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRow {
    pub run_id: i64,
    pub quest_name: String,
    pub agent_id: String,
    pub agent_config: String,
    pub benchmark_id: Option<String>,
    pub start_time: String,
    pub end_time: Option<String>,
    pub outcome: Option<Outcome>,
    pub reward: Option<f64>,
}

/// One row of `steps`, append-only per run.
#[derive(Debug, Clone, PartialEq)]
pub struct StepRow {
    /// 1-based, strictly increasing within a run.
    pub step_number: u32,
    pub location_id: String,
    /// Rendered observation text.
    pub observation: String,
    /// JSON array of choice labels.
    pub choices: String,
    /// 1-based action taken to reach this state; `None` for the initial step.
    pub action: Option<u32>,
    pub reward: f64,
    /// JSON of the agent's structured decision, or `None` for the initial
    /// and auto-skipped steps without a model call.
    pub llm_decision: Option<String>,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub cost_usd: f64,
    pub metadata: Option<String>,
}

/// One row of `run_events`.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRow {
    pub seq: i64,
    pub kind: String,
    pub payload: Option<String>,
    pub created_at: String,
}

/// Shared handle to `metrics.db`.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let conn =
            Connection::open(path).with_context(|| format!("open database {}", path.display()))?;
        Self::init(conn)
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory database")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))
            .context("set busy timeout")?;
        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;
            CREATE TABLE IF NOT EXISTS runs (
                run_id        INTEGER PRIMARY KEY AUTOINCREMENT,
                quest_name    TEXT NOT NULL,
                agent_id      TEXT NOT NULL,
                agent_config  TEXT NOT NULL,
                benchmark_id  TEXT,
                start_time    TEXT NOT NULL,
                end_time      TEXT,
                outcome       TEXT,
                reward        REAL
            );
            CREATE TABLE IF NOT EXISTS steps (
                id                INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id            INTEGER NOT NULL REFERENCES runs(run_id),
                step_number       INTEGER NOT NULL,
                location_id       TEXT NOT NULL,
                observation       TEXT NOT NULL,
                choices           TEXT NOT NULL,
                action            INTEGER,
                reward            REAL NOT NULL DEFAULT 0,
                llm_decision      TEXT,
                prompt_tokens     INTEGER NOT NULL DEFAULT 0,
                completion_tokens INTEGER NOT NULL DEFAULT 0,
                total_tokens      INTEGER NOT NULL DEFAULT 0,
                cost_usd          REAL NOT NULL DEFAULT 0,
                metadata          TEXT,
                UNIQUE(run_id, step_number)
            );
            CREATE TABLE IF NOT EXISTS run_events (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id     INTEGER NOT NULL REFERENCES runs(run_id),
                seq        INTEGER NOT NULL,
                kind       TEXT NOT NULL,
                payload    TEXT,
                created_at TEXT NOT NULL,
                UNIQUE(run_id, seq)
            );
            CREATE TABLE IF NOT EXISTS benchmarks (
                benchmark_id TEXT PRIMARY KEY,
                config       TEXT NOT NULL,
                status       TEXT NOT NULL,
                created_at   TEXT NOT NULL,
                summary      TEXT
            );
            "#,
        )
        .context("create tables")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("database mutex poisoned")
    }

    /// Insert a new run with status running (NULL outcome); returns its id.
    pub fn create_run(
        &self,
        quest_name: &str,
        agent_id: &str,
        agent_config: &str,
        benchmark_id: Option<&str>,
    ) -> Result<i64> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO runs (quest_name, agent_id, agent_config, benchmark_id, start_time)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                quest_name,
                agent_id,
                agent_config,
                benchmark_id,
                Utc::now().to_rfc3339()
            ],
        )
        .context("insert run")?;
        Ok(conn.last_insert_rowid())
    }

    /// Commit a terminal outcome. First write wins: the update is guarded on
    /// `outcome IS NULL` and the return value says whether this writer won.
    pub fn commit_outcome(&self, run_id: i64, outcome: Outcome, reward: f64) -> Result<bool> {
        let changed = self
            .lock()
            .execute(
                "UPDATE runs
                    SET outcome = ?1, end_time = ?2, reward = ?3
                  WHERE run_id = ?4
                    AND outcome IS NULL",
                params![outcome.as_str(), Utc::now().to_rfc3339(), reward, run_id],
            )
            .context("commit outcome")?;
        debug!(run_id, %outcome, won = changed > 0, "outcome commit");
        Ok(changed > 0)
    }

    pub fn get_run(&self, run_id: i64) -> Result<RunRow> {
        self.lock()
            .query_row(
                "SELECT run_id, quest_name, agent_id, agent_config, benchmark_id,
                        start_time, end_time, outcome, reward
                   FROM runs WHERE run_id = ?1",
                params![run_id],
                row_to_run,
            )
            .with_context(|| format!("run {run_id} not found"))
    }

    /// Runs belonging to a benchmark, in run_id order.
    pub fn runs_for_benchmark(&self, benchmark_id: &str) -> Result<Vec<RunRow>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT run_id, quest_name, agent_id, agent_config, benchmark_id,
                        start_time, end_time, outcome, reward
                   FROM runs WHERE benchmark_id = ?1 ORDER BY run_id",
            )
            .context("prepare benchmark runs query")?;
        let rows = stmt
            .query_map(params![benchmark_id], row_to_run)
            .context("query benchmark runs")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("read benchmark runs")
    }

    pub fn insert_step(&self, run_id: i64, step: &StepRow) -> Result<()> {
        self.lock()
            .execute(
                "INSERT INTO steps (run_id, step_number, location_id, observation, choices,
                                    action, reward, llm_decision, prompt_tokens,
                                    completion_tokens, total_tokens, cost_usd, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    run_id,
                    step.step_number,
                    step.location_id,
                    step.observation,
                    step.choices,
                    step.action,
                    step.reward,
                    step.llm_decision,
                    step.prompt_tokens,
                    step.completion_tokens,
                    step.total_tokens,
                    step.cost_usd,
                    step.metadata,
                ],
            )
            .with_context(|| format!("insert step {} for run {run_id}", step.step_number))?;
        Ok(())
    }

    pub fn steps_for_run(&self, run_id: i64) -> Result<Vec<StepRow>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT step_number, location_id, observation, choices, action, reward,
                        llm_decision, prompt_tokens, completion_tokens, total_tokens,
                        cost_usd, metadata
                   FROM steps WHERE run_id = ?1 ORDER BY step_number",
            )
            .context("prepare steps query")?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok(StepRow {
                    step_number: row.get(0)?,
                    location_id: row.get(1)?,
                    observation: row.get(2)?,
                    choices: row.get(3)?,
                    action: row.get(4)?,
                    reward: row.get(5)?,
                    llm_decision: row.get(6)?,
                    prompt_tokens: row.get(7)?,
                    completion_tokens: row.get(8)?,
                    total_tokens: row.get(9)?,
                    cost_usd: row.get(10)?,
                    metadata: row.get(11)?,
                })
            })
            .context("query steps")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("read steps")
    }

    /// Append one event with the next monotonic sequence number for the run.
    pub fn append_event(
        &self,
        run_id: i64,
        kind: EventKind,
        payload: Option<&str>,
    ) -> Result<i64> {
        let mut conn = self.lock();
        let tx = conn.transaction().context("begin event transaction")?;
        let seq: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(seq), 0) + 1 FROM run_events WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .context("next event seq")?;
        tx.execute(
            "INSERT INTO run_events (run_id, seq, kind, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                run_id,
                seq,
                kind.as_str(),
                payload,
                Utc::now().to_rfc3339()
            ],
        )
        .context("insert event")?;
        tx.commit().context("commit event")?;
        Ok(seq)
    }

    pub fn events_for_run(&self, run_id: i64) -> Result<Vec<EventRow>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT seq, kind, payload, created_at
                   FROM run_events WHERE run_id = ?1 ORDER BY seq",
            )
            .context("prepare events query")?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok(EventRow {
                    seq: row.get(0)?,
                    kind: row.get(1)?,
                    payload: row.get(2)?,
                    created_at: row.get(3)?,
                })
            })
            .context("query events")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("read events")
    }

    pub fn create_benchmark(&self, benchmark_id: &str, config: &str) -> Result<()> {
        self.lock()
            .execute(
                "INSERT INTO benchmarks (benchmark_id, config, status, created_at)
                 VALUES (?1, ?2, 'pending', ?3)",
                params![benchmark_id, config, Utc::now().to_rfc3339()],
            )
            .with_context(|| format!("insert benchmark {benchmark_id}"))?;
        Ok(())
    }

    pub fn set_benchmark_status(&self, benchmark_id: &str, status: &str) -> Result<()> {
        let changed = self
            .lock()
            .execute(
                "UPDATE benchmarks SET status = ?1 WHERE benchmark_id = ?2",
                params![status, benchmark_id],
            )
            .context("update benchmark status")?;
        if changed == 0 {
            return Err(anyhow!("benchmark {benchmark_id} not found"));
        }
        Ok(())
    }

    pub fn finish_benchmark(
        &self,
        benchmark_id: &str,
        status: &str,
        summary: &str,
    ) -> Result<()> {
        let changed = self
            .lock()
            .execute(
                "UPDATE benchmarks SET status = ?1, summary = ?2 WHERE benchmark_id = ?3",
                params![status, summary, benchmark_id],
            )
            .context("finish benchmark")?;
        if changed == 0 {
            return Err(anyhow!("benchmark {benchmark_id} not found"));
        }
        Ok(())
    }

    pub fn benchmark_summary(&self, benchmark_id: &str) -> Result<Option<String>> {
        self.lock()
            .query_row(
                "SELECT summary FROM benchmarks WHERE benchmark_id = ?1",
                params![benchmark_id],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()
            .context("query benchmark summary")
            .map(Option::flatten)
    }
}

fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunRow> {
    let outcome: Option<String> = row.get(7)?;
    Ok(RunRow {
        run_id: row.get(0)?,
        quest_name: row.get(1)?,
        agent_id: row.get(2)?,
        agent_config: row.get(3)?,
        benchmark_id: row.get(4)?,
        start_time: row.get(5)?,
        end_time: row.get(6)?,
        outcome: outcome.as_deref().and_then(|value| Outcome::parse(value).ok()),
        reward: row.get(8)?,
    })
}
