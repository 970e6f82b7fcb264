//! Long-lived quest interpreter subprocess session.
//!
//! The bridge owns exactly one interpreter process for the lifetime of a run.
//! Commands go down stdin one per line; states come back as line-delimited
//! JSON on stdout. Stdout is drained by a dedicated reader thread so every
//! read can be bounded by a wall-clock budget; non-JSON lines are kept as
//! diagnostics instead of being treated as errors.

use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{Receiver, RecvTimeoutError, channel};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};
use wait_timeout::ChildExt;

use super::BridgeError;
use super::protocol::{Line, QuestState, classify_line};
use crate::config::RunnerConfig;

/// Cap on buffered diagnostic lines per bridge session.
const DIAGNOSTIC_LINE_CAP: usize = 200;

/// Uniform session interface over the quest interpreter.
///
/// The production implementation is [`EngineBridge`]; tests use scripted
/// engines that replay canned states without a subprocess.
pub trait QuestEngine {
    /// Spawn the session and return the initial state.
    fn start(&mut self) -> Result<QuestState, BridgeError>;
    /// Perform the transition identified by `jump_id`.
    fn step(&mut self, jump_id: i64) -> Result<QuestState, BridgeError>;
    /// Re-emit the current state without advancing the quest.
    fn get_state(&mut self) -> Result<QuestState, BridgeError>;
    /// Terminate the session. Idempotent; must run on every exit path.
    fn close(&mut self);
}

/// Spawn parameters for one interpreter session.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Interpreter command; quest path and language are appended.
    pub command: Vec<String>,
    pub quest_path: PathBuf,
    pub language: String,
    /// Budget for one full exchange (command sent, state received).
    pub read_budget: Duration,
    /// Grace period between stdin close and force-kill.
    pub close_grace: Duration,
    /// Truncate captured stderr beyond this many bytes.
    pub stderr_limit_bytes: usize,
}

impl BridgeConfig {
    pub fn from_runner_config(config: &RunnerConfig, quest_path: PathBuf) -> Self {
        Self {
            command: config.engine_command.clone(),
            quest_path,
            language: config.language.clone(),
            read_budget: config.read_budget(),
            close_grace: Duration::from_secs(2),
            stderr_limit_bytes: config.stderr_limit_bytes,
        }
    }
}

struct Session {
    child: Child,
    stdin: ChildStdin,
    stdout_rx: Receiver<String>,
    stderr: Arc<Mutex<String>>,
    stderr_reader: Option<thread::JoinHandle<()>>,
}

/// Subprocess-backed [`QuestEngine`].
pub struct EngineBridge {
    config: BridgeConfig,
    session: Option<Session>,
    diagnostics: Vec<String>,
    dropped_diagnostics: usize,
}

impl EngineBridge {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            session: None,
            diagnostics: Vec::new(),
            dropped_diagnostics: 0,
        }
    }

    /// Non-JSON stdout lines observed so far (autojump traces etc.).
    pub fn diagnostics(&self) -> &[String] {
        &self.diagnostics
    }

    fn spawn(&self) -> Result<Session, BridgeError> {
        let (program, args) = self
            .config
            .command
            .split_first()
            .ok_or_else(|| BridgeError::Startup {
                detail: "engine command is empty".to_string(),
                stderr: String::new(),
            })?;

        let mut command = Command::new(program);
        command
            .args(args)
            .arg(&self.config.quest_path)
            .arg(&self.config.language)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!(program, quest = %self.config.quest_path.display(), "spawning interpreter");
        let mut child = command.spawn().map_err(|err| BridgeError::Startup {
            detail: format!("spawn {program}: {err}"),
            stderr: String::new(),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| BridgeError::Startup {
            detail: "stdin was not piped".to_string(),
            stderr: String::new(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| BridgeError::Startup {
            detail: "stdout was not piped".to_string(),
            stderr: String::new(),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| BridgeError::Startup {
            detail: "stderr was not piped".to_string(),
            stderr: String::new(),
        })?;

        let (stdout_tx, stdout_rx) = channel();
        thread::spawn(move || {
            let reader = BufReader::new(stdout);
            for line in reader.lines() {
                let Ok(line) = line else { break };
                if stdout_tx.send(line).is_err() {
                    // Bridge closed; remaining output is discarded.
                    break;
                }
            }
        });

        let stderr_buf = Arc::new(Mutex::new(String::new()));
        let stderr_limit = self.config.stderr_limit_bytes;
        let stderr_sink = Arc::clone(&stderr_buf);
        let stderr_reader = thread::spawn(move || {
            let reader = BufReader::new(stderr);
            for line in reader.lines() {
                let Ok(line) = line else { break };
                let mut buf = stderr_sink.lock().expect("stderr buffer poisoned");
                if buf.len() < stderr_limit {
                    buf.push_str(&line);
                    buf.push('\n');
                }
            }
        });

        Ok(Session {
            child,
            stdin,
            stdout_rx,
            stderr: stderr_buf,
            stderr_reader: Some(stderr_reader),
        })
    }

    fn stderr_fragment(session: &Session) -> String {
        session
            .stderr
            .lock()
            .map(|buf| buf.trim_end().to_string())
            .unwrap_or_default()
    }

    fn send(&mut self, command: &str) -> Result<(), BridgeError> {
        let session = self.session.as_mut().ok_or_else(|| BridgeError::Crashed {
            detail: "session not started".to_string(),
        })?;
        writeln!(session.stdin, "{command}")
            .and_then(|_| session.stdin.flush())
            .map_err(|err| BridgeError::Crashed {
                detail: format!("write command '{command}': {err}"),
            })
    }

    /// Read stdout until a schema-matching state arrives or the budget runs
    /// out. Noise lines are buffered; a missing reply is never synthesized
    /// into a terminal state.
    fn read_state(&mut self) -> Result<QuestState, BridgeError> {
        let deadline = Instant::now() + self.config.read_budget;
        loop {
            let session = self.session.as_ref().ok_or_else(|| BridgeError::Crashed {
                detail: "session not started".to_string(),
            })?;
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(BridgeError::Timeout {
                    budget_secs: self.config.read_budget.as_secs(),
                });
            }
            let line = match session.stdout_rx.recv_timeout(remaining) {
                Ok(line) => line,
                Err(RecvTimeoutError::Timeout) => {
                    return Err(BridgeError::Timeout {
                        budget_secs: self.config.read_budget.as_secs(),
                    });
                }
                Err(RecvTimeoutError::Disconnected) => {
                    let stderr = Self::stderr_fragment(session);
                    return Err(BridgeError::Crashed {
                        detail: format!("stdout closed before a state arrived (stderr: {stderr})"),
                    });
                }
            };
            match classify_line(&line)? {
                Line::State(state) => return Ok(state),
                Line::Noise(noise) if noise.is_empty() => {}
                Line::Noise(noise) => {
                    debug!(line = %noise, "interpreter noise");
                    if self.diagnostics.len() < DIAGNOSTIC_LINE_CAP {
                        self.diagnostics.push(noise);
                    } else {
                        self.dropped_diagnostics += 1;
                    }
                }
            }
        }
    }
}

impl QuestEngine for EngineBridge {
    #[instrument(skip_all, fields(quest = %self.config.quest_path.display()))]
    fn start(&mut self) -> Result<QuestState, BridgeError> {
        if self.session.is_some() {
            return Err(BridgeError::Startup {
                detail: "session already started".to_string(),
                stderr: String::new(),
            });
        }
        self.session = Some(self.spawn()?);

        // Preflight: the initial state must arrive and parse, otherwise the
        // failure is surfaced with whatever stderr the interpreter produced.
        match self.read_state() {
            Ok(state) => {
                info!(location = %state.location_id, "interpreter session started");
                Ok(state)
            }
            Err(err) => {
                let stderr_buf = self.session.as_ref().map(|s| Arc::clone(&s.stderr));
                // Close first so the stderr reader hits EOF and drains fully
                // before the fragment is captured.
                self.close();
                let stderr = stderr_buf
                    .map(|buf| buf.lock().expect("stderr buffer poisoned").trim_end().to_string())
                    .unwrap_or_default();
                Err(BridgeError::Startup {
                    detail: err.to_string(),
                    stderr,
                })
            }
        }
    }

    fn step(&mut self, jump_id: i64) -> Result<QuestState, BridgeError> {
        self.send(&jump_id.to_string())?;
        self.read_state()
    }

    fn get_state(&mut self) -> Result<QuestState, BridgeError> {
        self.send("get_state")?;
        self.read_state()
    }

    #[instrument(skip_all)]
    fn close(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        // Closing stdin asks the interpreter to exit; force-kill after grace.
        drop(session.stdin);
        match session.child.wait_timeout(self.config.close_grace) {
            Ok(Some(status)) => debug!(?status, "interpreter exited"),
            Ok(None) => {
                warn!("interpreter did not exit within grace period, killing");
                let _ = session.child.kill();
                let _ = session.child.wait();
            }
            Err(err) => {
                warn!(%err, "wait for interpreter failed, killing");
                let _ = session.child.kill();
                let _ = session.child.wait();
            }
        }
        if let Some(reader) = session.stderr_reader.take() {
            let _ = reader.join();
        }
        if self.dropped_diagnostics > 0 {
            debug!(
                dropped = self.dropped_diagnostics,
                "diagnostic lines dropped beyond cap"
            );
        }
    }
}

impl Drop for EngineBridge {
    fn drop(&mut self) {
        self.close();
    }
}
