//! Shared scripted fakes for unit and integration tests.
//!
//! Engines and providers replay canned data without subprocesses or network
//! I/O; [`fake_interpreter`] writes a `/bin/sh` script that behaves like the
//! quest interpreter for true subprocess coverage.

use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};

use crate::engine::{BridgeError, Choice, GameStatus, QuestEngine, QuestState};
use crate::llm::pricing::PriceTable;
use crate::llm::provider::{ChatProvider, ChatRequest, ProviderReply};
use crate::llm::{LlmClient, LlmError, Role, Usage};

/// Build a running state with the given `(jump_id, text)` choices.
pub fn running_state(location: &str, text: &str, choices: &[(i64, &str)]) -> QuestState {
    QuestState {
        location_id: location.to_string(),
        text: text.to_string(),
        choices: choices
            .iter()
            .map(|(jump_id, text)| Choice {
                jump_id: *jump_id,
                text: text.to_string(),
            })
            .collect(),
        params_state: Vec::new(),
        game_state: GameStatus::Running,
    }
}

/// Build a terminal state with no choices.
pub fn terminal_state(location: &str, game_state: GameStatus) -> QuestState {
    QuestState {
        location_id: location.to_string(),
        text: "The quest is over.".to_string(),
        choices: Vec::new(),
        params_state: Vec::new(),
        game_state,
    }
}

/// Engine that replays a fixed state sequence.
///
/// `start` returns the first state; every `step` advances to the next.
/// Jump IDs received are recorded for assertions.
pub struct ScriptedEngine {
    states: Vec<QuestState>,
    position: usize,
    jumps: Arc<Mutex<Vec<i64>>>,
    delay: Option<Duration>,
    closed: Arc<Mutex<bool>>,
}

impl ScriptedEngine {
    pub fn new(states: Vec<QuestState>) -> Self {
        Self {
            states,
            position: 0,
            jumps: Arc::new(Mutex::new(Vec::new())),
            delay: None,
            closed: Arc::new(Mutex::new(false)),
        }
    }

    /// Sleep this long inside `start` and every `step` (timeout tests).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Jump IDs the run sent, in order.
    pub fn jumps(&self) -> Arc<Mutex<Vec<i64>>> {
        Arc::clone(&self.jumps)
    }

    /// Shared flag flipped by `close`.
    pub fn closed_flag(&self) -> Arc<Mutex<bool>> {
        Arc::clone(&self.closed)
    }

    fn pause(&self) {
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
    }
}

impl QuestEngine for ScriptedEngine {
    fn start(&mut self) -> Result<QuestState, BridgeError> {
        self.pause();
        self.position = 0;
        self.states
            .first()
            .cloned()
            .ok_or_else(|| BridgeError::Startup {
                detail: "script has no states".to_string(),
                stderr: String::new(),
            })
    }

    fn step(&mut self, jump_id: i64) -> Result<QuestState, BridgeError> {
        self.pause();
        self.jumps.lock().expect("jumps lock").push(jump_id);
        self.position += 1;
        self.states
            .get(self.position)
            .cloned()
            .ok_or_else(|| BridgeError::Crashed {
                detail: "script exhausted".to_string(),
            })
    }

    fn get_state(&mut self) -> Result<QuestState, BridgeError> {
        self.states
            .get(self.position)
            .cloned()
            .ok_or_else(|| BridgeError::Crashed {
                detail: "script exhausted".to_string(),
            })
    }

    fn close(&mut self) {
        *self.closed.lock().expect("closed lock") = true;
    }
}

/// Provider that replays canned replies and records prompts.
pub struct ScriptedProvider {
    replies: Mutex<VecDeque<Result<ProviderReply, LlmError>>>,
    calls: Arc<Mutex<u32>>,
    prompts: Arc<Mutex<Vec<String>>>,
}

impl ScriptedProvider {
    pub fn new(replies: Vec<Result<ProviderReply, LlmError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            calls: Arc::new(Mutex::new(0)),
            prompts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A plain text reply with zero usage.
    pub fn text_reply(content: &str) -> ProviderReply {
        ProviderReply {
            content: Some(content.to_string()),
            usage: Some(Usage::default()),
            finish_reason: Some("stop".to_string()),
        }
    }

    /// Number of `complete` calls made so far.
    pub fn calls(&self) -> Arc<Mutex<u32>> {
        Arc::clone(&self.calls)
    }

    /// Last-user-message prompts seen, in call order.
    pub fn prompts(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.prompts)
    }
}

impl ChatProvider for ScriptedProvider {
    fn complete(&self, request: &ChatRequest<'_>) -> Result<ProviderReply, LlmError> {
        *self.calls.lock().expect("calls lock") += 1;
        if let Some(prompt) = request
            .messages
            .iter()
            .rev()
            .find(|message| message.role == Role::User)
        {
            self.prompts
                .lock()
                .expect("prompts lock")
                .push(prompt.content.clone());
        }
        self.replies
            .lock()
            .expect("replies lock")
            .pop_front()
            .unwrap_or_else(|| {
                Err(LlmError::Transient {
                    detail: "provider script exhausted".to_string(),
                })
            })
    }
}

/// Wrap a scripted provider in a client with built-in prices.
pub fn scripted_client(provider: ScriptedProvider) -> LlmClient {
    LlmClient::with_provider(
        Box::new(provider),
        "gpt-4o",
        Arc::new(PriceTable::builtin()),
    )
}

/// Write a `/bin/sh` script acting as a quest interpreter and return the
/// command vector to launch it. The bridge appends the quest path and
/// language, which the script is free to ignore.
pub fn fake_interpreter(dir: &Path, body: &str) -> Result<Vec<String>> {
    let path = dir.join("fake_interpreter.sh");
    fs::write(&path, body).with_context(|| format!("write {}", path.display()))?;
    Ok(vec![
        "sh".to_string(),
        path.to_string_lossy().into_owned(),
    ])
}
