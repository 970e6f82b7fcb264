//! Uniform `reset → step(action)` environment over a quest engine.
//!
//! Agents never see jump IDs. Each state exposes its choices as 1-based
//! indices; the environment owns the per-step [`ChoiceMap`] that translates
//! an index back into the opaque jump ID the interpreter expects.

use std::fmt;

use anyhow::{Context, Result, anyhow};
use serde::Serialize;

use crate::engine::{GameStatus, QuestEngine, QuestState};

/// Total mapping from 1-based choice indices to jump IDs.
///
/// Rebuilt from scratch on every state transition; never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChoiceMap {
    jump_ids: Vec<i64>,
}

impl ChoiceMap {
    pub fn from_state(state: &QuestState) -> Self {
        Self {
            jump_ids: state.choices.iter().map(|choice| choice.jump_id).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.jump_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jump_ids.is_empty()
    }

    /// Jump ID for a 1-based action index.
    pub fn jump_id(&self, action: usize) -> Option<i64> {
        if action == 0 {
            return None;
        }
        self.jump_ids.get(action - 1).copied()
    }

    /// Jump IDs in presentation order (used for loop fingerprints).
    pub fn jump_ids(&self) -> &[i64] {
        &self.jump_ids
    }
}

/// What an agent sees at one step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Observation {
    pub location_id: String,
    /// Narrative text, markup already stripped.
    pub text: String,
    /// User-facing choice labels; index `i` is action `i + 1`.
    pub choices_rendered: Vec<String>,
    pub params_state: Vec<String>,
    pub choice_map: ChoiceMap,
}

impl Observation {
    fn from_state(state: &QuestState) -> Self {
        Self {
            location_id: state.location_id.clone(),
            text: state.text.clone(),
            choices_rendered: state
                .choices
                .iter()
                .map(|choice| choice.text.clone())
                .collect(),
            params_state: state.params_state.clone(),
            choice_map: ChoiceMap::from_state(state),
        }
    }

    /// Render the observation the way it is shown to agents and persisted.
    pub fn render(&self) -> String {
        let mut buf = self.text.clone();
        if !self.choices_rendered.is_empty() {
            buf.push_str("\n\nAvailable actions:\n");
            for (index, choice) in self.choices_rendered.iter().enumerate() {
                buf.push_str(&format!("{}. {}\n", index + 1, choice));
            }
        }
        buf
    }
}

/// Raised when an action index is outside the current choice map.
///
/// This is a programmer error: the agent layer clamps its output before it
/// reaches the environment, so an `InvalidAction` must never be converted
/// into a run outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidAction {
    pub action: usize,
    pub valid_through: usize,
}

impl fmt::Display for InvalidAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid action {} (valid: 1..={})",
            self.action, self.valid_through
        )
    }
}

impl std::error::Error for InvalidAction {}

/// Extra step information alongside the observation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepInfo {
    pub game_state: GameStatus,
    pub reward: f64,
    pub done: bool,
}

/// Environment wrapper that drives a [`QuestEngine`] session.
pub struct QuestEnv<E: QuestEngine> {
    engine: E,
    current: Option<QuestState>,
}

impl<E: QuestEngine> QuestEnv<E> {
    pub fn new(engine: E) -> Self {
        Self {
            engine,
            current: None,
        }
    }

    /// Start the engine session and return the initial observation.
    pub fn reset(&mut self) -> Result<Observation> {
        let state = self.engine.start().context("start quest engine")?;
        let observation = Observation::from_state(&state);
        self.current = Some(state);
        Ok(observation)
    }

    /// Take a 1-based action. Precondition violations raise [`InvalidAction`]
    /// without consuming an engine step.
    pub fn step(&mut self, action: usize) -> Result<(Observation, StepInfo)> {
        let current = self
            .current
            .as_ref()
            .ok_or_else(|| anyhow!("environment not reset"))?;
        let map = ChoiceMap::from_state(current);
        let jump_id = map.jump_id(action).ok_or(InvalidAction {
            action,
            valid_through: map.len(),
        })?;

        let state = self
            .engine
            .step(jump_id)
            .with_context(|| format!("engine step jump {jump_id}"))?;
        let observation = Observation::from_state(&state);
        let info = StepInfo {
            game_state: state.game_state,
            reward: reward_for(state.game_state),
            done: state.is_terminal(),
        };
        self.current = Some(state);
        Ok((observation, info))
    }

    pub fn current_state(&self) -> Option<&QuestState> {
        self.current.as_ref()
    }

    pub fn is_terminal(&self) -> bool {
        self.current
            .as_ref()
            .is_some_and(|state| state.is_terminal())
    }

    pub fn close(&mut self) {
        self.engine.close();
    }
}

/// Reward policy: 1.0 on win, 0.0 otherwise. Intermediate steps are 0.0
/// because `Running` is not a win.
fn reward_for(game_state: GameStatus) -> f64 {
    match game_state {
        GameStatus::Win => 1.0,
        GameStatus::Running | GameStatus::Fail | GameStatus::Dead => 0.0,
    }
}
