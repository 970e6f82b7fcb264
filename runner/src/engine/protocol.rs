//! Wire protocol types for the quest interpreter session.
//!
//! The interpreter emits one JSON object per stdout line:
//! `{state: {text, choices, paramsState?, gameState}, saving: {locationId,
//! paramValues?}}`. Anything that does not parse as a JSON object is
//! diagnostic noise, not an error; a JSON object that parses but does not
//! match this shape is a protocol violation.

use serde::{Deserialize, Serialize};

use super::BridgeError;

/// Terminal classification of a quest state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GameStatus {
    Running,
    Win,
    Fail,
    Dead,
}

impl GameStatus {
    pub fn is_terminal(self) -> bool {
        self != GameStatus::Running
    }
}

/// One selectable transition out of the current location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Choice {
    pub jump_id: i64,
    pub text: String,
}

/// Parsed, cleaned quest state as produced by one bridge exchange.
///
/// Invariant: `choices` is non-empty iff `game_state == Running`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestState {
    pub location_id: String,
    pub text: String,
    pub choices: Vec<Choice>,
    /// Human-readable status strings (stat panels). Opaque display content.
    pub params_state: Vec<String>,
    pub game_state: GameStatus,
}

impl QuestState {
    pub fn is_terminal(&self) -> bool {
        self.game_state.is_terminal()
    }
}

/// Classification of one stdout line from the interpreter.
#[derive(Debug)]
pub enum Line {
    /// A schema-matching state reply.
    State(QuestState),
    /// Anything that is not a JSON object (autojump traces, ad-hoc logs).
    Noise(String),
}

#[derive(Debug, Deserialize)]
struct RawReply {
    state: RawState,
    saving: RawSaving,
}

#[derive(Debug, Deserialize)]
struct RawState {
    text: String,
    choices: Vec<RawChoice>,
    #[serde(rename = "paramsState", default)]
    params_state: Option<Vec<String>>,
    #[serde(rename = "gameState", default)]
    game_state: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawChoice {
    #[serde(rename = "jumpId")]
    jump_id: i64,
    text: String,
}

#[derive(Debug, Deserialize)]
struct RawSaving {
    #[serde(rename = "locationId")]
    location_id: serde_json::Value,
}

/// Classify one stdout line: state reply, noise, or protocol violation.
pub fn classify_line(line: &str) -> Result<Line, BridgeError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(Line::Noise(String::new()));
    }
    let value: serde_json::Value = match serde_json::from_str(trimmed) {
        Ok(value) => value,
        Err(_) => return Ok(Line::Noise(trimmed.to_string())),
    };
    if !value.is_object() {
        return Ok(Line::Noise(trimmed.to_string()));
    }
    let raw: RawReply = serde_json::from_value(value).map_err(|err| BridgeError::Protocol {
        detail: format!("state object does not match expected schema: {err}"),
    })?;
    Ok(Line::State(state_from_raw(raw)?))
}

fn state_from_raw(raw: RawReply) -> Result<QuestState, BridgeError> {
    let choices: Vec<Choice> = raw
        .state
        .choices
        .into_iter()
        .map(|choice| Choice {
            jump_id: choice.jump_id,
            text: clean_text(&choice.text),
        })
        .collect();

    let game_state = match raw.state.game_state.as_deref() {
        Some("running") => GameStatus::Running,
        Some("win") => GameStatus::Win,
        Some("fail") => GameStatus::Fail,
        Some("dead") => GameStatus::Dead,
        Some(other) => {
            return Err(BridgeError::Protocol {
                detail: format!("unknown gameState '{other}'"),
            });
        }
        // Older interpreter builds omit gameState; game end is "no choices
        // left" and a win is always announced explicitly.
        None if choices.is_empty() => GameStatus::Fail,
        None => GameStatus::Running,
    };

    if choices.is_empty() != game_state.is_terminal() {
        return Err(BridgeError::Protocol {
            detail: format!(
                "gameState {game_state:?} inconsistent with {} choices",
                choices.len()
            ),
        });
    }

    let location_id = match &raw.saving.location_id {
        serde_json::Value::String(id) => id.clone(),
        serde_json::Value::Number(id) => id.to_string(),
        other => {
            return Err(BridgeError::Protocol {
                detail: format!("locationId must be a string or number, got {other}"),
            });
        }
    };

    Ok(QuestState {
        location_id,
        text: clean_text(&raw.state.text),
        choices,
        params_state: raw
            .state
            .params_state
            .unwrap_or_default()
            .iter()
            .map(|param| clean_text(param))
            .collect(),
        game_state,
    })
}

/// Strip interpreter markup tags and normalize line endings.
fn clean_text(text: &str) -> String {
    text.replace("<clr>", "")
        .replace("<clrEnd>", "")
        .replace("\r\n", "\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_line(json: &str) -> QuestState {
        match classify_line(json).expect("classify") {
            Line::State(state) => state,
            Line::Noise(noise) => panic!("expected state, got noise: {noise}"),
        }
    }

    #[test]
    fn parses_running_state() {
        let state = state_line(
            r#"{"state":{"text":"You are <clr>here<clrEnd>.","choices":[{"jumpId":10,"text":"Go"}],"paramsState":["HP: 10"],"gameState":"running"},"saving":{"locationId":5}}"#,
        );
        assert_eq!(state.location_id, "5");
        assert_eq!(state.text, "You are here.");
        assert_eq!(state.choices.len(), 1);
        assert_eq!(state.choices[0].jump_id, 10);
        assert_eq!(state.params_state, vec!["HP: 10".to_string()]);
        assert_eq!(state.game_state, GameStatus::Running);
        assert!(!state.is_terminal());
    }

    #[test]
    fn parses_terminal_win() {
        let state = state_line(
            r#"{"state":{"text":"Victory","choices":[],"gameState":"win"},"saving":{"locationId":"9"}}"#,
        );
        assert_eq!(state.game_state, GameStatus::Win);
        assert!(state.is_terminal());
    }

    #[test]
    fn missing_game_state_defaults_from_choices() {
        let running = state_line(
            r#"{"state":{"text":"x","choices":[{"jumpId":1,"text":"a"}]},"saving":{"locationId":1}}"#,
        );
        assert_eq!(running.game_state, GameStatus::Running);

        let ended =
            state_line(r#"{"state":{"text":"x","choices":[]},"saving":{"locationId":1}}"#);
        assert_eq!(ended.game_state, GameStatus::Fail);
    }

    #[test]
    fn non_json_line_is_noise() {
        match classify_line("[autojump] diagnostic ignore me").expect("classify") {
            Line::Noise(noise) => assert!(noise.contains("autojump")),
            Line::State(_) => panic!("noise classified as state"),
        }
    }

    #[test]
    fn json_object_with_wrong_shape_is_protocol_error() {
        let err = classify_line(r#"{"unexpected":true}"#).expect_err("protocol");
        assert!(matches!(err, BridgeError::Protocol { .. }));
    }

    #[test]
    fn running_state_without_choices_is_protocol_error() {
        let err = classify_line(
            r#"{"state":{"text":"x","choices":[],"gameState":"running"},"saving":{"locationId":1}}"#,
        )
        .expect_err("protocol");
        assert!(matches!(err, BridgeError::Protocol { .. }));
    }

    #[test]
    fn carriage_returns_are_normalized() {
        let state = state_line(
            r#"{"state":{"text":"a\r\nb","choices":[],"gameState":"fail"},"saving":{"locationId":2}}"#,
        );
        assert_eq!(state.text, "a\nb");
    }
}
