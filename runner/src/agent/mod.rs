//! Decision agent: Observation in, 1-based choice index out.
//!
//! The agent renders prompts from state plus memory, calls the LLM client,
//! parses the structured reply, watches for state loops, and falls back to
//! the first choice instead of ever failing a run.

pub mod loop_guard;
pub mod memory;
pub mod parse;
pub mod prompt;
pub mod tools;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::config::{AgentConfig, MemoryKind, Tool};
use crate::env::Observation;
use crate::llm::pricing::PriceTable;
use crate::llm::{ChatMessage, CompletionParams, LlmClient, Usage};

use loop_guard::{LoopGuard, escape_action, fingerprint};
use memory::{MemoryEntry, MemoryState, render_for_summary};
use parse::parse_reply;
use prompt::{PromptEngine, PromptVars};
use tools::run_calculator;

/// LLM attempts per decision before falling back.
pub const MAX_RETRIES: u32 = 2;
/// Steps between summarizer calls for `summary` memory.
pub const SUMMARY_INTERVAL: u32 = 5;

const LOOP_HINT: &str = "You have repeated this state several times with the same action. \
Prefer a different action than your previous choice here.";

/// Structured record of one decision, persisted verbatim on the step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmDecision {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    /// The model's raw result before any override; `None` when the model
    /// produced nothing usable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<usize>,
    /// True when the action is the fallback, not a model choice.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_default: bool,
    /// `"parse_error"` or `"llm_call_error: <kind>"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// `"loop_escape"` when loop detection rotated the action.
    #[serde(rename = "override", skip_serializing_if = "Option::is_none")]
    pub override_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_note: Option<String>,
}

/// One decision with its accounting.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    /// Final 1-based action to take.
    pub action: usize,
    pub llm: LlmDecision,
    pub usage: Usage,
    pub cost_usd: f64,
}

/// Per-run decision agent. Owns memory and loop state; never shared across
/// runs.
pub struct DecisionAgent {
    config: AgentConfig,
    client: LlmClient,
    prompts: PromptEngine,
    memory: MemoryState,
    guard: LoopGuard,
}

impl DecisionAgent {
    pub fn new(config: AgentConfig, prices: Arc<PriceTable>) -> Result<Self> {
        let client = LlmClient::new(&config.model, prices)?;
        Self::with_client(config, client)
    }

    /// Build over an explicit client (scripted providers in tests).
    pub fn with_client(config: AgentConfig, client: LlmClient) -> Result<Self> {
        let prompts = PromptEngine::new(&config)?;
        let memory = MemoryState::new(config.memory.as_ref());
        Ok(Self {
            config,
            client,
            prompts,
            memory,
            guard: LoopGuard::new(),
        })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Auto-select the only available choice without a model call.
    ///
    /// Memory is still updated so later prompts see a complete history.
    pub fn auto_select(&mut self, observation: &Observation) -> Decision {
        let llm = LlmDecision {
            reasoning: Some("Only one choice available".to_string()),
            result: Some(1),
            ..LlmDecision::default()
        };
        self.remember(observation, 1, llm.reasoning.clone());
        Decision {
            action: 1,
            llm,
            usage: Usage::default(),
            cost_usd: 0.0,
        }
    }

    /// Produce an action for the observation within the given time budget.
    ///
    /// Never returns an error: LLM and parse failures degrade to the
    /// fallback action with an error marker on the decision.
    #[instrument(skip_all, fields(agent = %self.config.agent_id, location = %observation.location_id))]
    pub fn decide(&mut self, observation: &Observation, budget: Duration) -> Decision {
        let deadline = Instant::now() + budget;
        let choice_count = observation.choice_map.len();
        let state_fp = fingerprint(
            &observation.location_id,
            &observation.params_state,
            observation.choice_map.jump_ids(),
        );
        self.guard.observe(&state_fp);
        let avoid = self.guard.hint_target(&state_fp);

        self.maybe_summarize(deadline);

        let calculator = self.config.tools.contains(&Tool::Calculator);
        let vars = PromptVars {
            observation: &observation.text,
            choices: &observation.choices_rendered,
            params_state: &observation.params_state,
            memory: self.memory.render_block(),
            loop_hint: avoid.map(|_| LOOP_HINT.to_string()),
            calculator,
        };

        let mut usage = Usage::default();
        let mut cost_usd = 0.0;
        let mut messages = match self.build_messages(&vars) {
            Ok(messages) => messages,
            Err(err) => {
                warn!(%err, "prompt rendering failed");
                let llm = fallback_decision(None, None, format!("prompt_error: {err}"));
                self.remember(observation, 1, None);
                return Decision {
                    action: 1,
                    llm,
                    usage,
                    cost_usd,
                };
            }
        };

        let mut best_reasoning: Option<String> = None;

        for attempt in 1..=MAX_RETRIES {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let params = CompletionParams {
                temperature: self.config.temperature,
                max_tokens: 1024,
                timeout: remaining,
            };
            let completion = match self.client.complete(&messages, &params) {
                Ok(completion) => completion,
                Err(err) => {
                    warn!(attempt, %err, "llm call failed");
                    let llm = fallback_decision(
                        None,
                        best_reasoning.clone(),
                        format!("llm_call_error: {}", err.kind()),
                    );
                    self.remember(observation, 1, llm.reasoning.clone());
                    return Decision {
                        action: 1,
                        llm,
                        usage,
                        cost_usd,
                    };
                }
            };
            usage.add(completion.usage);
            cost_usd += completion.cost_usd;

            match parse_reply(&completion.content) {
                Ok(parsed) if (1..=choice_count).contains(&parsed.result) => {
                    return self.accept(observation, &state_fp, avoid, parsed, usage, cost_usd);
                }
                Ok(parsed) => {
                    // Result present but out of range: fall back directly.
                    debug!(result = parsed.result, choice_count, "result out of range");
                    let llm = fallback_decision(
                        parsed.analysis,
                        parsed.reasoning,
                        "parse_error".to_string(),
                    );
                    self.remember(observation, 1, llm.reasoning.clone());
                    return Decision {
                        action: 1,
                        llm,
                        usage,
                        cost_usd,
                    };
                }
                Err(failure) => {
                    debug!(attempt, detail = %failure.detail, "reply parse failed");
                    if best_reasoning.is_none() {
                        best_reasoning = failure.reasoning;
                    }
                    if attempt < MAX_RETRIES {
                        messages.push(ChatMessage::user(schema_reminder(choice_count)));
                    }
                }
            }
        }

        let llm = fallback_decision(None, best_reasoning, "parse_error".to_string());
        self.remember(observation, 1, llm.reasoning.clone());
        Decision {
            action: 1,
            llm,
            usage,
            cost_usd,
        }
    }

    /// Finalize a valid model reply: loop override, tool pass, bookkeeping.
    fn accept(
        &mut self,
        observation: &Observation,
        state_fp: &str,
        avoid: Option<usize>,
        parsed: parse::ParsedReply,
        usage: Usage,
        cost_usd: f64,
    ) -> Decision {
        let choice_count = observation.choice_map.len();
        let model_action = parsed.result;
        self.guard.record_choice(state_fp, model_action);

        let (action, override_reason) = match avoid {
            Some(avoid) if avoid == model_action => match escape_action(model_action, choice_count)
            {
                Some(alternative) => {
                    debug!(model_action, alternative, "loop escape override");
                    (alternative, Some("loop_escape".to_string()))
                }
                None => (model_action, None),
            },
            _ => (model_action, None),
        };

        let tool_note = if self.config.tools.contains(&Tool::Calculator) {
            parsed
                .reasoning
                .as_deref()
                .and_then(run_calculator)
                .inspect(|note| self.memory.push_note(note.clone()))
        } else {
            None
        };

        self.remember(observation, action, parsed.reasoning.clone());
        Decision {
            action,
            llm: LlmDecision {
                analysis: parsed.analysis,
                reasoning: parsed.reasoning,
                result: Some(model_action),
                is_default: false,
                error: None,
                override_reason,
                tool_note,
            },
            usage,
            cost_usd,
        }
    }

    fn build_messages(&self, vars: &PromptVars<'_>) -> Result<Vec<ChatMessage>> {
        Ok(vec![
            ChatMessage::system(self.prompts.render_system()?),
            ChatMessage::user(self.prompts.render_action(vars)?),
        ])
    }

    fn remember(&mut self, observation: &Observation, action: usize, reasoning: Option<String>) {
        self.memory.record(MemoryEntry {
            observation: observation.text.clone(),
            choices: observation.choices_rendered.clone(),
            action,
            reasoning,
        });
    }

    /// Roll displaced history into the summary every `SUMMARY_INTERVAL`
    /// steps. Best effort: a failed summarizer call keeps the entries queued.
    fn maybe_summarize(&mut self, deadline: Instant) {
        if self.memory.kind() != MemoryKind::Summary
            || !self.memory.has_overflow()
            || self.memory.steps_recorded() == 0
            || self.memory.steps_recorded() % SUMMARY_INTERVAL != 0
        {
            return;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        let input = render_for_summary(self.memory.summary(), self.memory.overflow());
        let messages = vec![
            ChatMessage::system(
                "Summarize the playthrough history below into a few sentences. \
                 Keep facts that matter for future decisions.",
            ),
            ChatMessage::user(input),
        ];
        let params = CompletionParams {
            temperature: None,
            max_tokens: 256,
            timeout: remaining.min(Duration::from_secs(15)),
        };
        match self.client.complete(&messages, &params) {
            Ok(completion) if !completion.content.is_empty() => {
                self.memory.set_summary(completion.content);
                self.memory.clear_overflow();
            }
            Ok(_) => debug!("summarizer returned empty content, keeping overflow"),
            Err(err) => warn!(%err, "summarizer call failed, keeping overflow"),
        }
    }
}

fn fallback_decision(
    analysis: Option<String>,
    reasoning: Option<String>,
    error: String,
) -> LlmDecision {
    LlmDecision {
        analysis,
        reasoning,
        result: None,
        is_default: true,
        error: Some(error),
        override_reason: None,
        tool_note: None,
    }
}

fn schema_reminder(choice_count: usize) -> String {
    format!(
        "Your previous reply could not be parsed. Respond with exactly one JSON object: \
         {{\"analysis\": \"...\", \"reasoning\": \"...\", \"result\": <number between 1 and {choice_count}>}}"
    )
}
