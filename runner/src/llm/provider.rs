//! Closed set of provider adapters behind the [`ChatProvider`] seam.
//!
//! Providers are selected by parsing a `provider:model` identifier with a
//! published alias table. `random_local` performs no network I/O and is the
//! canonical baseline. The OpenAI wire shape is shared by `openai`,
//! `deepseek`, and `openrouter`; `anthropic` and `google` speak their own
//! shapes.

use std::sync::{LazyLock, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{ChatMessage, LlmError, Role, Usage};

/// Provider family. Closed set; adding a member is a code change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Google,
    DeepSeek,
    OpenRouter,
    RandomLocal,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Google => "google",
            ProviderKind::DeepSeek => "deepseek",
            ProviderKind::OpenRouter => "openrouter",
            ProviderKind::RandomLocal => "random_local",
        }
    }

    fn from_str(name: &str) -> Option<Self> {
        match name {
            "openai" => Some(ProviderKind::OpenAi),
            "anthropic" => Some(ProviderKind::Anthropic),
            "google" => Some(ProviderKind::Google),
            "deepseek" => Some(ProviderKind::DeepSeek),
            "openrouter" => Some(ProviderKind::OpenRouter),
            "random_local" => Some(ProviderKind::RandomLocal),
            _ => None,
        }
    }

    /// Environment variable holding this provider's credential.
    pub fn key_env(self) -> Option<&'static str> {
        match self {
            ProviderKind::OpenAi => Some("OPENAI_API_KEY"),
            ProviderKind::Anthropic => Some("ANTHROPIC_API_KEY"),
            ProviderKind::Google => Some("GOOGLE_API_KEY"),
            ProviderKind::DeepSeek => Some("DEEPSEEK_API_KEY"),
            ProviderKind::OpenRouter => Some("OPENROUTER_API_KEY"),
            ProviderKind::RandomLocal => None,
        }
    }
}

/// Bare model names resolved without a `provider:` prefix.
const ALIASES: &[(&str, ProviderKind, &str)] = &[
    ("sonnet", ProviderKind::Anthropic, "claude-3-5-sonnet-latest"),
    ("haiku", ProviderKind::Anthropic, "claude-3-5-haiku-latest"),
    ("random", ProviderKind::RandomLocal, "random_local"),
    ("random_choice", ProviderKind::RandomLocal, "random_local"),
];

/// Parsed model identifier: provider, concrete model, optional RNG seed
/// (random_local only, from a `random_<seed>` suffix).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRef {
    pub provider: ProviderKind,
    pub model: String,
    pub seed: Option<u64>,
}

impl ModelRef {
    /// Parse `provider:model`, a published alias, or a prefixed bare name.
    pub fn parse(identifier: &str) -> Result<Self> {
        let identifier = identifier.trim();
        if identifier.is_empty() {
            return Err(anyhow!("model identifier is empty"));
        }

        if let Some((provider_name, model)) = identifier.split_once(':') {
            let provider = ProviderKind::from_str(provider_name)
                .ok_or_else(|| anyhow!("unknown provider '{provider_name}'"))?;
            return Ok(Self {
                provider,
                model: model.to_string(),
                seed: None,
            });
        }

        for (alias, provider, model) in ALIASES {
            if identifier == *alias {
                return Ok(Self {
                    provider: *provider,
                    model: model.to_string(),
                    seed: None,
                });
            }
        }

        // Seeded baseline: random_<seed> or random_choice_<seed>.
        if let Some(rest) = identifier
            .strip_prefix("random_choice_")
            .or_else(|| identifier.strip_prefix("random_"))
        {
            let seed = rest
                .parse::<u64>()
                .map_err(|_| anyhow!("invalid random seed '{rest}'"))?;
            return Ok(Self {
                provider: ProviderKind::RandomLocal,
                model: "random_local".to_string(),
                seed: Some(seed),
            });
        }

        let provider = if identifier.starts_with("gpt-") {
            ProviderKind::OpenAi
        } else if identifier.starts_with("claude") {
            ProviderKind::Anthropic
        } else if identifier.starts_with("gemini") {
            ProviderKind::Google
        } else if identifier.starts_with("deepseek") {
            ProviderKind::DeepSeek
        } else {
            return Err(anyhow!(
                "cannot resolve model '{identifier}' (use provider:model or a known alias)"
            ));
        };
        Ok(Self {
            provider,
            model: identifier.to_string(),
            seed: None,
        })
    }
}

/// One completion request as seen by an adapter.
#[derive(Debug, Clone)]
pub struct ChatRequest<'a> {
    pub messages: &'a [ChatMessage],
    pub model: &'a str,
    pub temperature: Option<f32>,
    pub max_tokens: u32,
    pub timeout: Duration,
}

/// Raw adapter reply before the client normalizes it.
#[derive(Debug, Clone, Default)]
pub struct ProviderReply {
    /// `None` when the provider returned a message with absent content.
    pub content: Option<String>,
    pub usage: Option<Usage>,
    pub finish_reason: Option<String>,
}

/// Uniform capability every provider adapter implements.
pub trait ChatProvider: Send + Sync {
    fn complete(&self, request: &ChatRequest<'_>) -> Result<ProviderReply, LlmError>;
}

/// Build the adapter for a parsed model reference. Credentials are read from
/// the provider's environment variable; a missing key is an auth failure at
/// construction time, not at call time.
pub fn build_provider(model_ref: &ModelRef) -> Result<Box<dyn ChatProvider>> {
    if model_ref.provider == ProviderKind::RandomLocal {
        return Ok(Box::new(RandomLocalProvider::new(model_ref.seed)));
    }

    let env = model_ref
        .provider
        .key_env()
        .expect("remote providers have a key env");
    let api_key = std::env::var(env).map_err(|_| anyhow!("{env} environment variable not set"))?;

    Ok(match model_ref.provider {
        ProviderKind::OpenAi => Box::new(OpenAiCompatProvider::new(
            "https://api.openai.com/v1",
            api_key,
        )),
        ProviderKind::DeepSeek => Box::new(OpenAiCompatProvider::new(
            "https://api.deepseek.com/v1",
            api_key,
        )),
        ProviderKind::OpenRouter => Box::new(OpenAiCompatProvider::new(
            "https://openrouter.ai/api/v1",
            api_key,
        )),
        ProviderKind::Anthropic => Box::new(AnthropicProvider::new(api_key)),
        ProviderKind::Google => Box::new(GoogleProvider::new(api_key)),
        ProviderKind::RandomLocal => unreachable!("handled above"),
    })
}

fn status_error(status: reqwest::StatusCode, body: &str) -> LlmError {
    let detail = format!("{status}: {}", body.chars().take(300).collect::<String>());
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        LlmError::RateLimited { detail }
    } else if status == reqwest::StatusCode::UNAUTHORIZED
        || status == reqwest::StatusCode::FORBIDDEN
    {
        LlmError::Auth { detail }
    } else if status.is_server_error() {
        LlmError::Transient { detail }
    } else {
        LlmError::Malformed { detail }
    }
}

fn transport_error(err: reqwest::Error) -> LlmError {
    LlmError::Transient {
        detail: err.to_string(),
    }
}

/// OpenAI chat-completions wire shape, shared by openai/deepseek/openrouter.
struct OpenAiCompatProvider {
    base_url: String,
    api_key: String,
    http: reqwest::blocking::Client,
}

impl OpenAiCompatProvider {
    fn new(base_url: &str, api_key: String) -> Self {
        Self {
            base_url: base_url.to_string(),
            api_key,
            http: reqwest::blocking::Client::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiMessage {
    // Observed edge case: providers return a message object with content
    // null. The adapter must not fail on field access.
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
    total_tokens: u64,
}

impl ChatProvider for OpenAiCompatProvider {
    fn complete(&self, request: &ChatRequest<'_>) -> Result<ProviderReply, LlmError> {
        let mut body = json!({
            "model": request.model,
            "messages": request.messages,
            "max_tokens": request.max_tokens,
        });
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .timeout(request.timeout)
            .json(&body)
            .send()
            .map_err(transport_error)?;

        let status = response.status();
        let text = response.text().map_err(transport_error)?;
        if !status.is_success() {
            return Err(status_error(status, &text));
        }

        let parsed: OpenAiResponse = serde_json::from_str(&text).map_err(|err| {
            LlmError::Transient {
                detail: format!("unparseable completion response: {err}"),
            }
        })?;
        let choice = parsed.choices.into_iter().next();
        let finish_reason = choice.as_ref().and_then(|c| c.finish_reason.clone());
        if finish_reason.as_deref() == Some("content_filter") {
            return Err(LlmError::Refused {
                detail: "completion stopped by content filter".to_string(),
            });
        }
        Ok(ProviderReply {
            content: choice.and_then(|c| c.message.content),
            usage: parsed.usage.map(|usage| Usage {
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
                total_tokens: usage.total_tokens,
            }),
            finish_reason,
        })
    }
}

/// Anthropic messages API adapter.
struct AnthropicProvider {
    api_key: String,
    http: reqwest::blocking::Client,
}

impl AnthropicProvider {
    fn new(api_key: String) -> Self {
        Self {
            api_key,
            http: reqwest::blocking::Client::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    content: Vec<AnthropicContent>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
struct AnthropicContent {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u64,
    output_tokens: u64,
}

impl ChatProvider for AnthropicProvider {
    fn complete(&self, request: &ChatRequest<'_>) -> Result<ProviderReply, LlmError> {
        let system: Vec<&str> = request
            .messages
            .iter()
            .filter(|message| message.role == Role::System)
            .map(|message| message.content.as_str())
            .collect();
        let messages: Vec<&ChatMessage> = request
            .messages
            .iter()
            .filter(|message| message.role != Role::System)
            .collect();

        let mut body = json!({
            "model": request.model,
            "max_tokens": request.max_tokens,
            "messages": messages,
        });
        if !system.is_empty() {
            body["system"] = json!(system.join("\n\n"));
        }
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }

        let response = self
            .http
            .post("https://api.anthropic.com/v1/messages")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .timeout(request.timeout)
            .json(&body)
            .send()
            .map_err(transport_error)?;

        let status = response.status();
        let text = response.text().map_err(transport_error)?;
        if !status.is_success() {
            return Err(status_error(status, &text));
        }

        let parsed: AnthropicResponse =
            serde_json::from_str(&text).map_err(|err| LlmError::Transient {
                detail: format!("unparseable messages response: {err}"),
            })?;
        if parsed.stop_reason.as_deref() == Some("refusal") {
            return Err(LlmError::Refused {
                detail: "model refused the request".to_string(),
            });
        }
        Ok(ProviderReply {
            content: parsed.content.into_iter().find_map(|block| block.text),
            usage: parsed.usage.map(|usage| Usage {
                prompt_tokens: usage.input_tokens,
                completion_tokens: usage.output_tokens,
                total_tokens: usage.input_tokens + usage.output_tokens,
            }),
            finish_reason: parsed.stop_reason,
        })
    }
}

/// Google Gemini generateContent adapter.
struct GoogleProvider {
    api_key: String,
    http: reqwest::blocking::Client,
}

impl GoogleProvider {
    fn new(api_key: String) -> Self {
        Self {
            api_key,
            http: reqwest::blocking::Client::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GoogleResponse {
    #[serde(default)]
    candidates: Vec<GoogleCandidate>,
    #[serde(default, rename = "usageMetadata")]
    usage_metadata: Option<GoogleUsage>,
}

#[derive(Debug, Deserialize)]
struct GoogleCandidate {
    #[serde(default)]
    content: Option<GoogleContent>,
    #[serde(default, rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GoogleContent {
    #[serde(default)]
    parts: Vec<GooglePart>,
}

#[derive(Debug, Deserialize)]
struct GooglePart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GoogleUsage {
    #[serde(default, rename = "promptTokenCount")]
    prompt_token_count: u64,
    #[serde(default, rename = "candidatesTokenCount")]
    candidates_token_count: u64,
    #[serde(default, rename = "totalTokenCount")]
    total_token_count: u64,
}

impl ChatProvider for GoogleProvider {
    fn complete(&self, request: &ChatRequest<'_>) -> Result<ProviderReply, LlmError> {
        let system: Vec<&str> = request
            .messages
            .iter()
            .filter(|message| message.role == Role::System)
            .map(|message| message.content.as_str())
            .collect();
        let contents: Vec<serde_json::Value> = request
            .messages
            .iter()
            .filter(|message| message.role != Role::System)
            .map(|message| {
                let role = match message.role {
                    Role::Assistant => "model",
                    _ => "user",
                };
                json!({"role": role, "parts": [{"text": message.content}]})
            })
            .collect();

        let mut body = json!({
            "contents": contents,
            "generationConfig": {"maxOutputTokens": request.max_tokens},
        });
        if !system.is_empty() {
            body["systemInstruction"] = json!({"parts": [{"text": system.join("\n\n")}]});
        }
        if let Some(temperature) = request.temperature {
            body["generationConfig"]["temperature"] = json!(temperature);
        }

        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent?key={}",
            request.model, self.api_key
        );
        let response = self
            .http
            .post(url)
            .timeout(request.timeout)
            .json(&body)
            .send()
            .map_err(transport_error)?;

        let status = response.status();
        let text = response.text().map_err(transport_error)?;
        if !status.is_success() {
            return Err(status_error(status, &text));
        }

        let parsed: GoogleResponse =
            serde_json::from_str(&text).map_err(|err| LlmError::Transient {
                detail: format!("unparseable generateContent response: {err}"),
            })?;
        let candidate = parsed.candidates.into_iter().next();
        let finish_reason = candidate.as_ref().and_then(|c| c.finish_reason.clone());
        if finish_reason.as_deref() == Some("SAFETY") {
            return Err(LlmError::Refused {
                detail: "candidate blocked by safety filter".to_string(),
            });
        }
        Ok(ProviderReply {
            content: candidate
                .and_then(|c| c.content)
                .and_then(|content| content.parts.into_iter().find_map(|part| part.text)),
            usage: parsed.usage_metadata.map(|usage| Usage {
                prompt_tokens: usage.prompt_token_count,
                completion_tokens: usage.candidates_token_count,
                total_tokens: usage.total_token_count,
            }),
            finish_reason,
        })
    }
}

/// Local baseline: replies with a uniformly random valid choice index.
///
/// The choice range is recovered from the numbered action list in the last
/// user message, the same list every agent prompt renders.
pub struct RandomLocalProvider {
    rng: Mutex<StdRng>,
}

impl RandomLocalProvider {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            rng: Mutex::new(rng),
        }
    }

    fn choice_count(prompt: &str) -> usize {
        static NUMBERED: LazyLock<Regex> =
            LazyLock::new(|| Regex::new(r"(?m)^\s*(\d+)\.\s").expect("static regex"));
        NUMBERED
            .captures_iter(prompt)
            .filter_map(|captures| captures[1].parse::<usize>().ok())
            .max()
            .unwrap_or(1)
    }
}

impl ChatProvider for RandomLocalProvider {
    fn complete(&self, request: &ChatRequest<'_>) -> Result<ProviderReply, LlmError> {
        let prompt = request
            .messages
            .iter()
            .rev()
            .find(|message| message.role == Role::User)
            .map(|message| message.content.as_str())
            .unwrap_or_default();
        let count = Self::choice_count(prompt);
        let index = self
            .rng
            .lock()
            .expect("rng lock poisoned")
            .random_range(1..=count);
        debug!(count, index, "random_local pick");
        Ok(ProviderReply {
            content: Some(format!("{{\"result\": {index}}}")),
            usage: Some(Usage::default()),
            finish_reason: Some("stop".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_explicit_provider_model() {
        let parsed = ModelRef::parse("anthropic:claude-3-5-sonnet-latest").expect("parse");
        assert_eq!(parsed.provider, ProviderKind::Anthropic);
        assert_eq!(parsed.model, "claude-3-5-sonnet-latest");
        assert_eq!(parsed.seed, None);
    }

    #[test]
    fn resolves_aliases_and_prefixes() {
        assert_eq!(
            ModelRef::parse("sonnet").expect("alias").model,
            "claude-3-5-sonnet-latest"
        );
        assert_eq!(
            ModelRef::parse("gpt-4o").expect("prefix").provider,
            ProviderKind::OpenAi
        );
        assert_eq!(
            ModelRef::parse("deepseek-chat").expect("prefix").provider,
            ProviderKind::DeepSeek
        );
        assert_eq!(
            ModelRef::parse("random").expect("alias").provider,
            ProviderKind::RandomLocal
        );
    }

    #[test]
    fn random_seed_suffix_is_extracted() {
        let parsed = ModelRef::parse("random_42").expect("parse");
        assert_eq!(parsed.provider, ProviderKind::RandomLocal);
        assert_eq!(parsed.seed, Some(42));

        let parsed = ModelRef::parse("random_choice_7").expect("parse");
        assert_eq!(parsed.seed, Some(7));
    }

    #[test]
    fn unknown_identifier_is_rejected() {
        let err = ModelRef::parse("mystery-model").expect_err("unknown");
        assert!(err.to_string().contains("cannot resolve"));
    }

    #[test]
    fn random_local_is_reproducible_and_in_range() {
        let prompt = "You are here.\n\nAvailable actions:\n1. left\n2. right\n3. wait\n";
        let request = ChatRequest {
            messages: &[ChatMessage::user(prompt)],
            model: "random_local",
            temperature: None,
            max_tokens: 64,
            timeout: Duration::from_secs(1),
        };

        let provider_a = RandomLocalProvider::new(Some(1));
        let provider_b = RandomLocalProvider::new(Some(1));
        for _ in 0..10 {
            let a = provider_a.complete(&request).expect("a");
            let b = provider_b.complete(&request).expect("b");
            assert_eq!(a.content, b.content);
            let content = a.content.expect("content");
            let parsed: serde_json::Value = serde_json::from_str(&content).expect("json");
            let index = parsed["result"].as_u64().expect("result");
            assert!((1..=3).contains(&index));
        }
    }

    #[test]
    fn random_local_defaults_to_one_without_choice_list() {
        let provider = RandomLocalProvider::new(Some(5));
        let request = ChatRequest {
            messages: &[ChatMessage::user("no numbered list here")],
            model: "random_local",
            temperature: None,
            max_tokens: 64,
            timeout: Duration::from_secs(1),
        };
        let reply = provider.complete(&request).expect("reply");
        assert_eq!(reply.content.as_deref(), Some("{\"result\": 1}"));
    }
}
