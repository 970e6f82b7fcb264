//! Retry, backoff, and accounting around a provider adapter.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use rand::Rng;
use tracing::{debug, instrument, warn};

use super::pricing::PriceTable;
use super::provider::{ChatProvider, ChatRequest, ModelRef, build_provider};
use super::{ChatMessage, Completion, LlmError};

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_JITTER: Duration = Duration::from_millis(250);

/// Per-call parameters for [`LlmClient::complete`].
#[derive(Debug, Clone)]
pub struct CompletionParams {
    pub temperature: Option<f32>,
    pub max_tokens: u32,
    /// Total wall-clock budget for the call, retries included.
    pub timeout: Duration,
}

impl Default for CompletionParams {
    fn default() -> Self {
        Self {
            temperature: None,
            max_tokens: 1024,
            timeout: Duration::from_secs(60),
        }
    }
}

/// Uniform completion surface over one provider adapter.
///
/// One client per run; the price table is shared, read-only state.
pub struct LlmClient {
    provider: Box<dyn ChatProvider>,
    model: String,
    prices: Arc<PriceTable>,
    max_attempts: u32,
}

impl LlmClient {
    /// Resolve `identifier` (`provider:model` or alias) and build the
    /// matching adapter. Missing credentials fail here, not mid-run.
    pub fn new(identifier: &str, prices: Arc<PriceTable>) -> Result<Self> {
        let model_ref = ModelRef::parse(identifier)?;
        let provider = build_provider(&model_ref)?;
        Ok(Self {
            provider,
            model: model_ref.model,
            prices,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        })
    }

    /// Build a client over an explicit adapter (scripted providers in tests).
    pub fn with_provider(
        provider: Box<dyn ChatProvider>,
        model: impl Into<String>,
        prices: Arc<PriceTable>,
    ) -> Self {
        Self {
            provider,
            model: model.into(),
            prices,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// One chat completion with bounded retries.
    ///
    /// Transient and rate-limit failures are retried with exponential backoff
    /// plus jitter while budget remains; auth errors and safety refusals are
    /// returned immediately. Absent content is normalized to an empty string
    /// with `finish_reason = "empty"` so the caller decides what it means.
    #[instrument(skip_all, fields(model = %self.model))]
    pub fn complete(
        &self,
        messages: &[ChatMessage],
        params: &CompletionParams,
    ) -> Result<Completion, LlmError> {
        let deadline = Instant::now() + params.timeout;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(LlmError::Transient {
                    detail: format!("call budget exhausted after {attempt} attempt(s)"),
                });
            }

            let request = ChatRequest {
                messages,
                model: &self.model,
                temperature: params.temperature,
                max_tokens: params.max_tokens,
                timeout: remaining,
            };
            match self.provider.complete(&request) {
                Ok(reply) => {
                    let (content, finish_reason) = match reply.content {
                        Some(content) => (
                            content,
                            reply.finish_reason.unwrap_or_else(|| "stop".to_string()),
                        ),
                        None => (String::new(), "empty".to_string()),
                    };
                    let usage = reply.usage.unwrap_or_default();
                    let cost_usd = self.prices.cost(&self.model, usage);
                    debug!(
                        attempt,
                        total_tokens = usage.total_tokens,
                        %finish_reason,
                        "completion ok"
                    );
                    return Ok(Completion {
                        content,
                        usage,
                        cost_usd,
                        finish_reason,
                    });
                }
                Err(err) if err.is_retryable() && attempt < self.max_attempts => {
                    let backoff = backoff_delay(attempt);
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining <= backoff {
                        return Err(err);
                    }
                    warn!(attempt, %err, backoff_ms = backoff.as_millis() as u64, "retrying completion");
                    thread::sleep(backoff);
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Exponential backoff with jitter: `base * 2^(attempt-1) + U(0, jitter)`.
fn backoff_delay(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE * 2u32.saturating_pow(attempt.saturating_sub(1));
    let jitter = rand::rng().random_range(0..=BACKOFF_JITTER.as_millis() as u64);
    exp + Duration::from_millis(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Usage;
    use crate::test_support::ScriptedProvider;

    fn params() -> CompletionParams {
        CompletionParams {
            temperature: None,
            max_tokens: 64,
            timeout: Duration::from_secs(5),
        }
    }

    fn client(provider: ScriptedProvider) -> LlmClient {
        LlmClient::with_provider(
            Box::new(provider),
            "gpt-4o",
            Arc::new(PriceTable::builtin()),
        )
    }

    #[test]
    fn transient_errors_are_retried_until_success() {
        let provider = ScriptedProvider::new(vec![
            Err(LlmError::Transient {
                detail: "connection reset".to_string(),
            }),
            Ok(ScriptedProvider::text_reply("{\"result\": 2}")),
        ]);
        let calls = provider.calls();
        let completion = client(provider)
            .complete(&[ChatMessage::user("hi")], &params())
            .expect("complete");
        assert_eq!(completion.content, "{\"result\": 2}");
        assert_eq!(*calls.lock().expect("calls"), 2);
    }

    #[test]
    fn auth_errors_are_not_retried() {
        let provider = ScriptedProvider::new(vec![Err(LlmError::Auth {
            detail: "bad key".to_string(),
        })]);
        let calls = provider.calls();
        let err = client(provider)
            .complete(&[ChatMessage::user("hi")], &params())
            .expect_err("auth");
        assert_eq!(err.kind(), "auth");
        assert_eq!(*calls.lock().expect("calls"), 1);
    }

    #[test]
    fn refusals_are_not_retried() {
        let provider = ScriptedProvider::new(vec![Err(LlmError::Refused {
            detail: "filtered".to_string(),
        })]);
        let err = client(provider)
            .complete(&[ChatMessage::user("hi")], &params())
            .expect_err("refused");
        assert_eq!(err.kind(), "refused");
    }

    #[test]
    fn null_content_becomes_empty_with_empty_finish_reason() {
        let provider = ScriptedProvider::new(vec![Ok(super::super::provider::ProviderReply {
            content: None,
            usage: None,
            finish_reason: Some("stop".to_string()),
        })]);
        let completion = client(provider)
            .complete(&[ChatMessage::user("hi")], &params())
            .expect("complete");
        assert_eq!(completion.content, "");
        assert_eq!(completion.finish_reason, "empty");
    }

    #[test]
    fn cost_is_derived_from_the_price_table() {
        let mut reply = ScriptedProvider::text_reply("ok");
        reply.usage = Some(Usage {
            prompt_tokens: 1_000_000,
            completion_tokens: 0,
            total_tokens: 1_000_000,
        });
        let provider = ScriptedProvider::new(vec![Ok(reply)]);
        let completion = client(provider)
            .complete(&[ChatMessage::user("hi")], &params())
            .expect("complete");
        assert!((completion.cost_usd - 2.50).abs() < 1e-9);
    }

    #[test]
    fn retries_stop_when_attempts_are_exhausted() {
        let provider = ScriptedProvider::new(vec![
            Err(LlmError::RateLimited {
                detail: "slow down".to_string(),
            }),
            Err(LlmError::RateLimited {
                detail: "slow down".to_string(),
            }),
            Err(LlmError::RateLimited {
                detail: "slow down".to_string(),
            }),
        ]);
        let calls = provider.calls();
        let err = client(provider)
            .complete(&[ChatMessage::user("hi")], &params())
            .expect_err("exhausted");
        assert_eq!(err.kind(), "rate_limited");
        assert_eq!(*calls.lock().expect("calls"), 3);
    }
}
