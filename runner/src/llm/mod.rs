//! Provider-agnostic chat completion layer.
//!
//! [`client::LlmClient`] is the single call surface the agent uses; it owns
//! retry, backoff, and token/cost accounting. [`provider`] holds the closed
//! set of provider adapters behind the [`provider::ChatProvider`] seam, and
//! [`pricing`] the pure per-model price table.

pub mod client;
pub mod pricing;
pub mod provider;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use client::{CompletionParams, LlmClient};
pub use provider::{ChatProvider, ModelRef, ProviderKind};

/// Chat message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One chat message in provider-neutral shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Token usage for one completion call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    pub fn add(&mut self, other: Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// Result of a completed chat call, accounting included.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub content: String,
    pub usage: Usage,
    pub cost_usd: f64,
    pub finish_reason: String,
}

/// LLM call failure taxonomy.
///
/// Transient kinds are retried by the client with backoff; permanent kinds
/// are surfaced immediately and the agent falls back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LlmError {
    /// Network failure, 5xx, or call-level timeout.
    Transient { detail: String },
    /// Provider signalled rate limiting (429).
    RateLimited { detail: String },
    /// Credentials missing or rejected. Never retried.
    Auth { detail: String },
    /// Safety filter refused the request. Never retried.
    Refused { detail: String },
    /// Request the provider could not accept (400-class). Never retried.
    Malformed { detail: String },
}

impl LlmError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LlmError::Transient { .. } | LlmError::RateLimited { .. }
        )
    }

    /// Short classification tag recorded in step `llm_decision.error`.
    pub fn kind(&self) -> &'static str {
        match self {
            LlmError::Transient { .. } => "transient",
            LlmError::RateLimited { .. } => "rate_limited",
            LlmError::Auth { .. } => "auth",
            LlmError::Refused { .. } => "refused",
            LlmError::Malformed { .. } => "malformed",
        }
    }
}

impl fmt::Display for LlmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LlmError::Transient { detail } => write!(f, "transient llm error: {detail}"),
            LlmError::RateLimited { detail } => write!(f, "rate limited: {detail}"),
            LlmError::Auth { detail } => write!(f, "auth error: {detail}"),
            LlmError::Refused { detail } => write!(f, "safety refusal: {detail}"),
            LlmError::Malformed { detail } => write!(f, "malformed request: {detail}"),
        }
    }
}

impl std::error::Error for LlmError {}
