//! Reply parsing for the LLM decision contract.
//!
//! The model is asked for `{"analysis": ..., "reasoning": ..., "result": N}`.
//! Real replies arrive fenced, truncated, or wrapped in prose, so parsing is
//! a ladder: strict JSON, fence-stripped JSON, the outermost brace span, and
//! finally regex recovery of individual fields. A reply that yields no
//! `result` is a parse failure carrying whatever rationale was recoverable.

use regex::Regex;
use serde::Deserialize;
use std::sync::LazyLock;

/// Successfully parsed reply. `result` is 1-based and still unvalidated
/// against the current choice count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedReply {
    pub analysis: Option<String>,
    pub reasoning: Option<String>,
    pub result: usize,
}

/// Parse failure with the best rationale recovered from the raw text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseFailure {
    pub reasoning: Option<String>,
    pub detail: String,
}

#[derive(Debug, Deserialize)]
struct RawReply {
    #[serde(default)]
    analysis: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    result: Option<i64>,
}

static FENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:json)?\s*(.*?)\s*```").expect("static regex"));
static RESULT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""result"\s*:\s*(\d+)"#).expect("static regex"));
static REASONING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""reasoning"\s*:\s*"((?:[^"\\]|\\.)*)"#).expect("static regex")
});
static ANALYSIS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""analysis"\s*:\s*"((?:[^"\\]|\\.)*)"#).expect("static regex"));

/// Parse a raw model reply into the decision contract.
pub fn parse_reply(raw: &str) -> Result<ParsedReply, ParseFailure> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ParseFailure {
            reasoning: None,
            detail: "empty reply".to_string(),
        });
    }

    for candidate in candidates(trimmed) {
        if let Ok(reply) = serde_json::from_str::<RawReply>(&candidate)
            && let Some(parsed) = normalize(reply)
        {
            return Ok(parsed);
        }
    }

    // Truncated or interleaved JSON: recover fields by substring match.
    let analysis = capture(&ANALYSIS_RE, trimmed);
    let reasoning = capture(&REASONING_RE, trimmed);
    if let Some(result) = RESULT_RE
        .captures(trimmed)
        .and_then(|captures| captures[1].parse::<usize>().ok())
    {
        return Ok(finish(analysis, reasoning, result));
    }

    // A bare integer reply is accepted; some models answer with the number.
    if let Ok(result) = trimmed.parse::<usize>() {
        return Ok(finish(None, None, result));
    }

    Err(ParseFailure {
        reasoning: reasoning.or(analysis),
        detail: "no result field recoverable".to_string(),
    })
}

/// Candidate JSON spans in decreasing strictness.
fn candidates(trimmed: &str) -> Vec<String> {
    let mut out = vec![trimmed.to_string()];
    if let Some(captures) = FENCE_RE.captures(trimmed) {
        out.push(captures[1].to_string());
    }
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && start < end
    {
        out.push(trimmed[start..=end].to_string());
    }
    out
}

fn normalize(reply: RawReply) -> Option<ParsedReply> {
    let result = reply.result?;
    let result = usize::try_from(result).ok()?;
    Some(finish(reply.analysis, reply.reasoning, result))
}

/// Recovered `analysis` without `reasoning` is promoted so logs always carry
/// a rationale instead of a raw-response fallback.
fn finish(analysis: Option<String>, reasoning: Option<String>, result: usize) -> ParsedReply {
    match (analysis, reasoning) {
        (Some(analysis), None) => ParsedReply {
            analysis: None,
            reasoning: Some(analysis),
            result,
        },
        (analysis, reasoning) => ParsedReply {
            analysis,
            reasoning,
            result,
        },
    }
}

fn capture(regex: &Regex, text: &str) -> Option<String> {
    regex
        .captures(text)
        .map(|captures| captures[1].to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_json_parses() {
        let reply =
            parse_reply(r#"{"analysis": "two doors", "reasoning": "left is safer", "result": 1}"#)
                .expect("parse");
        assert_eq!(reply.result, 1);
        assert_eq!(reply.analysis.as_deref(), Some("two doors"));
        assert_eq!(reply.reasoning.as_deref(), Some("left is safer"));
    }

    #[test]
    fn fenced_json_parses() {
        let raw = "Here is my choice:\n```json\n{\"reasoning\": \"go\", \"result\": 2}\n```";
        let reply = parse_reply(raw).expect("parse");
        assert_eq!(reply.result, 2);
        assert_eq!(reply.reasoning.as_deref(), Some("go"));
    }

    #[test]
    fn truncated_json_recovers_fields() {
        let raw = r#"{"analysis": "the bridge looks unstable", "reasoning": "take the detour", "result": 3, "confid"#;
        let reply = parse_reply(raw).expect("parse");
        assert_eq!(reply.result, 3);
        assert_eq!(reply.reasoning.as_deref(), Some("take the detour"));
    }

    #[test]
    fn analysis_only_is_promoted_to_reasoning() {
        let raw = r#"{"analysis": "door is locked", "result": 2}"#;
        let reply = parse_reply(raw).expect("parse");
        assert_eq!(reply.reasoning.as_deref(), Some("door is locked"));
        assert_eq!(reply.analysis, None);
    }

    #[test]
    fn bare_integer_is_accepted() {
        let reply = parse_reply("  2  ").expect("parse");
        assert_eq!(reply.result, 2);
    }

    #[test]
    fn failure_preserves_partial_reasoning() {
        let raw = r#"{"reasoning": "I think the left path"#;
        let failure = parse_reply(raw).expect_err("no result");
        assert_eq!(failure.reasoning.as_deref(), Some("I think the left path"));
    }

    #[test]
    fn empty_reply_fails() {
        let failure = parse_reply("").expect_err("empty");
        assert_eq!(failure.detail, "empty reply");
        assert_eq!(failure.reasoning, None);
    }

    #[test]
    fn prose_without_result_fails() {
        let failure = parse_reply("I would go left, probably.").expect_err("prose");
        assert!(failure.detail.contains("no result"));
    }
}
