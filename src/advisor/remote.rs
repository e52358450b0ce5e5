//! Remote strategy advisor over an OpenAI-compatible chat completions API

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};

use super::{DecisionAdvice, DecisionContext, ReflectionAdvice, ReflectionContext, StrategyAdvisor};
use crate::config::AdvisorConfig;
use crate::domain::FeedbackTag;
use crate::error::{ArenaError, Result};

const SYSTEM_PROMPT: &str = "You advise simulated trading agents in an evolutionary arena. \
Stay in the agent's personality, use only the pattern ids you are given, and answer with a \
single JSON object and nothing else.";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Clone, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

/// Lenient decision payload; models drift on key names.
#[derive(Debug, Deserialize)]
struct RawDecision {
    #[serde(alias = "patterns", alias = "selected", alias = "pattern_ids")]
    selected_patterns: Vec<String>,
    #[serde(default, alias = "reasoning")]
    rationale: String,
    confidence: f64,
}

#[derive(Debug, Deserialize)]
struct RawReflection {
    #[serde(alias = "analysis")]
    reflection: String,
    #[serde(default, alias = "lesson")]
    lessons: LessonText,
    #[serde(default, alias = "adjustment")]
    strategy_adjustment: String,
    #[serde(default, alias = "feedback")]
    pattern_feedback: HashMap<String, String>,
}

/// Lessons arrive either as one string or a list of bullet strings
#[derive(Debug, Default, Deserialize)]
#[serde(untagged)]
enum LessonText {
    #[default]
    Missing,
    One(String),
    Many(Vec<String>),
}

impl LessonText {
    fn into_string(self) -> String {
        match self {
            LessonText::Missing => String::new(),
            LessonText::One(s) => s,
            LessonText::Many(v) => v.join("; "),
        }
    }
}

fn parse_feedback_tag(raw: &str) -> Option<FeedbackTag> {
    match raw.trim().to_lowercase().replace(['-', ' '], "_").as_str() {
        "increase_preference" | "increase" | "up" => Some(FeedbackTag::IncreasePreference),
        "decrease_preference" | "decrease" | "down" => Some(FeedbackTag::DecreasePreference),
        "neutral" | "none" => Some(FeedbackTag::Neutral),
        _ => None,
    }
}

/// Parse a decision out of free-form model output.
pub fn parse_decision(text: &str) -> Result<DecisionAdvice> {
    let json = extract_json(text).ok_or_else(|| {
        ArenaError::MalformedOracleResponse("no JSON object in decision response".to_string())
    })?;
    let raw: RawDecision = serde_json::from_str(json)
        .map_err(|e| ArenaError::MalformedOracleResponse(format!("decision: {}", e)))?;
    Ok(DecisionAdvice {
        selected_patterns: raw.selected_patterns,
        rationale: raw.rationale,
        confidence: raw.confidence,
    })
}

/// Parse a reflection out of free-form model output. Unrecognised tags count
/// as neutral.
pub fn parse_reflection(text: &str) -> Result<ReflectionAdvice> {
    let json = extract_json(text).ok_or_else(|| {
        ArenaError::MalformedOracleResponse("no JSON object in reflection response".to_string())
    })?;
    let raw: RawReflection = serde_json::from_str(json)
        .map_err(|e| ArenaError::MalformedOracleResponse(format!("reflection: {}", e)))?;

    let pattern_feedback = raw
        .pattern_feedback
        .into_iter()
        .map(|(id, tag)| {
            let parsed = parse_feedback_tag(&tag).unwrap_or_else(|| {
                debug!(pattern_id = %id, tag = %tag, "unrecognised feedback tag, treating as neutral");
                FeedbackTag::Neutral
            });
            (id, parsed)
        })
        .collect();

    Ok(ReflectionAdvice {
        reflection: raw.reflection,
        lessons: raw.lessons.into_string(),
        strategy_adjustment: raw.strategy_adjustment,
        pattern_feedback,
    })
}

/// First well-formed JSON object embedded in `text`.
///
/// Scans for `{`, matches braces while skipping string literals, and returns
/// the first balanced candidate that parses. Code fences and surrounding
/// prose are ignored.
pub fn extract_json(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    let mut start = 0;
    while let Some(offset) = text[start..].find('{') {
        let open = start + offset;
        if let Some(close) = matching_brace(bytes, open) {
            let candidate = &text[open..=close];
            if serde_json::from_str::<serde_json::Value>(candidate)
                .map(|v| v.is_object())
                .unwrap_or(false)
            {
                return Some(candidate);
            }
        }
        start = open + 1;
    }
    None
}

fn matching_brace(bytes: &[u8], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(open) {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// HTTP advisor client
pub struct RemoteAdvisor {
    config: AdvisorConfig,
    http: Client,
}

impl RemoteAdvisor {
    pub fn new(config: AdvisorConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| ArenaError::Internal(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { config, http })
    }

    /// One chat completion round trip; returns the first choice's content.
    pub async fn chat(&self, prompt: &str) -> Result<String> {
        let request = ChatRequest {
            model: self.config.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: prompt.to_string(),
                },
            ],
            temperature: Some(self.config.temperature),
            max_tokens: Some(self.config.max_tokens),
        };

        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let response = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!(%status, "advisor API error");
            return Err(ArenaError::OracleUnavailable(format!(
                "advisor API error: {} - {}",
                status, body
            )));
        }

        let chat: ChatResponse = response.json().await?;
        let content = chat
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| ArenaError::MalformedOracleResponse("empty choices".to_string()))?;

        debug!(chars = content.len(), "advisor response received");
        Ok(content)
    }
}

#[async_trait]
impl StrategyAdvisor for RemoteAdvisor {
    fn name(&self) -> &'static str {
        "remote"
    }

    fn is_enabled(&self) -> bool {
        self.config.is_configured()
    }

    async fn decide(&self, ctx: &DecisionContext) -> Result<DecisionAdvice> {
        let text = self.chat(&ctx.to_prompt()).await?;
        parse_decision(&text)
    }

    async fn reflect(&self, ctx: &ReflectionContext) -> Result<ReflectionAdvice> {
        let text = self.chat(&ctx.to_prompt()).await?;
        parse_reflection(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_from_fenced_block() {
        let text = "Sure!\n```json\n{\"a\": 1}\n```\nGood luck.";
        assert_eq!(extract_json(text), Some("{\"a\": 1}"));
    }

    #[test]
    fn test_extract_json_skips_braces_in_prose_and_strings() {
        let text = r#"Using {placeholder} syntax: {"rationale": "close } early", "n": {"x": 2}} trailing }"#;
        assert_eq!(
            extract_json(text),
            Some(r#"{"rationale": "close } early", "n": {"x": 2}}"#)
        );
    }

    #[test]
    fn test_extract_json_none_without_object() {
        assert_eq!(extract_json("no json here"), None);
        assert_eq!(extract_json("{ unbalanced"), None);
    }

    #[test]
    fn test_parse_decision_with_aliases() {
        let advice = parse_decision(
            r#"My pick: {"patterns": ["p1", "p2"], "reasoning": "trend", "confidence": 0.7}"#,
        )
        .unwrap();
        assert_eq!(advice.selected_patterns, vec!["p1", "p2"]);
        assert_eq!(advice.rationale, "trend");
    }

    #[test]
    fn test_parse_decision_missing_field_is_malformed() {
        let err = parse_decision(r#"{"selected_patterns": ["p1", "p2"]}"#).unwrap_err();
        assert!(matches!(err, ArenaError::MalformedOracleResponse(_)));
    }

    #[test]
    fn test_parse_reflection_normalises_tags() {
        let advice = parse_reflection(
            r#"{"reflection": "ok", "lessons": ["a", "b"], "pattern_feedback": {"p1": "Increase", "p2": "whatever", "p3": "decrease-preference"}}"#,
        )
        .unwrap();
        assert_eq!(advice.lessons, "a; b");
        assert_eq!(advice.pattern_feedback["p1"], FeedbackTag::IncreasePreference);
        assert_eq!(advice.pattern_feedback["p2"], FeedbackTag::Neutral);
        assert_eq!(advice.pattern_feedback["p3"], FeedbackTag::DecreasePreference);
    }

    #[test]
    fn test_unconfigured_remote_is_disabled() {
        let advisor = RemoteAdvisor::new(AdvisorConfig::default()).unwrap();
        assert!(!advisor.is_enabled());
    }
}
