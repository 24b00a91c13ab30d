//! LLM-as-judge scoring.
//!
//! The judge makes a single LLM call per judgment and never surfaces an
//! error to the evaluation pipeline: transport failures and unparsable
//! responses both degrade to a zero score with diagnostic reasoning.
//! Judge calls are not retried; one judge miss must not stall a run.

use crate::config::JudgeConfig;
use crate::llm::{ChatApi, ChatRequest, Message, Prompts};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Outcome of parsing a judge response.
///
/// The judge is instructed to return `{"score": float, "reasoning": string}`.
/// Anything that does not validate against that schema lands in
/// [`JudgeVerdict::Unparseable`] with the raw payload preserved.
#[derive(Debug, Clone, PartialEq)]
pub enum JudgeVerdict {
    Parsed { score: f64, reasoning: String },
    Unparseable { raw: String },
}

#[derive(Debug, Deserialize)]
struct RawVerdict {
    score: f64,
    reasoning: String,
}

impl JudgeVerdict {
    /// Parse a judge response, tolerating code fences around the JSON.
    pub fn parse(response: &str) -> Self {
        let json_str = extract_json(response);

        match serde_json::from_str::<RawVerdict>(&json_str) {
            Ok(raw) => JudgeVerdict::Parsed {
                score: raw.score.clamp(0.0, 1.0),
                reasoning: raw.reasoning,
            },
            Err(_) => JudgeVerdict::Unparseable {
                raw: response.to_string(),
            },
        }
    }

    /// The score this verdict contributes. Unparseable responses score 0.0.
    pub fn score(&self) -> f64 {
        match self {
            JudgeVerdict::Parsed { score, .. } => *score,
            JudgeVerdict::Unparseable { .. } => 0.0,
        }
    }

    /// Human-readable reasoning, including the raw payload when parsing failed.
    pub fn reasoning(&self) -> String {
        match self {
            JudgeVerdict::Parsed { reasoning, .. } => reasoning.clone(),
            JudgeVerdict::Unparseable { raw } => {
                format!("Invalid JSON from judge: {}", raw)
            }
        }
    }
}

/// Extract JSON from a response that may be fenced or surrounded by prose.
fn extract_json(response: &str) -> String {
    let response = response.trim();

    if response.starts_with("```json") {
        if let Some(end) = response.rfind("```") {
            let start = "```json".len();
            if end > start {
                return response[start..end].trim().to_string();
            }
        }
    }

    if response.starts_with("```") {
        if let Some(end) = response.rfind("```") {
            let start = response.find('\n').map(|n| n + 1).unwrap_or(3);
            if end > start {
                return response[start..end].trim().to_string();
            }
        }
    }

    if let Some(start) = response.find('{') {
        if let Some(end) = response.rfind('}') {
            if end > start {
                return response[start..=end].to_string();
            }
        }
    }

    response.to_string()
}

/// LLM-as-judge for scoring candidate answers.
pub struct LlmJudge<C: ChatApi> {
    api: Arc<C>,
    config: JudgeConfig,
}

impl<C: ChatApi> LlmJudge<C> {
    /// Create a new judge backed by the given chat API.
    pub fn new(api: Arc<C>, config: JudgeConfig) -> Self {
        Self { api, config }
    }

    /// Score a candidate answer against the expected answer.
    ///
    /// Returns `(score, reasoning)` and never fails.
    pub async fn score_answer(&self, expected: &str, candidate: &str) -> (f64, String) {
        let prompt = Prompts::judge_answer()
            .replace("{expected}", expected)
            .replace("{answer}", candidate);

        self.judge(prompt).await
    }

    /// Score whether a generated answer is grounded in the retrieved context.
    pub async fn judge_grounding(
        &self,
        question: &str,
        context: &str,
        answer: &str,
    ) -> (f64, String) {
        let prompt = Prompts::judge_grounding()
            .replace("{question}", question)
            .replace("{context}", context)
            .replace("{answer}", answer);

        self.judge(prompt).await
    }

    async fn judge(&self, prompt: String) -> (f64, String) {
        let request = ChatRequest {
            model: self.config.model.clone(),
            messages: vec![Message::system(Prompts::system_judge()), Message::user(prompt)],
            max_tokens: self.config.max_tokens,
            temperature: 0.0,
            timeout: Duration::from_secs(self.config.timeout_secs),
        };

        match self.api.chat(request).await {
            Ok(response) => {
                let verdict = JudgeVerdict::parse(&response.content);
                if matches!(verdict, JudgeVerdict::Unparseable { .. }) {
                    warn!(model = %self.config.model, "judge returned unparsable payload");
                }
                (verdict.score(), verdict.reasoning())
            }
            Err(e) => (0.0, format!("Judge call failed: {}", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{CallError, LlmResponse};
    use async_trait::async_trait;

    struct ScriptedApi {
        response: std::result::Result<String, CallError>,
    }

    #[async_trait]
    impl ChatApi for ScriptedApi {
        async fn chat(
            &self,
            _request: ChatRequest,
        ) -> std::result::Result<LlmResponse, CallError> {
            self.response.clone().map(|content| LlmResponse {
                content,
                finish_reason: Some("stop".to_string()),
                usage: None,
            })
        }
    }

    fn judge_with(response: std::result::Result<String, CallError>) -> LlmJudge<ScriptedApi> {
        LlmJudge::new(Arc::new(ScriptedApi { response }), JudgeConfig::default())
    }

    #[test]
    fn test_parse_valid_verdict() {
        let verdict = JudgeVerdict::parse(r#"{"score": 0.7, "reasoning": "mostly right"}"#);
        assert_eq!(
            verdict,
            JudgeVerdict::Parsed {
                score: 0.7,
                reasoning: "mostly right".to_string()
            }
        );
    }

    #[test]
    fn test_parse_fenced_verdict() {
        let response = "```json\n{\"score\": 1.0, \"reasoning\": \"exact match\"}\n```";
        let verdict = JudgeVerdict::parse(response);
        assert_eq!(verdict.score(), 1.0);
        assert_eq!(verdict.reasoning(), "exact match");
    }

    #[test]
    fn test_parse_verdict_with_surrounding_prose() {
        let response = "Here is my judgment: {\"score\": 0.5, \"reasoning\": \"partial\"} done";
        let verdict = JudgeVerdict::parse(response);
        assert_eq!(verdict.score(), 0.5);
    }

    #[test]
    fn test_malformed_json_scores_zero_and_keeps_raw() {
        let raw = "I think the answer deserves a 5/5!";
        let verdict = JudgeVerdict::parse(raw);
        assert_eq!(verdict.score(), 0.0);
        assert!(verdict.reasoning().contains(raw));
    }

    #[test]
    fn test_missing_key_is_unparseable() {
        let verdict = JudgeVerdict::parse(r#"{"score": 0.9}"#);
        assert!(matches!(verdict, JudgeVerdict::Unparseable { .. }));
    }

    #[test]
    fn test_score_is_clamped() {
        let verdict = JudgeVerdict::parse(r#"{"score": 3.5, "reasoning": "enthusiastic"}"#);
        assert_eq!(verdict.score(), 1.0);

        let verdict = JudgeVerdict::parse(r#"{"score": -0.5, "reasoning": "harsh"}"#);
        assert_eq!(verdict.score(), 0.0);
    }

    #[tokio::test]
    async fn test_score_answer_happy_path() {
        let judge = judge_with(Ok(r#"{"score": 0.7, "reasoning": "close enough"}"#.to_string()));
        let (score, reasoning) = judge.score_answer("42", "about 42").await;
        assert!((score - 0.7).abs() < 1e-9);
        assert_eq!(reasoning, "close enough");
    }

    #[tokio::test]
    async fn test_transport_failure_degrades_to_zero() {
        let judge = judge_with(Err(CallError::Transport {
            message: "connection refused".to_string(),
            transient: true,
        }));
        let (score, reasoning) = judge.score_answer("42", "41").await;
        assert_eq!(score, 0.0);
        assert!(reasoning.contains("connection refused"));
    }
}
