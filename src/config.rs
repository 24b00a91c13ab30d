//! Configuration for the evaluation harness.
//!
//! Supports both environment variables and a YAML config file.
//! Environment variables take precedence over config file values.
//!
//! Every tunable (timeouts, retry schedule, pool widths, top-k, drift
//! threshold) lives here so components receive explicit configuration
//! instead of reading module-level globals.

use crate::error::{EvalError, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

/// LLM endpoint configuration (OpenAI-compatible proxy).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Base URL for the LLM API (e.g., "http://127.0.0.1:4000")
    pub api_base: String,

    /// API key for authentication
    pub api_key: String,

    /// Temperature for generation
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_base: String::new(),
            api_key: String::new(),
            temperature: 0.0,
        }
    }
}

/// Settings for the text evaluation harness.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvalConfig {
    /// Models evaluated against the golden dataset.
    pub models: Vec<String>,

    /// Maximum tokens for a candidate answer.
    pub max_tokens: u32,

    /// Per-attempt timeout for model calls, in seconds.
    pub timeout_secs: u64,

    /// Additional attempts after the first failure.
    pub max_retries: u32,

    /// Backoff schedule between attempts, in seconds.
    pub backoff_secs: Vec<u64>,

    /// Concurrent models in flight.
    pub model_workers: usize,

    /// Concurrent questions in flight per model.
    pub question_workers: usize,

    /// Directory that question image paths are resolved against.
    pub data_dir: PathBuf,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            models: vec![
                "gpt-4o".to_string(),
                "gpt-4o-mini".to_string(),
                "claude-opus-4-5".to_string(),
                "claude-sonnet-4-5".to_string(),
            ],
            max_tokens: 300,
            timeout_secs: 120,
            max_retries: 2,
            backoff_secs: vec![5, 10],
            model_workers: 3,
            question_workers: 5,
            data_dir: PathBuf::from("data"),
        }
    }
}

/// Settings for the LLM judge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JudgeConfig {
    /// Model used for scoring and grounding judgments.
    pub model: String,

    /// Maximum tokens for a judge response.
    pub max_tokens: u32,

    /// Timeout for judge calls, in seconds.
    pub timeout_secs: u64,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            max_tokens: 200,
            timeout_secs: 25,
        }
    }
}

/// Settings for the RAG retrieval path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Path to the knowledge base JSON file.
    pub knowledge_base: PathBuf,

    /// Directory for cached corpus embeddings.
    pub cache_dir: PathBuf,

    /// Sentence-transformer model used for embeddings.
    pub embedding_model: String,

    /// Number of documents retrieved per query.
    pub top_k: usize,

    /// Maximum tokens for a generated RAG answer.
    pub generation_max_tokens: u32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            knowledge_base: PathBuf::from("data/knowledge_base.json"),
            cache_dir: PathBuf::from("data/embeddings"),
            embedding_model: "sentence-transformers/all-MiniLM-L6-v2".to_string(),
            top_k: 5,
            generation_max_tokens: 500,
        }
    }
}

/// Settings for drift detection and alerting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriftConfig {
    /// Metric drop that counts as drift (0.05 = five points of accuracy).
    pub threshold: f64,

    /// Optional webhook URL alerts are posted to.
    pub webhook_url: Option<String>,
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            threshold: 0.05,
            webhook_url: None,
        }
    }
}

/// Full application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// LLM endpoint settings
    pub llm: LlmConfig,

    /// Text evaluation settings
    pub eval: EvalConfig,

    /// Judge settings
    pub judge: JudgeConfig,

    /// RAG retrieval settings
    pub retrieval: RetrievalConfig,

    /// Drift detection settings
    pub drift: DriftConfig,
}

impl Config {
    /// Load configuration from environment variables and optional config file.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables (LLM_API_BASE, LLM_API_KEY, ...)
    /// 2. Config file (~/.config/eval-dashboard/config.yaml)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        let mut config = Config::default();

        if let Some(config_path) = Self::config_file_path() {
            if config_path.exists() {
                config = Self::load_from_file(&config_path)?;
            }
        }

        if let Ok(api_base) = env::var("LLM_API_BASE") {
            config.llm.api_base = api_base;
        }

        if let Ok(api_key) = env::var("LLM_API_KEY") {
            config.llm.api_key = api_key;
        }

        if let Ok(models) = env::var("EVAL_MODELS") {
            let models: Vec<String> = models
                .split(',')
                .map(|m| m.trim().to_string())
                .filter(|m| !m.is_empty())
                .collect();
            if !models.is_empty() {
                config.eval.models = models;
            }
        }

        if let Ok(model) = env::var("JUDGE_MODEL") {
            config.judge.model = model;
        }

        if let Ok(threshold) = env::var("DRIFT_THRESHOLD") {
            if let Ok(t) = threshold.parse() {
                config.drift.threshold = t;
            }
        }

        if let Ok(url) = env::var("WEBHOOK_URL") {
            config.drift.webhook_url = Some(url);
        }

        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from_file(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| EvalError::io(path, e))?;

        serde_yaml::from_str(&content)
            .map_err(|e| EvalError::Config(format!("Failed to parse config file: {}", e)))
    }

    /// Get the default config file path.
    pub fn config_file_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "eval-dashboard")
            .map(|dirs| dirs.config_dir().join("config.yaml"))
    }

    /// Validate that required configuration is present.
    pub fn validate(&self) -> Result<()> {
        if self.llm.api_base.is_empty() {
            return Err(EvalError::Config(
                "LLM API base URL is required. Set LLM_API_BASE environment variable or add to config file.".to_string()
            ));
        }

        if self.llm.api_key.is_empty() {
            return Err(EvalError::Config(
                "LLM API key is required. Set LLM_API_KEY environment variable or add to config file.".to_string()
            ));
        }

        if self.eval.models.is_empty() {
            return Err(EvalError::Config(
                "At least one model must be configured for evaluation.".to_string(),
            ));
        }

        if self.eval.model_workers == 0 || self.eval.question_workers == 0 {
            return Err(EvalError::Config(
                "Worker pool widths must be greater than zero.".to_string(),
            ));
        }

        if self.drift.threshold < 0.0 {
            return Err(EvalError::Config(
                "Drift threshold must be non-negative.".to_string(),
            ));
        }

        Ok(())
    }

    /// Create a config from explicit endpoint values (useful for testing).
    pub fn with_llm(api_base: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            llm: LlmConfig {
                api_base: api_base.into(),
                api_key: api_key.into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.llm.api_base.is_empty());
        assert_eq!(config.eval.max_tokens, 300);
        assert_eq!(config.eval.timeout_secs, 120);
        assert_eq!(config.eval.max_retries, 2);
        assert_eq!(config.eval.backoff_secs, vec![5, 10]);
        assert_eq!(config.eval.model_workers, 3);
        assert_eq!(config.eval.question_workers, 5);
        assert_eq!(config.judge.model, "gpt-4o-mini");
        assert_eq!(config.judge.timeout_secs, 25);
        assert_eq!(config.retrieval.top_k, 5);
        assert!((config.drift.threshold - 0.05).abs() < 1e-12);
    }

    #[test]
    fn test_validate_fails_without_required_fields() {
        let config = Config::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_with_llm() {
        let config = Config::with_llm("https://api.example.com", "test-key");
        assert_eq!(config.llm.api_base, "https://api.example.com");
        assert_eq!(config.llm.api_key, "test-key");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r#"
llm:
  api_base: "http://127.0.0.1:4000"
  api_key: "sk-test"
eval:
  models: ["gpt-4o-mini"]
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.llm.api_base, "http://127.0.0.1:4000");
        assert_eq!(config.eval.models, vec!["gpt-4o-mini".to_string()]);
        // Untouched sections fall back to defaults
        assert_eq!(config.eval.max_retries, 2);
        assert_eq!(config.judge.model, "gpt-4o-mini");
    }
}
