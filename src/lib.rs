//! Eval Dashboard core - golden-dataset LLM evaluation with drift detection.
//!
//! Evaluates candidate models against a golden dataset using an LLM judge,
//! stores run summaries, and detects accuracy/recall drift over time. The
//! RAG variant additionally performs vector retrieval over a knowledge
//! base, computes ranking-quality metrics (precision/recall/F1/MRR), and
//! judges answer groundedness.
//!
//! # Overview
//!
//! 1. The harness fans out across models (3 at a time) and questions
//!    (5 at a time per model) under bounded worker pools.
//! 2. Each question evaluation calls the candidate model (with bounded
//!    retry-with-backoff on transient failures), then scores the answer
//!    via the LLM judge.
//! 3. Completed summaries are handed to the run store; the drift detector
//!    later compares the latest run against the historical best and fans
//!    alerts out to independent channels.
//!
//! # Quick Start
//!
//! ```no_run
//! use eval_dashboard::{
//!     config::Config,
//!     dataset::load_questions,
//!     evaluate::{EvalHarness, QuestionEvaluator},
//!     llm::LlmClient,
//! };
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     // Load configuration
//!     let config = Config::load()?;
//!     config.validate()?;
//!
//!     // Create LLM client and evaluator
//!     let client = Arc::new(LlmClient::new(config.llm.clone()));
//!     let evaluator = QuestionEvaluator::new(client, &config);
//!
//!     // Load the golden dataset
//!     let questions = load_questions(Path::new("data/golden_dataset.csv"))?;
//!
//!     // Fan out across all configured models
//!     let harness = EvalHarness::new(evaluator, &config.eval);
//!     let summaries = harness.run(&config.eval.models, &questions).await;
//!
//!     for summary in &summaries {
//!         println!("{}: {:.1}%", summary.model_name, summary.accuracy() * 100.0);
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - **QuestionEvaluator / EvalHarness**: model-call + judge orchestration
//!   with two-level bounded concurrency
//! - **LlmJudge**: scores candidate answers, strict-JSON verdict parsing
//! - **Retriever**: cached corpus embeddings, cosine top-K, ranking metrics
//! - **RagEvaluator**: retrieval + generation + grounding pipeline
//! - **DriftDetector**: latest-vs-best metric comparison with alert fan-out
//! - **JsonRunStore**: JSON-file run persistence and history queries

pub mod config;
pub mod dataset;
pub mod drift;
pub mod error;
pub mod evaluate;
pub mod judge;
pub mod llm;
pub mod persistence;
pub mod rag;
pub mod retrieval;

#[cfg(feature = "embeddings")]
pub mod embeddings;

// Re-export commonly used types
pub use config::Config;
pub use dataset::{Question, RagQuestion};
pub use drift::{DriftDetector, DriftReport, DriftVerdict};
pub use error::{EvalError, Result};
pub use evaluate::{
    EvalHarness, EvaluationResult, ModelRunSummary, QuestionEvaluator, RetryPolicy,
};
pub use judge::{JudgeVerdict, LlmJudge};
pub use llm::LlmClient;
pub use persistence::{JsonRunStore, RunHistory, RunStore};
pub use rag::{RagEvaluationResult, RagEvaluator, RagRunSummary};
pub use retrieval::{RetrievalMetrics, RetrievedDocument, Retriever};
