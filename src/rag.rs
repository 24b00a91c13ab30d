//! RAG evaluation pipeline: retrieval quality plus generation quality.
//!
//! Each question is retrieved against the knowledge base, scored with
//! ranking metrics, answered from the retrieved context, and judged twice
//! (answer correctness and groundedness). Like the text evaluator, a
//! question evaluation never raises; failures land in the result record.

use crate::config::Config;
use crate::dataset::RagQuestion;
use crate::evaluate::{CallFailure, RetryPolicy, call_with_retry};
use crate::judge::LlmJudge;
use crate::llm::{CallError, ChatApi, ChatRequest, Message, Prompts};
use crate::persistence::RunStore;
use crate::retrieval::{Embedder, RetrievalMetrics, Retriever, format_context};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

/// Result of evaluating one RAG question. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagEvaluationResult {
    pub question_id: String,
    pub category: String,
    pub question: String,
    pub expected_answer: String,

    // Retrieval
    pub retrieved_chunk_ids: Vec<u32>,
    pub precision_at_k: f64,
    pub recall_at_k: f64,
    pub f1_at_k: f64,
    pub mrr: f64,
    pub avg_similarity_score: f64,
    pub retrieval_time: f64,

    // Generation
    pub generated_answer: Option<String>,
    pub generation_time: Option<f64>,
    pub retry_count: u32,

    // Judgments
    pub answer_score: f64,
    pub answer_reasoning: String,
    pub grounding_score: f64,
    pub grounding_reasoning: String,

    pub total_time: f64,
}

/// Per-category aggregate slice of a RAG run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryStats {
    pub count: usize,
    pub avg_precision: f64,
    pub avg_recall: f64,
    pub avg_answer_score: f64,
    pub avg_grounding_score: f64,
}

/// All RAG results for one model, in completion order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagRunSummary {
    pub model_name: String,
    pub retrieval_k: usize,
    pub timestamp: DateTime<Utc>,
    /// Wall time of the whole run, seconds.
    pub evaluation_time: f64,
    pub results: Vec<RagEvaluationResult>,
    /// Pool-level failure annotation. Set only for zero-result summaries.
    pub error: Option<String>,
}

impl RagRunSummary {
    /// Zero-result summary recording a pool-level failure.
    pub fn failed(
        model_name: impl Into<String>,
        retrieval_k: usize,
        error: impl Into<String>,
    ) -> Self {
        Self {
            model_name: model_name.into(),
            retrieval_k,
            timestamp: Utc::now(),
            evaluation_time: 0.0,
            results: Vec::new(),
            error: Some(error.into()),
        }
    }

    fn mean(&self, f: impl Fn(&RagEvaluationResult) -> f64) -> f64 {
        if self.results.is_empty() {
            return 0.0;
        }
        self.results.iter().map(f).sum::<f64>() / self.results.len() as f64
    }

    pub fn avg_precision(&self) -> f64 {
        self.mean(|r| r.precision_at_k)
    }

    pub fn avg_recall(&self) -> f64 {
        self.mean(|r| r.recall_at_k)
    }

    pub fn avg_f1(&self) -> f64 {
        self.mean(|r| r.f1_at_k)
    }

    pub fn avg_mrr(&self) -> f64 {
        self.mean(|r| r.mrr)
    }

    pub fn avg_answer_score(&self) -> f64 {
        self.mean(|r| r.answer_score)
    }

    pub fn avg_grounding_score(&self) -> f64 {
        self.mean(|r| r.grounding_score)
    }

    /// Aggregate metrics sliced by question category.
    pub fn category_breakdown(&self) -> BTreeMap<String, CategoryStats> {
        let mut grouped: BTreeMap<String, Vec<&RagEvaluationResult>> = BTreeMap::new();
        for result in &self.results {
            grouped.entry(result.category.clone()).or_default().push(result);
        }

        grouped
            .into_iter()
            .map(|(category, results)| {
                let count = results.len();
                let mean = |f: &dyn Fn(&RagEvaluationResult) -> f64| {
                    results.iter().map(|r| f(r)).sum::<f64>() / count as f64
                };
                (
                    category,
                    CategoryStats {
                        count,
                        avg_precision: mean(&|r| r.precision_at_k),
                        avg_recall: mean(&|r| r.recall_at_k),
                        avg_answer_score: mean(&|r| r.answer_score),
                        avg_grounding_score: mean(&|r| r.grounding_score),
                    },
                )
            })
            .collect()
    }
}

/// Evaluates RAG questions for one model at a time.
pub struct RagEvaluator<C: ChatApi, E: Embedder> {
    api: Arc<C>,
    judge: LlmJudge<C>,
    retriever: Arc<Retriever<E>>,
    retry: RetryPolicy,
    retrieval_k: usize,
    generation_max_tokens: u32,
    temperature: f32,
    timeout: Duration,
    question_workers: usize,
    store: Option<Arc<dyn RunStore>>,
}

impl<C, E> RagEvaluator<C, E>
where
    C: ChatApi + 'static,
    E: Embedder + 'static,
{
    /// Build a RAG evaluator (and its judge) from the application config.
    pub fn new(api: Arc<C>, retriever: Arc<Retriever<E>>, config: &Config) -> Self {
        let judge = LlmJudge::new(Arc::clone(&api), config.judge.clone());
        Self {
            api,
            judge,
            retriever,
            retry: RetryPolicy::from_config(&config.eval),
            retrieval_k: config.retrieval.top_k,
            generation_max_tokens: config.retrieval.generation_max_tokens,
            temperature: config.llm.temperature,
            timeout: Duration::from_secs(config.eval.timeout_secs),
            question_workers: config.eval.question_workers,
            store: None,
        }
    }

    /// Hand each completed summary to this store as soon as it is ready.
    pub fn with_store(mut self, store: Arc<dyn RunStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Override the retry policy (used by tests to avoid sleeping).
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Evaluate one RAG question. Never returns an error.
    pub async fn evaluate_question(
        &self,
        model_name: &str,
        question: &RagQuestion,
    ) -> RagEvaluationResult {
        let total_start = Instant::now();

        let retrieval_start = Instant::now();
        let retrieved = match self.retriever.retrieve(&question.question, self.retrieval_k) {
            Ok(docs) => docs,
            Err(e) => {
                warn!(question_id = %question.id, error = %e, "retrieval failed");
                return self.result(
                    question,
                    RetrievalMetrics::zeroed(),
                    0.0,
                    None,
                    None,
                    0,
                    0.0,
                    format!("Retrieval failed: {}", e),
                    0.0,
                    "Skipped: retrieval failed".to_string(),
                    total_start.elapsed().as_secs_f64(),
                );
            }
        };
        let retrieval_time = retrieval_start.elapsed().as_secs_f64();

        let metrics =
            RetrievalMetrics::compute(&retrieved, &question.relevant_chunk_ids, self.retrieval_k);
        let context = format_context(&retrieved);

        let prompt = Prompts::rag_answer()
            .replace("{context}", &context)
            .replace("{question}", &question.question);
        let request = ChatRequest {
            model: model_name.to_string(),
            messages: vec![Message::user(prompt)],
            max_tokens: self.generation_max_tokens,
            temperature: self.temperature,
            timeout: self.timeout,
        };

        let label = format!("{} Q{}", model_name, question.id);
        match call_with_retry(self.api.as_ref(), &self.retry, &request, &label).await {
            Ok(outcome) => {
                let (answer_score, mut answer_reasoning) = self
                    .judge
                    .score_answer(&question.expected_answer, &outcome.content)
                    .await;
                if outcome.retry_count > 0 {
                    answer_reasoning = format!(
                        "[Succeeded after {} retries] {}",
                        outcome.retry_count, answer_reasoning
                    );
                }

                let (grounding_score, grounding_reasoning) = self
                    .judge
                    .judge_grounding(&question.question, &context, &outcome.content)
                    .await;

                self.result(
                    question,
                    metrics,
                    retrieval_time,
                    Some(outcome.content),
                    Some(outcome.latency),
                    outcome.retry_count,
                    answer_score,
                    answer_reasoning,
                    grounding_score,
                    grounding_reasoning,
                    total_start.elapsed().as_secs_f64(),
                )
            }
            Err(failure) => {
                let (reasoning, generation_time, retry_count) = match failure {
                    CallFailure::Fatal {
                        error: CallError::Status { status, body },
                        latency,
                        retry_count,
                    } => {
                        let body: String = body.chars().take(200).collect();
                        (
                            format!("HTTP {}: {}", status, body),
                            Some(latency),
                            retry_count,
                        )
                    }
                    CallFailure::Fatal {
                        error, retry_count, ..
                    } => (format!("Non-retryable error: {}", error), None, retry_count),
                    CallFailure::Exhausted { error, retry_count } => (
                        format!("Failed after {} retries: {}", retry_count, error),
                        None,
                        retry_count,
                    ),
                };

                self.result(
                    question,
                    metrics,
                    retrieval_time,
                    None,
                    generation_time,
                    retry_count,
                    0.0,
                    reasoning,
                    0.0,
                    "Skipped: no generated answer".to_string(),
                    total_start.elapsed().as_secs_f64(),
                )
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn result(
        &self,
        question: &RagQuestion,
        metrics: RetrievalMetrics,
        retrieval_time: f64,
        generated_answer: Option<String>,
        generation_time: Option<f64>,
        retry_count: u32,
        answer_score: f64,
        answer_reasoning: String,
        grounding_score: f64,
        grounding_reasoning: String,
        total_time: f64,
    ) -> RagEvaluationResult {
        RagEvaluationResult {
            question_id: question.id.clone(),
            category: question.category.clone(),
            question: question.question.clone(),
            expected_answer: question.expected_answer.clone(),
            retrieved_chunk_ids: metrics.retrieved_chunk_ids,
            precision_at_k: metrics.precision_at_k,
            recall_at_k: metrics.recall_at_k,
            f1_at_k: metrics.f1_at_k,
            mrr: metrics.mrr,
            avg_similarity_score: metrics.avg_similarity_score,
            retrieval_time,
            generated_answer,
            generation_time,
            retry_count,
            answer_score: answer_score.clamp(0.0, 1.0),
            answer_reasoning,
            grounding_score: grounding_score.clamp(0.0, 1.0),
            grounding_reasoning,
            total_time,
        }
    }

    /// Evaluate all questions for one model under a bounded worker pool,
    /// then hand the summary to the store (if configured).
    ///
    /// Takes `Arc<Self>` so question tasks can share the evaluator;
    /// callers keep their own clone to run further models.
    pub async fn run(
        self: Arc<Self>,
        model_name: &str,
        questions: &[RagQuestion],
    ) -> RagRunSummary {
        info!(
            model = model_name,
            questions = questions.len(),
            top_k = self.retrieval_k,
            "starting RAG evaluation"
        );

        let start = Instant::now();
        let questions: Arc<Vec<RagQuestion>> = Arc::new(questions.to_vec());
        let inner = Arc::new(Semaphore::new(self.question_workers));
        let mut tasks = JoinSet::new();

        for idx in 0..questions.len() {
            let evaluator = Arc::clone(&self);
            let questions = Arc::clone(&questions);
            let inner = Arc::clone(&inner);
            let model = model_name.to_string();

            tasks.spawn(async move {
                let _permit = inner.acquire_owned().await.expect("semaphore closed");
                evaluator.evaluate_question(&model, &questions[idx]).await
            });
        }

        let mut results = Vec::new();
        let mut pool_error = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => pool_error = Some(e.to_string()),
            }
        }

        let summary = if let Some(error) = pool_error {
            warn!(model = model_name, error = %error, "RAG question pool failed");
            RagRunSummary::failed(model_name, self.retrieval_k, error)
        } else {
            RagRunSummary {
                model_name: model_name.to_string(),
                retrieval_k: self.retrieval_k,
                timestamp: Utc::now(),
                evaluation_time: start.elapsed().as_secs_f64(),
                results,
                error: None,
            }
        };

        info!(
            model = %summary.model_name,
            recall = summary.avg_recall(),
            answer_score = summary.avg_answer_score(),
            "RAG evaluation complete"
        );

        if summary.error.is_none() {
            if let Some(store) = &self.store {
                if let Err(e) = store.save_rag_run(&summary).await {
                    warn!(model = %summary.model_name, error = %e, "failed to persist RAG run");
                }
            }
        }

        summary
    }
}
