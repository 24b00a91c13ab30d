//! Text evaluation pipeline: per-question evaluator and the parallel
//! harness that fans it out across models and questions.
//!
//! The evaluator never returns an error to its caller. Every failure mode
//! (transport, bad status, image decode, judge miss) is captured inside
//! the [`EvaluationResult`] it produces.

use crate::config::{Config, EvalConfig};
use crate::dataset::Question;
use crate::error::{EvalError, Result};
use crate::judge::LlmJudge;
use crate::llm::{CallError, ChatApi, ChatRequest, ContentPart, Message, Prompts};
use crate::persistence::RunStore;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

/// Bounded retry with a fixed backoff schedule.
///
/// Transient transport failures (timeouts, connection errors) and HTTP 429
/// are retryable; any other failure aborts the attempt loop immediately.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Additional attempts after the first failure.
    pub max_retries: u32,
    /// Delay before each retry; the last entry repeats if the schedule is
    /// shorter than the retry budget.
    pub backoff: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff: vec![Duration::from_secs(5), Duration::from_secs(10)],
        }
    }
}

impl RetryPolicy {
    /// Build the policy described by the eval configuration.
    pub fn from_config(config: &EvalConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff: config
                .backoff_secs
                .iter()
                .map(|s| Duration::from_secs(*s))
                .collect(),
        }
    }

    /// Policy with no sleeping between attempts (unit tests).
    pub fn without_backoff(max_retries: u32) -> Self {
        Self {
            max_retries,
            backoff: Vec::new(),
        }
    }

    /// Delay before the retry with the given 0-based index.
    pub fn delay(&self, retry_index: u32) -> Duration {
        self.backoff
            .get(retry_index as usize)
            .or_else(|| self.backoff.last())
            .copied()
            .unwrap_or(Duration::ZERO)
    }

    /// Whether the error class qualifies for another attempt.
    pub fn is_retryable(&self, error: &CallError) -> bool {
        match error {
            CallError::Transport { transient, .. } => *transient,
            // Rate limiting is transient by nature even though it arrives
            // as an HTTP response.
            CallError::Status { status, .. } => *status == 429,
        }
    }
}

/// Successful call: content, wall latency of the final attempt, and how
/// many retries it took to get there.
pub(crate) struct CallOutcome {
    pub content: String,
    pub latency: f64,
    pub retry_count: u32,
}

/// Failed call, split by whether the retry budget was consumed.
pub(crate) enum CallFailure {
    /// Non-retryable error; aborted without further attempts.
    Fatal {
        error: CallError,
        latency: f64,
        retry_count: u32,
    },
    /// Retry budget spent on retryable errors.
    Exhausted { error: CallError, retry_count: u32 },
}

/// Shared attempt loop for model calls.
///
/// `retry_count` only increments when a retry is actually scheduled, so an
/// always-failing call performs `max_retries + 1` attempts and reports
/// `retry_count == max_retries`.
pub(crate) async fn call_with_retry<C: ChatApi>(
    api: &C,
    policy: &RetryPolicy,
    request: &ChatRequest,
    label: &str,
) -> std::result::Result<CallOutcome, CallFailure> {
    let mut retry_count = 0u32;
    let mut last_error: Option<CallError> = None;

    for attempt in 0..=policy.max_retries {
        let start = Instant::now();
        match api.chat(request.clone()).await {
            Ok(response) => {
                return Ok(CallOutcome {
                    content: response.content,
                    latency: start.elapsed().as_secs_f64(),
                    retry_count,
                });
            }
            Err(error) => {
                if !policy.is_retryable(&error) {
                    return Err(CallFailure::Fatal {
                        latency: start.elapsed().as_secs_f64(),
                        error,
                        retry_count,
                    });
                }

                last_error = Some(error);
                if attempt < policy.max_retries {
                    let delay = policy.delay(attempt);
                    retry_count += 1;
                    warn!(
                        label,
                        attempt = attempt + 1,
                        delay_secs = delay.as_secs_f64(),
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    Err(CallFailure::Exhausted {
        error: last_error.expect("at least one attempt was made"),
        retry_count,
    })
}

/// Result of evaluating one (model, question) pair. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub question_id: String,
    pub category: String,
    pub input: String,
    pub expected_output: String,
    /// Raw model answer; `None` when no answer was obtained.
    pub model_response: Option<String>,
    /// Judge score in [0, 1]. Failures score 0.0.
    pub score: f64,
    /// Judge reasoning or failure diagnostics.
    pub reasoning: String,
    /// Wall time of the successful (or finally-failed) attempt, seconds.
    pub latency: Option<f64>,
    /// Retries performed before this result, bounded by the policy.
    pub retry_count: u32,
}

/// All results for one model, in completion order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRunSummary {
    pub model_name: String,
    pub timestamp: DateTime<Utc>,
    /// Wall time of the whole model evaluation, seconds.
    pub evaluation_time: f64,
    pub results: Vec<EvaluationResult>,
    /// Pool-level failure annotation. Set only for zero-result summaries.
    pub error: Option<String>,
}

impl ModelRunSummary {
    /// Zero-result summary recording a pool-level failure.
    pub fn failed(model_name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
            timestamp: Utc::now(),
            evaluation_time: 0.0,
            results: Vec::new(),
            error: Some(error.into()),
        }
    }

    /// Mean judge score across results (0.0 for an empty summary).
    pub fn accuracy(&self) -> f64 {
        if self.results.is_empty() {
            return 0.0;
        }
        self.results.iter().map(|r| r.score).sum::<f64>() / self.results.len() as f64
    }

    /// Mean latency across results that have one.
    pub fn avg_latency(&self) -> f64 {
        let latencies: Vec<f64> = self.results.iter().filter_map(|r| r.latency).collect();
        if latencies.is_empty() {
            return 0.0;
        }
        latencies.iter().sum::<f64>() / latencies.len() as f64
    }
}

/// Evaluates a single question against a single model.
pub struct QuestionEvaluator<C: ChatApi> {
    api: Arc<C>,
    judge: LlmJudge<C>,
    retry: RetryPolicy,
    max_tokens: u32,
    temperature: f32,
    timeout: Duration,
    data_dir: PathBuf,
}

impl<C: ChatApi> QuestionEvaluator<C> {
    /// Build an evaluator (and its judge) from the application config.
    pub fn new(api: Arc<C>, config: &Config) -> Self {
        let judge = LlmJudge::new(Arc::clone(&api), config.judge.clone());
        Self {
            api,
            judge,
            retry: RetryPolicy::from_config(&config.eval),
            max_tokens: config.eval.max_tokens,
            temperature: config.llm.temperature,
            timeout: Duration::from_secs(config.eval.timeout_secs),
            data_dir: config.eval.data_dir.clone(),
        }
    }

    /// Override the retry policy (used by tests to avoid sleeping).
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Evaluate one question. Never returns an error: all failures are
    /// captured in the result record.
    pub async fn evaluate(&self, model_name: &str, question: &Question) -> EvaluationResult {
        let user_message = match &question.image_path {
            None => Message::user(question.input.clone()),
            Some(image) => match encode_image(&self.data_dir, image) {
                Ok(data_url) => Message::user_parts(vec![
                    ContentPart::text(question.input.clone()),
                    ContentPart::image_url(data_url),
                ]),
                // Fail the question before spending any model-call budget.
                Err(e) => {
                    return self.result(
                        question,
                        None,
                        0.0,
                        format!("Failed to load image '{}': {}", image, e),
                        None,
                        0,
                    );
                }
            },
        };

        let request = ChatRequest {
            model: model_name.to_string(),
            messages: vec![Message::system(Prompts::system_assistant()), user_message],
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            timeout: self.timeout,
        };

        let label = format!("{} Q{}", model_name, question.id);
        match call_with_retry(self.api.as_ref(), &self.retry, &request, &label).await {
            Ok(outcome) => {
                let (score, mut reasoning) = self
                    .judge
                    .score_answer(&question.expected_output, &outcome.content)
                    .await;
                if outcome.retry_count > 0 {
                    reasoning =
                        format!("[Succeeded after {} retries] {}", outcome.retry_count, reasoning);
                }
                self.result(
                    question,
                    Some(outcome.content),
                    score,
                    reasoning,
                    Some(outcome.latency),
                    outcome.retry_count,
                )
            }
            Err(CallFailure::Fatal {
                error: CallError::Status { status, body },
                latency,
                retry_count,
            }) => self.result(
                question,
                None,
                0.0,
                format!("HTTP {}: {}", status, truncate(&body, 200)),
                Some(latency),
                retry_count,
            ),
            Err(CallFailure::Fatal {
                error, retry_count, ..
            }) => self.result(
                question,
                None,
                0.0,
                format!("Non-retryable error: {}", error),
                None,
                retry_count,
            ),
            Err(CallFailure::Exhausted { error, retry_count }) => self.result(
                question,
                None,
                0.0,
                format!("Failed after {} retries: {}", retry_count, error),
                None,
                retry_count,
            ),
        }
    }

    fn result(
        &self,
        question: &Question,
        model_response: Option<String>,
        score: f64,
        reasoning: String,
        latency: Option<f64>,
        retry_count: u32,
    ) -> EvaluationResult {
        EvaluationResult {
            question_id: question.id.clone(),
            category: question.category.clone(),
            input: question.input.clone(),
            expected_output: question.expected_output.clone(),
            model_response,
            score: score.clamp(0.0, 1.0),
            reasoning,
            latency,
            retry_count,
        }
    }
}

/// Read an image from the data directory and encode it as a data URL.
fn encode_image(data_dir: &Path, image_path: &str) -> Result<String> {
    let path = data_dir.join(image_path);
    let bytes = std::fs::read(&path).map_err(|e| EvalError::io(&path, e))?;
    let mime = mime_guess::from_path(&path).first_or_octet_stream();
    let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
    Ok(format!("data:{};base64,{}", mime.essence_str(), encoded))
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

/// Fans the question evaluator out across models and questions with
/// two-level bounded concurrency.
pub struct EvalHarness<C: ChatApi + 'static> {
    evaluator: Arc<QuestionEvaluator<C>>,
    store: Option<Arc<dyn RunStore>>,
    model_workers: usize,
    question_workers: usize,
}

impl<C: ChatApi + 'static> EvalHarness<C> {
    pub fn new(evaluator: QuestionEvaluator<C>, config: &EvalConfig) -> Self {
        Self {
            evaluator: Arc::new(evaluator),
            store: None,
            model_workers: config.model_workers,
            question_workers: config.question_workers,
        }
    }

    /// Hand each completed summary to this store as soon as it is ready.
    pub fn with_store(mut self, store: Arc<dyn RunStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Evaluate every model against every question.
    ///
    /// Always returns one summary per model; per-model failures surface as
    /// zero-result summaries with an error annotation. Summaries arrive in
    /// completion order.
    pub async fn run(&self, models: &[String], questions: &[Question]) -> Vec<ModelRunSummary> {
        let questions: Arc<Vec<Question>> = Arc::new(questions.to_vec());
        let outer = Arc::new(Semaphore::new(self.model_workers));
        let mut tasks = JoinSet::new();
        let mut task_models: HashMap<tokio::task::Id, String> = HashMap::new();

        for model in models {
            let model = model.clone();
            let evaluator = Arc::clone(&self.evaluator);
            let questions = Arc::clone(&questions);
            let outer = Arc::clone(&outer);
            let width = self.question_workers;
            let task_model = model.clone();

            let handle = tasks.spawn(async move {
                let _permit = outer.acquire_owned().await.expect("semaphore closed");
                evaluate_model(evaluator, model, questions, width).await
            });
            task_models.insert(handle.id(), task_model);
        }

        let mut summaries = Vec::new();
        while let Some(joined) = tasks.join_next_with_id().await {
            let summary = match joined {
                Ok((_id, summary)) => summary,
                Err(join_error) => {
                    let model = task_models
                        .get(&join_error.id())
                        .cloned()
                        .unwrap_or_else(|| "unknown".to_string());
                    warn!(model = %model, error = %join_error, "model evaluation task failed");
                    ModelRunSummary::failed(model, join_error.to_string())
                }
            };

            info!(
                model = %summary.model_name,
                accuracy = summary.accuracy(),
                results = summary.results.len(),
                "model evaluation complete"
            );

            // Failed summaries are not persisted; they would read as
            // zero-accuracy runs in the drift history.
            if summary.error.is_none() {
                if let Some(store) = &self.store {
                    if let Err(e) = store.save_run(&summary).await {
                        warn!(model = %summary.model_name, error = %e, "failed to persist run");
                    }
                }
            }

            summaries.push(summary);
        }

        summaries
    }
}

/// Evaluate all questions for one model under a bounded worker pool.
async fn evaluate_model<C: ChatApi + 'static>(
    evaluator: Arc<QuestionEvaluator<C>>,
    model: String,
    questions: Arc<Vec<Question>>,
    width: usize,
) -> ModelRunSummary {
    info!(model = %model, questions = questions.len(), "starting model evaluation");
    let start = Instant::now();
    let inner = Arc::new(Semaphore::new(width));
    let mut tasks = JoinSet::new();

    for idx in 0..questions.len() {
        let evaluator = Arc::clone(&evaluator);
        let questions = Arc::clone(&questions);
        let inner = Arc::clone(&inner);
        let model = model.clone();

        tasks.spawn(async move {
            let _permit = inner.acquire_owned().await.expect("semaphore closed");
            evaluator.evaluate(&model, &questions[idx]).await
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

    let evaluation_time = start.elapsed().as_secs_f64();

    if let Some(error) = pool_error {
        warn!(model = %model, error = %error, "question pool failed");
        return ModelRunSummary {
            model_name: model,
            timestamp: Utc::now(),
            evaluation_time,
            results: Vec::new(),
            error: Some(error),
        };
    }

    ModelRunSummary {
        model_name: model,
        timestamp: Utc::now(),
        evaluation_time,
        results,
        error: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmResponse;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const CANDIDATE: &str = "test-model";

    type Responder = dyn Fn(&ChatRequest, usize) -> std::result::Result<LlmResponse, CallError>
        + Send
        + Sync;

    /// Scripted chat API. Judge calls (identified by the judge model name)
    /// always succeed with a fixed verdict; candidate-model behavior is
    /// driven by the responder closure, which receives the 0-based attempt
    /// number for that model.
    struct MockApi {
        model_calls: AtomicUsize,
        judge_calls: AtomicUsize,
        respond: Box<Responder>,
    }

    impl MockApi {
        fn new<F>(respond: F) -> Arc<Self>
        where
            F: Fn(&ChatRequest, usize) -> std::result::Result<LlmResponse, CallError>
                + Send
                + Sync
                + 'static,
        {
            Arc::new(Self {
                model_calls: AtomicUsize::new(0),
                judge_calls: AtomicUsize::new(0),
                respond: Box::new(respond),
            })
        }
    }

    fn ok(content: &str) -> std::result::Result<LlmResponse, CallError> {
        Ok(LlmResponse {
            content: content.to_string(),
            finish_reason: Some("stop".to_string()),
            usage: None,
        })
    }

    fn timeout() -> std::result::Result<LlmResponse, CallError> {
        Err(CallError::Transport {
            message: "operation timed out".to_string(),
            transient: true,
        })
    }

    #[async_trait]
    impl ChatApi for MockApi {
        async fn chat(&self, request: ChatRequest) -> std::result::Result<LlmResponse, CallError> {
            if request.model == "gpt-4o-mini" {
                self.judge_calls.fetch_add(1, Ordering::SeqCst);
                return ok(r#"{"score": 1.0, "reasoning": "judged"}"#);
            }
            let attempt = self.model_calls.fetch_add(1, Ordering::SeqCst);
            (self.respond)(&request, attempt)
        }
    }

    fn test_config() -> Config {
        let mut config = Config::with_llm("http://localhost:9", "sk-test");
        config.eval.backoff_secs = Vec::new();
        config
    }

    fn evaluator(api: Arc<MockApi>) -> QuestionEvaluator<MockApi> {
        QuestionEvaluator::new(api, &test_config())
    }

    fn question(id: &str) -> Question {
        Question {
            id: id.to_string(),
            category: "reasoning".to_string(),
            input: format!("question {}", id),
            expected_output: "expected".to_string(),
            image_path: None,
        }
    }

    #[test]
    fn test_retry_policy_delay_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_secs(5));
        assert_eq!(policy.delay(1), Duration::from_secs(10));
        // Past the schedule, the last entry repeats
        assert_eq!(policy.delay(5), Duration::from_secs(10));

        let empty = RetryPolicy::without_backoff(2);
        assert_eq!(empty.delay(0), Duration::ZERO);
    }

    #[test]
    fn test_rate_limit_is_retryable() {
        let policy = RetryPolicy::default();
        assert!(policy.is_retryable(&CallError::Status {
            status: 429,
            body: "rate limited".to_string()
        }));
        assert!(!policy.is_retryable(&CallError::Status {
            status: 500,
            body: "server error".to_string()
        }));
        assert!(policy.is_retryable(&CallError::Transport {
            message: "timed out".to_string(),
            transient: true,
        }));
        assert!(!policy.is_retryable(&CallError::Transport {
            message: "tls misconfigured".to_string(),
            transient: false,
        }));
    }

    #[tokio::test]
    async fn test_always_timing_out_call_makes_three_attempts() {
        let api = MockApi::new(|_, _| timeout());
        let result = evaluator(Arc::clone(&api))
            .evaluate(CANDIDATE, &question("1"))
            .await;

        assert_eq!(api.model_calls.load(Ordering::SeqCst), 3);
        assert_eq!(result.retry_count, 2);
        assert_eq!(result.score, 0.0);
        assert!(result.model_response.is_none());
        assert!(result.latency.is_none());
        assert!(result.reasoning.contains("Failed after 2 retries"));
        // The judge is never consulted for a failed call
        assert_eq!(api.judge_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_bad_status_is_not_retried() {
        let api = MockApi::new(|_, _| {
            Err(CallError::Status {
                status: 500,
                body: "internal error".to_string(),
            })
        });
        let result = evaluator(Arc::clone(&api))
            .evaluate(CANDIDATE, &question("1"))
            .await;

        assert_eq!(api.model_calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.retry_count, 0);
        assert_eq!(result.score, 0.0);
        assert!(result.reasoning.contains("HTTP 500"));
        assert!(result.latency.is_some());
    }

    #[tokio::test]
    async fn test_rate_limit_then_success_marks_retries() {
        let api = MockApi::new(|_, attempt| {
            if attempt == 0 {
                Err(CallError::Status {
                    status: 429,
                    body: "slow down".to_string(),
                })
            } else {
                ok("the answer")
            }
        });
        let result = evaluator(Arc::clone(&api))
            .evaluate(CANDIDATE, &question("1"))
            .await;

        assert_eq!(api.model_calls.load(Ordering::SeqCst), 2);
        assert_eq!(result.retry_count, 1);
        assert_eq!(result.score, 1.0);
        assert_eq!(result.model_response.as_deref(), Some("the answer"));
        assert!(result.reasoning.starts_with("[Succeeded after 1 retries]"));
    }

    #[tokio::test]
    async fn test_missing_image_fails_fast_without_model_call() {
        let api = MockApi::new(|_, _| ok("unused"));
        let mut q = question("50");
        q.image_path = Some("images/missing.jpg".to_string());

        let result = evaluator(Arc::clone(&api)).evaluate(CANDIDATE, &q).await;

        assert_eq!(api.model_calls.load(Ordering::SeqCst), 0);
        assert_eq!(result.score, 0.0);
        assert_eq!(result.retry_count, 0);
        assert!(result.reasoning.contains("Failed to load image"));
    }

    #[tokio::test]
    async fn test_empty_response_is_judged_normally() {
        let api = MockApi::new(|_, _| ok(""));
        let result = evaluator(Arc::clone(&api))
            .evaluate(CANDIDATE, &question("1"))
            .await;

        assert_eq!(api.judge_calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.model_response.as_deref(), Some(""));
    }

    #[tokio::test]
    async fn test_score_stays_in_unit_interval() {
        let api = MockApi::new(|_, _| ok("fine"));
        let result = evaluator(api).evaluate(CANDIDATE, &question("1")).await;
        assert!((0.0..=1.0).contains(&result.score));
    }

    #[tokio::test]
    async fn test_harness_isolates_a_panicking_model() {
        let api = MockApi::new(|request, _| {
            if request.model == "model-b" {
                panic!("pool blew up");
            }
            ok("answer")
        });
        let harness = EvalHarness::new(evaluator(api), &test_config().eval);

        let models = vec![
            "model-a".to_string(),
            "model-b".to_string(),
            "model-c".to_string(),
        ];
        let questions = vec![question("1"), question("2")];
        let summaries = harness.run(&models, &questions).await;

        assert_eq!(summaries.len(), 3);
        for summary in &summaries {
            if summary.model_name == "model-b" {
                assert!(summary.results.is_empty());
                assert!(summary.error.is_some());
            } else {
                assert_eq!(summary.results.len(), 2);
                assert!(summary.error.is_none());
            }
        }
    }

    #[tokio::test]
    async fn test_harness_produces_one_summary_per_model() {
        let api = MockApi::new(|_, _| ok("answer"));
        let harness = EvalHarness::new(evaluator(api), &test_config().eval);

        let models: Vec<String> = (0..5).map(|i| format!("model-{}", i)).collect();
        let questions = vec![question("1")];
        let summaries = harness.run(&models, &questions).await;

        assert_eq!(summaries.len(), 5);
        let mut names: Vec<_> = summaries.iter().map(|s| s.model_name.clone()).collect();
        names.sort();
        assert_eq!(names, models);
    }

    #[test]
    fn test_summary_accuracy_is_mean_score() {
        let mut summary = ModelRunSummary::failed("m", "irrelevant");
        summary.error = None;
        summary.results = vec![
            EvaluationResult {
                question_id: "1".to_string(),
                category: "c".to_string(),
                input: "i".to_string(),
                expected_output: "e".to_string(),
                model_response: Some("a".to_string()),
                score: 1.0,
                reasoning: String::new(),
                latency: Some(0.5),
                retry_count: 0,
            },
            EvaluationResult {
                question_id: "2".to_string(),
                category: "c".to_string(),
                input: "i".to_string(),
                expected_output: "e".to_string(),
                model_response: None,
                score: 0.0,
                reasoning: String::new(),
                latency: None,
                retry_count: 2,
            },
        ];

        assert!((summary.accuracy() - 0.5).abs() < 1e-9);
        assert!((summary.avg_latency() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_empty_summary_accuracy_is_zero() {
        let summary = ModelRunSummary::failed("m", "boom");
        assert_eq!(summary.accuracy(), 0.0);
        assert_eq!(summary.avg_latency(), 0.0);
    }
}
