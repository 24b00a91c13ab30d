//! Eval Dashboard CLI
//!
//! Evaluates models against the golden dataset, checks drift, and tests
//! LLM connectivity. The RAG pipeline has its own binary (`rag-eval`).

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use eval_dashboard::{
    config::Config,
    dataset::load_questions,
    drift::{AlertChannel, DriftDetector, DriftVerdict, WebhookChannel},
    evaluate::{EvalHarness, ModelRunSummary, QuestionEvaluator},
    llm::LlmClient,
    persistence::JsonRunStore,
};
use std::path::PathBuf;
use std::sync::Arc;

/// Eval Dashboard - golden-dataset LLM evaluation with drift detection
#[derive(Parser)]
#[command(name = "eval-dashboard")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Run store directory
    #[arg(long, global = true, default_value = "data/store")]
    store: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate models against the golden dataset
    Evaluate {
        /// Path to the golden dataset CSV
        #[arg(short, long, default_value = "data/golden_dataset.csv")]
        dataset: PathBuf,

        /// Evaluate only these models (defaults to the configured list)
        #[arg(short, long)]
        model: Vec<String>,

        /// Limit the number of questions (for quick runs)
        #[arg(long)]
        max_questions: Option<usize>,
    },

    /// Check a model for metric drift and send alerts
    Drift {
        /// Model name to check
        model: String,

        /// Check the RAG run history (recall) instead of text runs
        #[arg(long)]
        rag: bool,

        /// Override the configured drift threshold
        #[arg(long)]
        threshold: Option<f64>,
    },

    /// Test LLM connectivity
    Test,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;

    match cli.command {
        Commands::Evaluate {
            dataset,
            model,
            max_questions,
        } => cmd_evaluate(config, cli.store, dataset, model, max_questions).await,
        Commands::Drift {
            model,
            rag,
            threshold,
        } => cmd_drift(config, cli.store, model, rag, threshold).await,
        Commands::Test => cmd_test(config).await,
    }
}

async fn cmd_evaluate(
    config: Config,
    store_dir: PathBuf,
    dataset: PathBuf,
    models: Vec<String>,
    max_questions: Option<usize>,
) -> Result<()> {
    config.validate()?;

    let mut questions =
        load_questions(&dataset).context("failed to load the golden dataset")?;
    if let Some(max) = max_questions {
        questions.truncate(max);
    }

    let models = if models.is_empty() {
        config.eval.models.clone()
    } else {
        models
    };

    println!(
        "Evaluating {} models on {} questions...",
        models.len(),
        questions.len()
    );

    let client = Arc::new(LlmClient::new(config.llm.clone()));
    let evaluator = QuestionEvaluator::new(client, &config);
    let store = Arc::new(JsonRunStore::new(store_dir));
    let harness = EvalHarness::new(evaluator, &config.eval).with_store(store);

    let summaries = harness.run(&models, &questions).await;
    print_summaries(&summaries);

    Ok(())
}

fn print_summaries(summaries: &[ModelRunSummary]) {
    println!("\n========== Evaluation Results ==========");
    for summary in summaries {
        match &summary.error {
            Some(error) => {
                println!("{:<40} FAILED ({})", summary.model_name, error);
            }
            None => {
                println!(
                    "{:<40} accuracy {:>5.1}%  avg latency {:>6.2}s  ({} questions in {:.1}s)",
                    summary.model_name,
                    summary.accuracy() * 100.0,
                    summary.avg_latency(),
                    summary.results.len(),
                    summary.evaluation_time,
                );
            }
        }
    }
    println!("========================================\n");
}

async fn cmd_drift(
    config: Config,
    store_dir: PathBuf,
    model: String,
    rag: bool,
    threshold: Option<f64>,
) -> Result<()> {
    let detector = DriftDetector::new(threshold.unwrap_or(config.drift.threshold));
    let store = JsonRunStore::new(store_dir);

    let mut channels: Vec<Box<dyn AlertChannel>> = Vec::new();
    if let Some(url) = &config.drift.webhook_url {
        channels.push(Box::new(WebhookChannel::new(url.clone())));
    }

    let outcome = if rag {
        detector.process(&store.rag_history(), &model, &channels).await?
    } else {
        detector.process(&store, &model, &channels).await?
    };

    match &outcome.verdict {
        DriftVerdict::NoData { model_name } => {
            println!("No runs recorded for {}", model_name);
        }
        DriftVerdict::Computed(report) => {
            let metric = if rag { "recall" } else { "accuracy" };
            println!("Model:     {}", report.model_name);
            println!(
                "Latest:    {} {:.2}% (run #{})",
                metric,
                report.latest_metric * 100.0,
                report.latest_run_id
            );
            println!(
                "Best:      {} {:.2}% (run #{})",
                metric,
                report.best_metric * 100.0,
                report.best_run_id
            );
            println!(
                "Drop:      {:.2}% (threshold {:.2}%)",
                report.drop * 100.0,
                report.threshold * 100.0
            );
            println!(
                "Status:    {}",
                if report.has_drifted {
                    "DRIFT DETECTED"
                } else {
                    "healthy"
                }
            );

            for (channel, delivered) in &outcome.alerts {
                println!(
                    "Alert via {}: {}",
                    channel,
                    if *delivered { "sent" } else { "FAILED" }
                );
            }
        }
    }

    Ok(())
}

async fn cmd_test(config: Config) -> Result<()> {
    config.validate()?;

    println!("API base: {}", config.llm.api_base);
    println!("Testing connectivity with {}...", config.judge.model);

    let client = LlmClient::new(config.llm.clone());
    client.test_connection(&config.judge.model).await?;

    println!("Connection OK");
    Ok(())
}
