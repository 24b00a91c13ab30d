//! RAG evaluation CLI.
//!
//! Retrieves context from the knowledge base for each question, generates
//! an answer with the candidate model, and judges both answer correctness
//! and groundedness. Requires the `embeddings` feature.

use anyhow::{Context, Result};
use clap::Parser;
use eval_dashboard::{
    config::Config,
    dataset::load_rag_questions,
    embeddings::SentenceEmbedder,
    llm::LlmClient,
    persistence::JsonRunStore,
    rag::{RagEvaluator, RagRunSummary},
    retrieval::{Retriever, load_knowledge_base},
};
use std::path::PathBuf;
use std::sync::Arc;

/// RAG evaluation: retrieval quality plus generation quality
#[derive(Parser)]
#[command(name = "rag-eval")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the RAG golden dataset CSV
    #[arg(short, long, default_value = "data/golden_dataset_rag.csv")]
    dataset: PathBuf,

    /// Models to evaluate (defaults to the configured list)
    #[arg(short, long)]
    model: Vec<String>,

    /// Number of documents to retrieve per question
    #[arg(short = 'k', long)]
    top_k: Option<usize>,

    /// Limit the number of questions (for quick runs)
    #[arg(long)]
    max_questions: Option<usize>,

    /// Run store directory
    #[arg(long, default_value = "data/store")]
    store: PathBuf,
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
    let mut config = Config::load()?;
    config.validate()?;

    if let Some(k) = cli.top_k {
        config.retrieval.top_k = k;
    }

    let mut questions =
        load_rag_questions(&cli.dataset).context("failed to load the RAG golden dataset")?;
    if let Some(max) = cli.max_questions {
        questions.truncate(max);
    }

    let documents = load_knowledge_base(&config.retrieval.knowledge_base)?;
    println!(
        "Knowledge base: {} documents, retrieving top-{}",
        documents.len(),
        config.retrieval.top_k
    );

    println!("Loading embedding model {}...", config.retrieval.embedding_model);
    let embedder = SentenceEmbedder::load(&config.retrieval.embedding_model)?;
    let retriever = Arc::new(Retriever::open(
        documents,
        embedder,
        &config.retrieval.cache_dir,
    )?);

    let models = if cli.model.is_empty() {
        config.eval.models.clone()
    } else {
        cli.model.clone()
    };

    let client = Arc::new(LlmClient::new(config.llm.clone()));
    let store = Arc::new(JsonRunStore::new(cli.store.clone()));
    let evaluator = Arc::new(RagEvaluator::new(client, retriever, &config).with_store(store));

    // Models run sequentially; they share one embedding model and the
    // per-model question pool already bounds concurrency.
    for model in &models {
        let summary = Arc::clone(&evaluator).run(model, &questions).await;
        print_summary(&summary);
    }

    Ok(())
}

fn print_summary(summary: &RagRunSummary) {
    println!("\n========== RAG Results: {} ==========", summary.model_name);

    if let Some(error) = &summary.error {
        println!("FAILED: {}", error);
        println!("========================================\n");
        return;
    }

    println!("Total questions: {}", summary.results.len());
    println!("\nRetrieval performance:");
    println!("  Precision@{}: {:.2}%", summary.retrieval_k, summary.avg_precision() * 100.0);
    println!("  Recall@{}:    {:.2}%", summary.retrieval_k, summary.avg_recall() * 100.0);
    println!("  F1@{}:        {:.2}%", summary.retrieval_k, summary.avg_f1() * 100.0);
    println!("  MRR:          {:.3}", summary.avg_mrr());
    println!("\nAnswer quality:");
    println!("  Avg answer score:    {:.2}%", summary.avg_answer_score() * 100.0);
    println!("  Avg grounding score: {:.2}%", summary.avg_grounding_score() * 100.0);

    let breakdown = summary.category_breakdown();
    if !breakdown.is_empty() {
        println!("\nBy category:");
        for (category, stats) in &breakdown {
            println!(
                "  {:<20} n={:<3} recall {:.2}% answer {:.2}% grounding {:.2}%",
                category,
                stats.count,
                stats.avg_recall * 100.0,
                stats.avg_answer_score * 100.0,
                stats.avg_grounding_score * 100.0,
            );
        }
    }

    println!("\nTotal time: {:.1}s", summary.evaluation_time);
    println!("========================================\n");
}
