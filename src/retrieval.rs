//! Vector retrieval over the knowledge base, plus ranking-quality metrics.
//!
//! Corpus embeddings are computed once when the retriever is opened and
//! cached on disk keyed by embedder identity. The cache is invalidated
//! when its entry count no longer matches the live corpus. After open,
//! the retriever is read-only, so concurrent queries need no locking.

use crate::error::{EvalError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Embedding backend seam. Implementations must be deterministic for a
/// fixed input so repeated retrieval is reproducible.
pub trait Embedder: Send + Sync {
    /// Stable identifier (model name), used to key the embedding cache.
    fn id(&self) -> &str;

    /// Embed a single text.
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a batch of texts.
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>>;
}

/// One chunk of the knowledge base.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeDocument {
    pub chunk_id: u32,
    pub content: String,
    pub domain: String,
    pub topic: String,
}

#[derive(Debug, Deserialize)]
struct KnowledgeBaseFile {
    documents: Vec<KnowledgeDocument>,
}

/// Load the knowledge base from a `{"documents": [...]}` JSON file.
pub fn load_knowledge_base(path: &Path) -> Result<Vec<KnowledgeDocument>> {
    let content = fs::read_to_string(path).map_err(|e| EvalError::io(path, e))?;
    let file: KnowledgeBaseFile = serde_json::from_str(&content)
        .map_err(|e| EvalError::KnowledgeBase(format!("{:?}: {}", path, e)))?;

    if file.documents.is_empty() {
        return Err(EvalError::KnowledgeBase(format!(
            "{:?} contains no documents",
            path
        )));
    }

    Ok(file.documents)
}

/// A retrieved document with its similarity score and 1-based rank.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedDocument {
    pub chunk_id: u32,
    pub content: String,
    pub domain: String,
    pub topic: String,
    pub score: f32,
    pub rank: usize,
}

/// Ranking-quality metrics for one query at a fixed retrieval depth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalMetrics {
    pub precision_at_k: f64,
    pub recall_at_k: f64,
    pub f1_at_k: f64,
    pub mrr: f64,
    pub avg_similarity_score: f64,
    pub retrieved_chunk_ids: Vec<u32>,
    pub true_positives: usize,
    pub total_relevant: usize,
}

impl RetrievalMetrics {
    /// Pure computation over a retrieved list and the ground-truth
    /// relevant set. Precision divides by `top_k`, not by how many
    /// documents were actually returned.
    pub fn compute(retrieved: &[RetrievedDocument], relevant_ids: &[u32], top_k: usize) -> Self {
        let retrieved_chunk_ids: Vec<u32> = retrieved.iter().map(|d| d.chunk_id).collect();
        let relevant: HashSet<u32> = relevant_ids.iter().copied().collect();
        let retrieved_set: HashSet<u32> = retrieved_chunk_ids.iter().copied().collect();

        let true_positives = relevant.intersection(&retrieved_set).count();

        let precision = if top_k > 0 {
            true_positives as f64 / top_k as f64
        } else {
            0.0
        };

        let recall = if relevant.is_empty() {
            0.0
        } else {
            true_positives as f64 / relevant.len() as f64
        };

        let f1 = if precision + recall > 0.0 {
            (2.0 * precision * recall) / (precision + recall)
        } else {
            0.0
        };

        let mrr = retrieved_chunk_ids
            .iter()
            .position(|id| relevant.contains(id))
            .map(|pos| 1.0 / (pos as f64 + 1.0))
            .unwrap_or(0.0);

        let avg_similarity_score = if retrieved.is_empty() {
            0.0
        } else {
            retrieved.iter().map(|d| d.score as f64).sum::<f64>() / retrieved.len() as f64
        };

        Self {
            precision_at_k: precision.clamp(0.0, 1.0),
            recall_at_k: recall.clamp(0.0, 1.0),
            f1_at_k: f1.clamp(0.0, 1.0),
            mrr: mrr.clamp(0.0, 1.0),
            avg_similarity_score,
            retrieved_chunk_ids,
            true_positives,
            total_relevant: relevant.len(),
        }
    }

    /// All-zero metrics, used when retrieval itself failed.
    pub fn zeroed() -> Self {
        Self {
            precision_at_k: 0.0,
            recall_at_k: 0.0,
            f1_at_k: 0.0,
            mrr: 0.0,
            avg_similarity_score: 0.0,
            retrieved_chunk_ids: Vec::new(),
            true_positives: 0,
            total_relevant: 0,
        }
    }
}

/// Cosine similarity with epsilon-guarded normalization.
fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    const EPS: f32 = 1e-10;

    if a.len() != b.len() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    dot / ((norm_a + EPS) * (norm_b + EPS))
}

/// Top-K cosine retriever over a frozen corpus.
pub struct Retriever<E: Embedder> {
    documents: Vec<KnowledgeDocument>,
    embeddings: Vec<Vec<f32>>,
    embedder: E,
}

impl<E: Embedder> Retriever<E> {
    /// Open a retriever, loading corpus embeddings from cache or
    /// computing and caching them.
    pub fn open(documents: Vec<KnowledgeDocument>, embedder: E, cache_dir: &Path) -> Result<Self> {
        let cache_path = cache_file(cache_dir, embedder.id());

        let embeddings = match load_cache(&cache_path) {
            Some(cached) if cached.len() == documents.len() => {
                info!(path = ?cache_path, entries = cached.len(), "loaded embedding cache");
                cached
            }
            Some(cached) => {
                warn!(
                    cached = cached.len(),
                    corpus = documents.len(),
                    "embedding cache size mismatch, regenerating"
                );
                build_and_cache(&documents, &embedder, &cache_path)?
            }
            None => build_and_cache(&documents, &embedder, &cache_path)?,
        };

        Ok(Self {
            documents,
            embeddings,
            embedder,
        })
    }

    /// Number of documents in the corpus.
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    /// Check if the corpus is empty.
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Retrieve the top-k most similar documents for a query.
    ///
    /// Ranking is by descending similarity; ties keep corpus order
    /// (stable sort), so results are deterministic for a fixed corpus.
    pub fn retrieve(&self, query: &str, top_k: usize) -> Result<Vec<RetrievedDocument>> {
        let query_embedding = self.embedder.embed(query)?;

        let mut scored: Vec<(usize, f32)> = self
            .embeddings
            .iter()
            .enumerate()
            .map(|(idx, embedding)| (idx, cosine_similarity(&query_embedding, embedding)))
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);

        Ok(scored
            .into_iter()
            .enumerate()
            .map(|(rank, (idx, score))| {
                let doc = &self.documents[idx];
                RetrievedDocument {
                    chunk_id: doc.chunk_id,
                    content: doc.content.clone(),
                    domain: doc.domain.clone(),
                    topic: doc.topic.clone(),
                    score,
                    rank: rank + 1,
                }
            })
            .collect())
    }

    /// Retrieve and score against the ground-truth relevant set.
    pub fn evaluate_retrieval(
        &self,
        query: &str,
        relevant_ids: &[u32],
        top_k: usize,
    ) -> Result<RetrievalMetrics> {
        let retrieved = self.retrieve(query, top_k)?;
        Ok(RetrievalMetrics::compute(&retrieved, relevant_ids, top_k))
    }
}

/// Format retrieved documents as context for the generation prompt.
pub fn format_context(docs: &[RetrievedDocument]) -> String {
    docs.iter()
        .enumerate()
        .map(|(i, doc)| {
            format!(
                "[Document {}]\nTopic: {} ({})\n{}\n",
                i + 1,
                doc.topic,
                doc.domain,
                doc.content
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn cache_file(cache_dir: &Path, embedder_id: &str) -> PathBuf {
    cache_dir.join(format!("embeddings_{}.bin", embedder_id.replace('/', "_")))
}

fn load_cache(path: &Path) -> Option<Vec<Vec<f32>>> {
    let data = fs::read(path).ok()?;
    let config = bincode::config::standard();
    match bincode::decode_from_slice::<Vec<Vec<f32>>, _>(&data, config) {
        Ok((embeddings, _)) => Some(embeddings),
        Err(e) => {
            warn!(path = ?path, error = %e, "discarding corrupt embedding cache");
            None
        }
    }
}

fn build_and_cache<E: Embedder>(
    documents: &[KnowledgeDocument],
    embedder: &E,
    cache_path: &Path,
) -> Result<Vec<Vec<f32>>> {
    info!(documents = documents.len(), model = embedder.id(), "computing corpus embeddings");

    let texts: Vec<&str> = documents.iter().map(|d| d.content.as_str()).collect();
    let embeddings = embedder.embed_batch(&texts)?;

    if let Some(parent) = cache_path.parent() {
        if !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| EvalError::io(parent, e))?;
        }
    }

    let config = bincode::config::standard();
    let data = bincode::encode_to_vec(&embeddings, config)
        .map_err(|e| EvalError::Serialization(e.to_string()))?;
    fs::write(cache_path, &data).map_err(|e| EvalError::io(cache_path, e))?;

    Ok(embeddings)
}
