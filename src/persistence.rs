//! Run storage boundary traits and a JSON-file store.
//!
//! The deployed system persists runs in a relational store; the core only
//! depends on the [`RunStore`] / [`RunHistory`] contracts. [`JsonRunStore`]
//! is the in-tree implementation, writing one pretty-printed JSON file per
//! run, which doubles as a human-inspectable backup.

use crate::error::{EvalError, Result};
use crate::evaluate::ModelRunSummary;
use crate::rag::RagRunSummary;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use walkdir::WalkDir;

/// One historical run as seen by the drift detector. `metric` is the
/// tracked metric: accuracy for text runs, recall for RAG runs.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub run_id: i64,
    pub model_name: String,
    pub timestamp: DateTime<Utc>,
    pub metric: f64,
}

/// Persistence collaborator: saves completed run summaries.
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn save_run(&self, summary: &ModelRunSummary) -> Result<i64>;
    async fn save_rag_run(&self, summary: &RagRunSummary) -> Result<i64>;
}

/// Query collaborator: run history for one model.
pub trait RunHistory: Send + Sync {
    fn runs_for_model(&self, model_name: &str) -> Result<Vec<RunRecord>>;
}

const TEXT_KIND: &str = "runs";
const RAG_KIND: &str = "rag_runs";

/// Directory-backed store: `<root>/runs/<model>/run_<id>.json` and
/// `<root>/rag_runs/<model>/run_<id>.json`.
pub struct JsonRunStore {
    root: PathBuf,
    // Serializes id allocation across concurrent saves
    write_lock: Mutex<()>,
}

impl JsonRunStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// History view over RAG runs, tracking recall as the drift metric.
    pub fn rag_history(&self) -> RagHistoryView<'_> {
        RagHistoryView { store: self }
    }

    fn save<T: Serialize>(&self, kind: &str, model_name: &str, summary: &T) -> Result<i64> {
        let _guard = self.write_lock.lock().expect("store lock poisoned");

        let kind_dir = self.root.join(kind);
        let model_dir = kind_dir.join(sanitize(model_name));
        fs::create_dir_all(&model_dir).map_err(|e| EvalError::io(&model_dir, e))?;

        let run_id = next_run_id(&kind_dir);
        let path = model_dir.join(format!("run_{:05}.json", run_id));

        let json = serde_json::to_string_pretty(summary)?;
        fs::write(&path, json).map_err(|e| EvalError::io(&path, e))?;

        Ok(run_id)
    }

    fn load_records<T, F>(&self, kind: &str, model_name: &str, metric: F) -> Result<Vec<RunRecord>>
    where
        T: DeserializeOwned,
        F: Fn(&T) -> (DateTime<Utc>, f64),
    {
        let model_dir = self.root.join(kind).join(sanitize(model_name));
        if !model_dir.exists() {
            return Ok(Vec::new());
        }

        let mut records = Vec::new();
        for entry in WalkDir::new(&model_dir).max_depth(1) {
            let entry = entry.map_err(|e| EvalError::Store(e.to_string()))?;
            let Some(run_id) = parse_run_id(entry.path()) else {
                continue;
            };

            let content =
                fs::read_to_string(entry.path()).map_err(|e| EvalError::io(entry.path(), e))?;
            let summary: T = serde_json::from_str(&content)?;
            let (timestamp, value) = metric(&summary);

            records.push(RunRecord {
                run_id,
                model_name: model_name.to_string(),
                timestamp,
                metric: value,
            });
        }

        records.sort_by_key(|r| r.run_id);
        Ok(records)
    }
}

#[async_trait]
impl RunStore for JsonRunStore {
    async fn save_run(&self, summary: &ModelRunSummary) -> Result<i64> {
        self.save(TEXT_KIND, &summary.model_name, summary)
    }

    async fn save_rag_run(&self, summary: &RagRunSummary) -> Result<i64> {
        self.save(RAG_KIND, &summary.model_name, summary)
    }
}

impl RunHistory for JsonRunStore {
    fn runs_for_model(&self, model_name: &str) -> Result<Vec<RunRecord>> {
        self.load_records(TEXT_KIND, model_name, |summary: &ModelRunSummary| {
            (summary.timestamp, summary.accuracy())
        })
    }
}

/// [`RunHistory`] over RAG runs, exposing average recall as the metric.
pub struct RagHistoryView<'a> {
    store: &'a JsonRunStore,
}

impl RunHistory for RagHistoryView<'_> {
    fn runs_for_model(&self, model_name: &str) -> Result<Vec<RunRecord>> {
        self.store
            .load_records(RAG_KIND, model_name, |summary: &RagRunSummary| {
                (summary.timestamp, summary.avg_recall())
            })
    }
}

fn sanitize(model_name: &str) -> String {
    model_name.replace(['/', ':'], "_")
}

/// Highest existing run id under a kind directory, plus one.
fn next_run_id(kind_dir: &Path) -> i64 {
    let mut max_id = 0;
    for entry in WalkDir::new(kind_dir).max_depth(2).into_iter().flatten() {
        if let Some(id) = parse_run_id(entry.path()) {
            max_id = max_id.max(id);
        }
    }
    max_id + 1
}

fn parse_run_id(path: &Path) -> Option<i64> {
    let name = path.file_name()?.to_str()?;
    let id = name.strip_prefix("run_")?.strip_suffix(".json")?;
    id.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluate::EvaluationResult;
    use tempfile::TempDir;

    fn summary(model: &str, score: f64) -> ModelRunSummary {
        ModelRunSummary {
            model_name: model.to_string(),
            timestamp: Utc::now(),
            evaluation_time: 1.5,
            results: vec![EvaluationResult {
                question_id: "1".to_string(),
                category: "math".to_string(),
                input: "2+2?".to_string(),
                expected_output: "4".to_string(),
                model_response: Some("4".to_string()),
                score,
                reasoning: "exact".to_string(),
                latency: Some(0.4),
                retry_count: 0,
            }],
            error: None,
        }
    }

    #[tokio::test]
    async fn test_save_and_read_back_runs() {
        let dir = TempDir::new().unwrap();
        let store = JsonRunStore::new(dir.path());

        let first = store.save_run(&summary("gpt-4o", 1.0)).await.unwrap();
        let second = store.save_run(&summary("gpt-4o", 0.5)).await.unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 2);

        let records = store.runs_for_model("gpt-4o").unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].run_id, 1);
        assert!((records[0].metric - 1.0).abs() < 1e-9);
        assert!((records[1].metric - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_ids_are_global_across_models() {
        let dir = TempDir::new().unwrap();
        let store = JsonRunStore::new(dir.path());

        let a = store.save_run(&summary("model-a", 1.0)).await.unwrap();
        let b = store.save_run(&summary("model-b", 1.0)).await.unwrap();
        assert_eq!(a, 1);
        assert_eq!(b, 2);
    }

    #[tokio::test]
    async fn test_unknown_model_has_no_history() {
        let dir = TempDir::new().unwrap();
        let store = JsonRunStore::new(dir.path());
        assert!(store.runs_for_model("never-ran").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_model_names_with_slashes() {
        let dir = TempDir::new().unwrap();
        let store = JsonRunStore::new(dir.path());

        store
            .save_run(&summary("org/model:latest", 0.8))
            .await
            .unwrap();
        let records = store.runs_for_model("org/model:latest").unwrap();
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn test_rag_history_tracks_recall() {
        let dir = TempDir::new().unwrap();
        let store = JsonRunStore::new(dir.path());

        let rag = RagRunSummary {
            model_name: "gpt-4o".to_string(),
            retrieval_k: 5,
            timestamp: Utc::now(),
            evaluation_time: 2.0,
            results: Vec::new(),
            error: None,
        };
        store.save_rag_run(&rag).await.unwrap();

        let records = store.rag_history().runs_for_model("gpt-4o").unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].metric, 0.0);

        // Text and RAG histories are separate namespaces
        assert!(store.runs_for_model("gpt-4o").unwrap().is_empty());
    }
}
