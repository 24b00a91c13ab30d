//! Golden dataset loading.
//!
//! Both dataset flavors are CSV files. A missing required column is a
//! load-time fatal error; an unparsable `relevant_chunk_ids` cell in the
//! RAG dataset degrades to an empty list with a warning, matching how
//! sloppy ground-truth rows have historically been handled.

use crate::error::{EvalError, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::Path;
use tracing::warn;

/// A single golden-dataset question. Immutable once loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    /// Unique identifier for this question.
    pub id: String,
    /// Question category (reasoning, math, coding, vision-ocr, ...).
    pub category: String,
    /// The prompt sent to the model.
    pub input: String,
    /// Ground-truth answer the judge scores against.
    pub expected_output: String,
    /// Image path for vision questions, relative to the data directory.
    #[serde(default, deserialize_with = "empty_as_none")]
    pub image_path: Option<String>,
}

/// A single RAG-dataset question with ground-truth relevant chunks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagQuestion {
    /// Unique identifier for this question.
    pub id: String,
    /// Question category.
    pub category: String,
    /// The question posed against the knowledge base.
    pub question: String,
    /// Ground-truth answer.
    pub expected_answer: String,
    /// Chunk ids a correct retrieval should surface.
    pub relevant_chunk_ids: Vec<u32>,
    /// Free-form dataset notes.
    #[serde(default)]
    pub notes: String,
}

/// Deserialize an optional CSV cell, mapping empty/whitespace to `None`.
fn empty_as_none<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.trim().is_empty()))
}

/// Load the text-eval golden dataset from a CSV file.
///
/// Required columns: `id`, `category`, `input`, `expected_output`.
/// Optional column: `image_path`.
pub fn load_questions(path: &Path) -> Result<Vec<Question>> {
    let mut reader = csv::Reader::from_path(path)
        .map_err(|e| EvalError::Dataset(format!("Failed to open dataset {:?}: {}", path, e)))?;

    let mut questions = Vec::new();
    for record in reader.deserialize::<Question>() {
        let question = record?;
        if question.id.trim().is_empty()
            || question.input.trim().is_empty()
            || question.expected_output.trim().is_empty()
        {
            return Err(EvalError::Dataset(format!(
                "Dataset row with id '{}' is missing a required field",
                question.id
            )));
        }
        questions.push(question);
    }

    if questions.is_empty() {
        warn!(path = ?path, "dataset contains no questions");
    }

    Ok(questions)
}

/// Raw CSV shape of a RAG dataset row.
#[derive(Debug, Deserialize)]
struct RawRagRow {
    id: String,
    category: String,
    input: String,
    expected_output: String,
    relevant_chunk_ids: String,
    #[serde(default)]
    notes: String,
}

/// Load the RAG golden dataset from a CSV file.
///
/// Required columns: `id`, `category`, `input`, `expected_output`,
/// `relevant_chunk_ids` (a `"[1, 2]"`-style list). Optional: `notes`.
pub fn load_rag_questions(path: &Path) -> Result<Vec<RagQuestion>> {
    let mut reader = csv::Reader::from_path(path)
        .map_err(|e| EvalError::Dataset(format!("Failed to open dataset {:?}: {}", path, e)))?;

    let mut questions = Vec::new();
    for record in reader.deserialize::<RawRagRow>() {
        let row = record?;
        if row.id.trim().is_empty() || row.input.trim().is_empty() {
            return Err(EvalError::Dataset(format!(
                "RAG dataset row with id '{}' is missing a required field",
                row.id
            )));
        }

        let relevant_chunk_ids = match parse_id_list(&row.relevant_chunk_ids) {
            Some(ids) => ids,
            None => {
                warn!(
                    question_id = %row.id,
                    raw = %row.relevant_chunk_ids,
                    "failed to parse relevant_chunk_ids, treating as empty"
                );
                Vec::new()
            }
        };

        questions.push(RagQuestion {
            id: row.id,
            category: row.category,
            question: row.input,
            expected_answer: row.expected_output,
            relevant_chunk_ids,
            notes: row.notes,
        });
    }

    Ok(questions)
}

/// Parse a `"[1, 2]"`-style id list. A bare integer is accepted as a
/// one-element list. Returns `None` if any element fails to parse.
fn parse_id_list(raw: &str) -> Option<Vec<u32>> {
    let inner = raw.trim().trim_start_matches('[').trim_end_matches(']');
    if inner.trim().is_empty() {
        return Some(Vec::new());
    }

    inner
        .split(',')
        .map(|part| part.trim().parse::<u32>().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_csv(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_load_questions() {
        let file = write_csv(
            "id,category,input,expected_output,image_path\n\
             1,math,What is 2+2?,4,\n\
             2,vision-ocr,Read the sign,Main Street,images/sign.jpg\n",
        );

        let questions = load_questions(file.path()).unwrap();
        assert_eq!(questions.len(), 2);
        assert_eq!(questions[0].id, "1");
        assert!(questions[0].image_path.is_none());
        assert_eq!(
            questions[1].image_path.as_deref(),
            Some("images/sign.jpg")
        );
    }

    #[test]
    fn test_missing_column_is_fatal() {
        let file = write_csv("id,category,input\n1,math,What is 2+2?\n");
        assert!(load_questions(file.path()).is_err());
    }

    #[test]
    fn test_empty_required_field_is_fatal() {
        let file = write_csv("id,category,input,expected_output\n1,math,,4\n");
        assert!(load_questions(file.path()).is_err());
    }

    #[test]
    fn test_load_rag_questions() {
        let file = write_csv(
            "id,category,input,expected_output,relevant_chunk_ids,notes\n\
             1,geography,Capital of France?,Paris,\"[11]\",easy\n\
             2,llm,Compare GPT-4 and Claude,Both are LLMs,\"[0, 1]\",\n",
        );

        let questions = load_rag_questions(file.path()).unwrap();
        assert_eq!(questions.len(), 2);
        assert_eq!(questions[0].relevant_chunk_ids, vec![11]);
        assert_eq!(questions[1].relevant_chunk_ids, vec![0, 1]);
        assert_eq!(questions[0].notes, "easy");
    }

    #[test]
    fn test_bare_integer_id_list() {
        let file = write_csv(
            "id,category,input,expected_output,relevant_chunk_ids\n\
             1,geography,Capital of France?,Paris,11\n",
        );

        let questions = load_rag_questions(file.path()).unwrap();
        assert_eq!(questions[0].relevant_chunk_ids, vec![11]);
    }

    #[test]
    fn test_unparsable_id_list_degrades_to_empty() {
        let file = write_csv(
            "id,category,input,expected_output,relevant_chunk_ids\n\
             1,geography,Capital of France?,Paris,\"[a, b]\"\n",
        );

        let questions = load_rag_questions(file.path()).unwrap();
        assert!(questions[0].relevant_chunk_ids.is_empty());
    }
}
