//! Fixed instruction templates for the evaluation pipeline.
//!
//! Placeholders use `{name}` and are filled with simple string replacement.

/// Collection of prompts used for judging and RAG answer generation.
pub struct Prompts;

impl Prompts {
    /// System prompt for candidate models under evaluation.
    pub fn system_assistant() -> &'static str {
        "You are a helpful assistant."
    }

    /// System prompt for the judge model.
    pub fn system_judge() -> &'static str {
        "You are a strict evaluator."
    }

    /// Prompt to score a candidate answer against the expected answer.
    ///
    /// Demands strict JSON so the response parses straight into a
    /// [`crate::judge::JudgeVerdict`].
    pub fn judge_answer() -> &'static str {
        r#"You are an objective evaluator.
Rate the correctness of the following answer compared to the expected answer.

Scale:
- 1.0 = Completely correct
- 0.7 = Mostly correct with minor issues
- 0.5 = Partially correct
- 0.3 = Mostly incorrect
- 0.0 = Completely incorrect or irrelevant

Allow for paraphrasing and different wording.

Return ONLY JSON:
{ "score": 0.0 to 1.0, "reasoning": "..." }

Expected answer: {expected}
Model answer: {answer}"#
    }

    /// Prompt to judge whether a generated answer is grounded in the
    /// retrieved context.
    pub fn judge_grounding() -> &'static str {
        r#"Evaluate if the answer is grounded in the provided context.

Question: {question}

Context:
{context}

Answer: {answer}

Task:
1. Check if the answer's key claims can be verified using the context
2. Identify any hallucinations or information not present in context
3. Rate grounding on a scale of 0-1:
   - 1.0 = Fully grounded, all claims supported by context
   - 0.7 = Mostly grounded, minor details not in context
   - 0.5 = Partially grounded, some unsupported claims
   - 0.3 = Poorly grounded, mostly unsupported
   - 0.0 = Not grounded, hallucinated or irrelevant

Return ONLY JSON:
{ "score": 0.0 to 1.0, "reasoning": "..." }"#
    }

    /// Prompt to generate an answer from retrieved context.
    pub fn rag_answer() -> &'static str {
        r#"Answer the question using ONLY the information provided in the context below.
If the context does not contain enough information to answer the question, say "Not mentioned in the provided context."

Context:
{context}

Question: {question}

Answer:"#
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompts_are_not_empty() {
        assert!(!Prompts::system_assistant().is_empty());
        assert!(!Prompts::system_judge().is_empty());
        assert!(!Prompts::judge_answer().is_empty());
        assert!(!Prompts::judge_grounding().is_empty());
        assert!(!Prompts::rag_answer().is_empty());
    }

    #[test]
    fn test_placeholders_present() {
        assert!(Prompts::judge_answer().contains("{expected}"));
        assert!(Prompts::judge_answer().contains("{answer}"));
        assert!(Prompts::judge_grounding().contains("{context}"));
        assert!(Prompts::rag_answer().contains("{question}"));
    }
}
