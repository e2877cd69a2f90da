//! Retrieval: tenant-partitioned vector index plus graph expansion.

pub mod hybrid;
pub mod vector;

pub use hybrid::RetrievalEngine;
pub use vector::VectorIndex;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Knobs for [`RetrievalEngine`].
#[derive(Debug, Clone)]
pub struct RetrievalSettings {
    pub top_k: usize,
    pub hop_limit: usize,
    pub max_facts: usize,
    /// Overall budget for one retrieval, embedding included.
    pub latency_budget: Duration,
    pub max_keyword_hints: usize,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            top_k: 8,
            hop_limit: 1,
            max_facts: 20,
            latency_budget: Duration::from_millis(800),
            max_keyword_hints: 8,
        }
    }
}

/// A ranked fact ready for the prompt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Fact {
    pub text: String,
    /// Similarity of the seed node the fact was reached from.
    pub score: f32,
    pub started_at: DateTime<Utc>,
    pub edge_id: String,
}

fn clean_token(raw: &str) -> &str {
    let trimmed = raw.trim_matches(|c: char| !c.is_alphanumeric());
    trimmed
        .strip_suffix("'s")
        .or_else(|| trimmed.strip_suffix("’s"))
        .unwrap_or(trimmed)
}

fn is_capitalised(token: &str) -> bool {
    token.chars().next().is_some_and(|c| c.is_uppercase())
}

/// Capitalised tokens and runs of capitalised tokens, as name guesses for
/// structured lookup. Deduplicated case-insensitively, in order of appearance.
///
/// "Does Mary Jane still work at Acme?" gives
/// `["Does Mary Jane", "Does", "Mary", "Jane", "Acme"]`.
pub fn keyword_hints(query_text: &str, max_hints: usize) -> Vec<String> {
    let mut runs: Vec<Vec<&str>> = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    for raw in query_text.split_whitespace() {
        let token = clean_token(raw);
        if !token.is_empty() && is_capitalised(token) {
            current.push(token);
        } else if !current.is_empty() {
            runs.push(std::mem::take(&mut current));
        }
        // Punctuation after a word ends the run: "Paris, London" are two names.
        let ends_run = raw
            .chars()
            .last()
            .is_some_and(|c| matches!(c, ',' | '.' | ';' | ':' | '?' | '!'));
        if ends_run && !current.is_empty() {
            runs.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        runs.push(current);
    }

    let mut hints: Vec<String> = Vec::new();
    let mut push = |hint: String| {
        if !hints.iter().any(|h| h.eq_ignore_ascii_case(&hint)) {
            hints.push(hint);
        }
    };
    for run in runs {
        if run.len() > 1 {
            push(run.join(" "));
        }
        for token in run {
            push(token.to_string());
        }
    }
    hints.truncate(max_hints);
    hints
}
