//! Snippet retrieval for question answering.
//!
//! `Retriever` is an enum over concrete backends. The built-in variant ranks
//! record sections by keyword overlap with the question; a vector-search
//! backend would be an additional variant.

use serde_json::Value;

use crate::record::Record;

/// How much of a section's serialized content goes into one snippet.
const SNIPPET_CHARS: usize = 400;

/// One ranked excerpt from a record section.
#[derive(Debug, Clone)]
pub struct Snippet {
    pub section: String,
    pub text: String,
    pub score: f32,
}

/// All available retrieval backends.
#[derive(Debug, Clone)]
pub enum Retriever {
    Sections(SectionRetriever),
}

impl Retriever {
    pub fn sections() -> Self {
        Retriever::Sections(SectionRetriever)
    }

    /// Locate the `k` most relevant section excerpts for `query`.
    pub fn search(&self, record: &Record, query: &str, k: usize) -> Vec<Snippet> {
        match self {
            Retriever::Sections(r) => r.search(record, query, k),
        }
    }
}

/// Keyword-overlap scoring over serialized sections.
#[derive(Debug, Clone)]
pub struct SectionRetriever;

impl SectionRetriever {
    pub fn search(&self, record: &Record, query: &str, k: usize) -> Vec<Snippet> {
        let terms = tokenize(query);

        let mut snippets: Vec<Snippet> = record
            .data
            .iter()
            .map(|(section, value)| {
                let text = excerpt(value);
                let haystack = format!("{} {}", section.to_lowercase(), text.to_lowercase());
                let hits = terms.iter().filter(|t| haystack.contains(*t)).count();
                Snippet {
                    section: section.clone(),
                    text,
                    score: hits as f32,
                }
            })
            .collect();

        snippets.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

        // When nothing matches, the first k sections still make usable
        // context for the generator.
        if snippets.iter().all(|s| s.score == 0.0) {
            snippets.truncate(k);
            return snippets;
        }

        snippets.retain(|s| s.score > 0.0);
        snippets.truncate(k);
        snippets
    }
}

fn tokenize(query: &str) -> Vec<String> {
    query
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2)
        .map(|w| w.to_string())
        .collect()
}

fn excerpt(value: &Value) -> String {
    let s = match value {
        Value::String(s) => s.clone(),
        other => serde_json::to_string(other).unwrap_or_default(),
    };
    if s.chars().count() > SNIPPET_CHARS {
        s.chars().take(SNIPPET_CHARS).collect()
    } else {
        s
    }
}
