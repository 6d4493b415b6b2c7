//! Q&A knowledge base for prompt context retrieval.
//!
//! A small lexical-overlap retriever over a preloaded catalogue of question
//! and answer pairs. No embeddings; scoring is keyword intersection weighted
//! by the fraction of the query's keywords that matched.

use crate::error::{Result, UmebotError};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use tracing::{info, warn};

/// One catalogue entry.
#[derive(Debug, Clone, Deserialize)]
pub struct KnowledgeEntry {
    /// Canonical question text.
    pub q: String,
    /// Known answer text.
    pub a: String,
}

/// Preloaded Q&A catalogue.
#[derive(Debug, Default)]
pub struct KnowledgeBase {
    entries: Vec<KnowledgeEntry>,
}

/// Keywords of a text: lowercase alphanumeric words longer than 2 chars.
fn keywords(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| word.len() > 2)
        .map(str::to_owned)
        .collect()
}

impl KnowledgeBase {
    /// Empty catalogue; retrieval always yields nothing.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load a JSON-lines catalogue; one `{"q": ..., "a": ...}` object per line.
    ///
    /// A missing file degrades to an empty catalogue with a warning.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but a line cannot be parsed.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!(
                "knowledge base {} not found, context retrieval disabled",
                path.display()
            );
            return Ok(Self::empty());
        }

        let raw = std::fs::read_to_string(path)?;
        let mut entries = Vec::new();
        for (number, line) in raw.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let entry: KnowledgeEntry = serde_json::from_str(line).map_err(|e| {
                UmebotError::Config(format!(
                    "knowledge base {} line {}: {e}",
                    path.display(),
                    number + 1
                ))
            })?;
            entries.push(entry);
        }

        info!("knowledge base loaded: {} entries", entries.len());
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Top-`k` context snippets for a query, best match first.
    ///
    /// Entries score by keyword intersection with the query, weighted by the
    /// matched fraction of the query's keywords; zero-score entries are skipped.
    pub fn retrieve(&self, query: &str, k: usize) -> Vec<String> {
        let query_keywords = keywords(query);
        if query_keywords.is_empty() || k == 0 {
            return Vec::new();
        }

        let mut scored: Vec<(f64, &KnowledgeEntry)> = self
            .entries
            .iter()
            .filter_map(|entry| {
                let common = keywords(&entry.q)
                    .intersection(&query_keywords)
                    .count();
                if common == 0 {
                    return None;
                }
                let score = common as f64 * (common as f64 / query_keywords.len() as f64);
                Some((score, entry))
            })
            .collect();

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored
            .into_iter()
            .take(k)
            .map(|(_, entry)| {
                format!(
                    "Contexto relevante (pregunta similar: \"{}\" respuesta conocida: \"{}\")",
                    entry.q, entry.a
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn base_with(entries: &[(&str, &str)]) -> KnowledgeBase {
        KnowledgeBase {
            entries: entries
                .iter()
                .map(|(q, a)| KnowledgeEntry {
                    q: (*q).to_owned(),
                    a: (*a).to_owned(),
                })
                .collect(),
        }
    }

    #[test]
    fn retrieval_ranks_by_overlap() {
        let base = base_with(&[
            ("donde queda la biblioteca central", "en el edificio B"),
            ("horario de la cafeteria", "de 8 a 18"),
        ]);
        let hits = base.retrieve("donde esta la biblioteca", 2);
        assert_eq!(hits.len(), 1);
        assert!(hits[0].contains("edificio B"));
    }

    #[test]
    fn no_keywords_yields_nothing() {
        let base = base_with(&[("a b c", "x")]);
        assert!(base.retrieve("y el de", 3).is_empty());
    }

    #[test]
    fn missing_file_degrades_to_empty() {
        let base = KnowledgeBase::load(Path::new("/nonexistent/kb.jsonl")).unwrap();
        assert!(base.is_empty());
    }
}
