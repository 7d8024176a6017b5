//! Token-overlap retrieval index.
//!
//! Scoring is `|query_tokens ∩ chunk_tokens| / sqrt(|chunk_tokens|)`, with
//! ties broken on lexicographic `(source_url, snippet_hash)` so top-K is
//! deterministic across invocations.

use std::collections::HashSet;

use crate::ingest::Artifact;

use super::chunker::{chunk_artifacts, Chunk};

/// A chunk returned from a query, with its score.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunk {
    pub source_url: String,
    pub snippet_hash: String,
    pub text: String,
    pub score: f64,
}

/// Lowercases, strips non-alphanumerics, and drops tokens under 3 chars.
pub fn tokenize(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| token.len() >= 3)
        .map(|token| token.to_string())
        .collect()
}

struct IndexedChunk {
    chunk: Chunk,
    tokens: HashSet<String>,
}

/// Phase-scoped retrieval index over a set of artifacts.
pub struct RetrievalIndex {
    chunks: Vec<IndexedChunk>,
}

impl RetrievalIndex {
    /// Builds an index by chunking every artifact.
    pub fn build(artifacts: &[Artifact]) -> Self {
        let chunks = chunk_artifacts(artifacts)
            .into_iter()
            .map(|chunk| IndexedChunk {
                tokens: tokenize(&chunk.text),
                chunk,
            })
            .collect();
        Self { chunks }
    }

    /// Number of chunks in the index.
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Returns true when the index holds no chunks.
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Returns true if `(source, snippet_hash)` identifies an indexed chunk.
    ///
    /// Comparison is exact; citation sources must match the chunk's URL
    /// byte for byte.
    pub fn contains(&self, source: &str, snippet_hash: &str) -> bool {
        self.chunks
            .iter()
            .any(|ic| ic.chunk.source_url == source && ic.chunk.snippet_hash == snippet_hash)
    }

    /// Scores every chunk against `query` and returns the top `k`.
    ///
    /// Chunks with no token overlap are omitted.
    pub fn retrieve(&self, query: &str, k: usize) -> Vec<ScoredChunk> {
        let query_tokens = tokenize(query);
        if query_tokens.is_empty() || k == 0 {
            return Vec::new();
        }

        let mut scored: Vec<ScoredChunk> = self
            .chunks
            .iter()
            .filter_map(|ic| {
                if ic.tokens.is_empty() {
                    return None;
                }
                let overlap = query_tokens.intersection(&ic.tokens).count();
                if overlap == 0 {
                    return None;
                }
                let score = overlap as f64 / (ic.tokens.len() as f64).sqrt();
                Some(ScoredChunk {
                    source_url: ic.chunk.source_url.clone(),
                    snippet_hash: ic.chunk.snippet_hash.clone(),
                    text: ic.chunk.text.clone(),
                    score,
                })
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.source_url.cmp(&b.source_url))
                .then_with(|| a.snippet_hash.cmp(&b.snippet_hash))
        });
        scored.truncate(k);
        scored
    }
}
