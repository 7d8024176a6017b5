//! Paragraph-accumulating artifact chunker.
//!
//! Artifacts are split on blank lines; paragraphs accumulate into a chunk
//! until the next paragraph would push the accumulation past the character
//! budget. Chunk identity is `(source_url, sha256(text)[:16])`, which makes
//! identical snippets from the same page collapse to one identity.

use sha2::{Digest, Sha256};

use crate::ingest::Artifact;

/// Character budget per chunk accumulation.
pub const CHUNK_CHAR_BUDGET: usize = 1_200;

/// A paragraph-aligned slice of one artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub source_url: String,
    /// First 16 hex chars of the SHA-256 of `text`.
    pub snippet_hash: String,
    pub text: String,
}

impl Chunk {
    fn new(source_url: &str, text: String) -> Self {
        Self {
            source_url: source_url.to_string(),
            snippet_hash: snippet_hash(&text),
            text,
        }
    }
}

/// Truncated content hash used for chunk identity.
pub fn snippet_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

/// Chunks a single artifact.
///
/// An artifact whose content is non-empty but yields no paragraph chunks
/// (whitespace-only paragraphs) still emits one chunk truncated to the
/// character budget.
pub fn chunk_artifact(artifact: &Artifact) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    let mut accumulation = String::new();

    for paragraph in artifact.content.split("\n\n") {
        let paragraph = paragraph.trim();
        if paragraph.is_empty() {
            continue;
        }

        if !accumulation.is_empty()
            && accumulation.len() + 2 + paragraph.len() > CHUNK_CHAR_BUDGET
        {
            chunks.push(Chunk::new(&artifact.source_url, accumulation));
            accumulation = String::new();
        }

        if !accumulation.is_empty() {
            accumulation.push_str("\n\n");
        }
        accumulation.push_str(paragraph);
    }

    if !accumulation.is_empty() {
        chunks.push(Chunk::new(&artifact.source_url, accumulation));
    }

    if chunks.is_empty() {
        let content = artifact.content.trim();
        if !content.is_empty() {
            let truncated = truncate_at_boundary(content, CHUNK_CHAR_BUDGET);
            chunks.push(Chunk::new(&artifact.source_url, truncated.to_string()));
        }
    }

    chunks
}

/// Chunks every artifact in order.
pub fn chunk_artifacts(artifacts: &[Artifact]) -> Vec<Chunk> {
    artifacts.iter().flat_map(chunk_artifact).collect()
}

/// Truncates to at most `limit` bytes without splitting a UTF-8 character.
fn truncate_at_boundary(text: &str, limit: usize) -> &str {
    if text.len() <= limit {
        return text;
    }
    let mut end = limit;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
