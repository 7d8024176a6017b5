//! Documentation ingestion interface.
//!
//! Fetching is an external collaborator: the orchestrator only depends on
//! the `Ingestor` trait, which turns a base URL into a set of text
//! artifacts. Implementations live outside the core (an HTTP crawler, a
//! filesystem reader for tests).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::IngestError;

/// Kind of a fetched documentation artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    /// A regular documentation page.
    Page,
    /// The site's `llms.txt` summary.
    LlmsText,
    /// The site's `llms-full.txt` expansion.
    LlmsFullText,
    /// An agent skill document published by the site (or generated by the
    /// optimization phase).
    Skill,
}

impl std::fmt::Display for ArtifactType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ArtifactType::Page => "page",
            ArtifactType::LlmsText => "llms_text",
            ArtifactType::LlmsFullText => "llms_full_text",
            ArtifactType::Skill => "skill",
        };
        write!(f, "{}", name)
    }
}

/// One fetched document, keyed by `(artifact_type, source_url)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub artifact_type: ArtifactType,
    pub source_url: String,
    pub content: String,
    pub content_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl Artifact {
    /// Creates an artifact, computing the content hash.
    pub fn new(
        artifact_type: ArtifactType,
        source_url: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let content = content.into();
        let content_hash = content_sha256(&content);
        Self {
            artifact_type,
            source_url: source_url.into(),
            content,
            content_hash,
            metadata: None,
        }
    }
}

/// Hex SHA-256 of artifact content.
pub fn content_sha256(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Options passed to an ingestion call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestOptions {
    /// Maximum number of pages to discover and fetch.
    pub max_pages: usize,
    /// Per-fetch timeout in milliseconds.
    pub timeout_ms: u64,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            max_pages: 40,
            timeout_ms: 30_000,
        }
    }
}

/// Result of ingesting one documentation site.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestionResult {
    /// The docs URL after redirect/trailing-slash normalization.
    pub normalized_docs_url: String,
    /// Every fetched artifact.
    pub artifacts: Vec<Artifact>,
    /// Raw `llms.txt` content, when the site publishes one.
    pub llms_text: Option<String>,
    /// Raw `llms-full.txt` content, when the site publishes one.
    pub llms_full_text: Option<String>,
    /// Raw site skill document, when the site publishes one.
    pub skill_text: Option<String>,
    /// URLs of pages discovered during the crawl.
    pub discovered_pages: Vec<String>,
}

/// Fetches documentation artifacts from a base URL.
#[async_trait]
pub trait Ingestor: Send + Sync {
    /// Ingests the documentation site rooted at `docs_url`.
    async fn ingest(
        &self,
        docs_url: &str,
        options: &IngestOptions,
    ) -> Result<IngestionResult, IngestError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_hashing_is_stable() {
        let a = Artifact::new(ArtifactType::Page, "https://docs.example.com/auth", "body");
        let b = Artifact::new(ArtifactType::Page, "https://docs.example.com/auth", "body");
        assert_eq!(a.content_hash, b.content_hash);
        assert_eq!(a.content_hash.len(), 64);

        let c = Artifact::new(ArtifactType::Page, "https://docs.example.com/auth", "other");
        assert_ne!(a.content_hash, c.content_hash);
    }

    #[test]
    fn test_artifact_type_slugs() {
        assert_eq!(ArtifactType::Skill.to_string(), "skill");
        let json = serde_json::to_string(&ArtifactType::LlmsFullText).unwrap();
        assert_eq!(json, "\"llms_full_text\"");
    }
}
