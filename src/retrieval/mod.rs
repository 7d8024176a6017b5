//! Retrieval over ingested documentation.
//!
//! Artifacts are split into paragraph-aligned chunks and ranked against
//! agent queries by token overlap. The index is phase-scoped: the
//! optimized phase rebuilds it with the generated skill document
//! substituted for any site skill artifact.

pub mod chunker;
pub mod index;

pub use chunker::{chunk_artifact, chunk_artifacts, Chunk, CHUNK_CHAR_BUDGET};
pub use index::{tokenize, RetrievalIndex, ScoredChunk};
