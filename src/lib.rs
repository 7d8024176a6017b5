//! docforge: evaluates how well a documentation site supports autonomous
//! code-generation agents.
//!
//! For each run the orchestrator ingests documentation artifacts from a base
//! URL, synthesizes a task set, and drives a population of model-backed
//! workers that each attempt every task through a bounded iterative loop
//! (retrieve, plan, act, reflect). Attempts are evaluated by deterministic
//! guards followed by an LLM rubric judge and aggregated into per-run totals
//! and failure taxonomies. An optional second phase regenerates an agent
//! skill document from baseline failures and re-executes all tasks to
//! measure uplift.

// Core modules
pub mod agent;
pub mod budget;
pub mod config;
pub mod error;
pub mod eval;
pub mod events;
pub mod ingest;
pub mod llm;
pub mod orchestrator;
pub mod prompts;
pub mod retrieval;
pub mod store;
pub mod types;

// Re-export commonly used error types
pub use error::{IngestError, LlmError};
pub use store::StoreError;
