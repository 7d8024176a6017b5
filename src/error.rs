//! Error types shared across docforge subsystems.
//!
//! Module-local errors (pool, store, agent, evaluation) live next to the
//! code that produces them; this module holds the errors that cross
//! subsystem boundaries: model-client failures and ingestion failures.

use thiserror::Error;

/// Errors that can occur during model-client operations.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Missing API key for provider '{0}'")]
    MissingApiKey(String),

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Failed to parse model response: {0}")]
    ParseError(String),

    #[error("Response did not satisfy schema '{schema}': {violations}")]
    SchemaViolation { schema: String, violations: String },

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Request timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },

    #[error("Retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
}

/// Errors that can occur while ingesting documentation artifacts.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Invalid docs URL '{0}'")]
    InvalidUrl(String),

    #[error("Fetch failed for '{url}': {reason}")]
    FetchFailed { url: String, reason: String },

    #[error("No ingestable content found at '{0}'")]
    NoContent(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
