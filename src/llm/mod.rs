//! Model-client abstraction for docforge.
//!
//! The orchestrator talks to model providers through the `ModelClient`
//! trait, which offers plain text completion and schema-validated JSON
//! completion. The JSON form tolerates fenced output and leading prose and
//! retries with a repair prompt on schema violations.
//!
//! # Cost isolation
//!
//! Providers do not report cost directly; the orchestrator prices each
//! call's token usage through the `CostModel` trait in [`cost`], so
//! provider-specific rates can be substituted without touching the loop.

pub mod client;
pub mod cost;
pub mod json;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::LlmError;
use crate::types::ModelOverrides;

pub use client::HttpModelClient;
pub use cost::{CostModel, FlatRateCost};

/// A message in a conversation with a model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Role of the message sender ("system", "user", "assistant").
    pub role: String,
    /// Content of the message.
    pub content: String,
}

impl Message {
    /// Create a new system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    /// Create a new user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    /// Create a new assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Configuration for one model call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider slug (e.g. "openrouter").
    pub provider: String,
    /// Model identifier.
    pub model: String,
    /// Sampling temperature.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Maximum tokens to generate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Hard per-call timeout in milliseconds.
    pub timeout_ms: u64,
    /// Transient-error retry count.
    pub retries: u32,
}

impl ModelConfig {
    /// Creates a config with default timeout and retries.
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            temperature: None,
            max_tokens: None,
            timeout_ms: crate::config::DEFAULT_TIMEOUT_MS,
            retries: crate::config::DEFAULT_MODEL_RETRIES,
        }
    }

    /// Sets the sampling temperature.
    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Sets the maximum tokens to generate.
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Sets the per-call timeout.
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Sets the retry count.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Applies per-worker overrides on top of this config.
    pub fn with_overrides(mut self, overrides: &ModelOverrides) -> Self {
        if let Some(temperature) = overrides.temperature {
            self.temperature = Some(temperature);
        }
        if let Some(max_tokens) = overrides.max_tokens {
            self.max_tokens = Some(max_tokens);
        }
        self
    }
}

/// Token usage reported for one completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    /// Total tokens consumed by the call.
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Result of a text completion.
#[derive(Debug, Clone)]
pub struct TextCompletion {
    pub text: String,
    pub usage: Usage,
    pub latency_ms: u64,
    pub model: String,
}

/// Result of a schema-validated JSON completion.
#[derive(Debug, Clone)]
pub struct JsonCompletion {
    /// The parsed, schema-conforming value.
    pub parsed: serde_json::Value,
    /// The raw response text the value was extracted from.
    pub text: String,
    pub usage: Usage,
    pub latency_ms: u64,
    pub model: String,
}

/// A named JSON schema used to validate model output.
///
/// The validator covers the subset of JSON Schema the prompts use:
/// `type`, `required`, `properties`, `items`, `enum`, `minimum`, `maximum`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonSchema {
    pub name: String,
    pub schema: serde_json::Value,
}

impl JsonSchema {
    /// Creates a named schema.
    pub fn new(name: impl Into<String>, schema: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            schema,
        }
    }

    /// Validates a value against this schema, returning all violations.
    pub fn validate(&self, value: &serde_json::Value) -> Result<(), Vec<String>> {
        let mut violations = Vec::new();
        validate_node(&self.schema, value, "$", &mut violations);
        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }
}

fn validate_node(
    schema: &serde_json::Value,
    value: &serde_json::Value,
    path: &str,
    violations: &mut Vec<String>,
) {
    if let Some(expected) = schema.get("type").and_then(|t| t.as_str()) {
        let matches = match expected {
            "object" => value.is_object(),
            "array" => value.is_array(),
            "string" => value.is_string(),
            "number" => value.is_number(),
            "integer" => value.is_i64() || value.is_u64(),
            "boolean" => value.is_boolean(),
            "null" => value.is_null(),
            _ => true,
        };
        if !matches {
            violations.push(format!("{}: expected {}", path, expected));
            return;
        }
    }

    if let Some(allowed) = schema.get("enum").and_then(|e| e.as_array()) {
        if !allowed.contains(value) {
            violations.push(format!("{}: value not in enum", path));
        }
    }

    if let Some(minimum) = schema.get("minimum").and_then(|m| m.as_f64()) {
        if let Some(n) = value.as_f64() {
            if n < minimum {
                violations.push(format!("{}: {} below minimum {}", path, n, minimum));
            }
        }
    }
    if let Some(maximum) = schema.get("maximum").and_then(|m| m.as_f64()) {
        if let Some(n) = value.as_f64() {
            if n > maximum {
                violations.push(format!("{}: {} above maximum {}", path, n, maximum));
            }
        }
    }

    if let (Some(object), Some(properties)) = (
        value.as_object(),
        schema.get("properties").and_then(|p| p.as_object()),
    ) {
        if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
            for name in required.iter().filter_map(|n| n.as_str()) {
                if !object.contains_key(name) {
                    violations.push(format!("{}: missing required field '{}'", path, name));
                }
            }
        }
        for (name, child_schema) in properties {
            if let Some(child) = object.get(name) {
                validate_node(child_schema, child, &format!("{}.{}", path, name), violations);
            }
        }
    }

    if let (Some(items), Some(item_schema)) = (value.as_array(), schema.get("items")) {
        for (index, item) in items.iter().enumerate() {
            validate_node(item_schema, item, &format!("{}[{}]", path, index), violations);
        }
    }
}

/// Trait for model providers.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Performs a plain text completion.
    async fn complete_text(
        &self,
        config: &ModelConfig,
        messages: &[Message],
    ) -> Result<TextCompletion, LlmError>;

    /// Performs a completion expected to yield JSON that satisfies `schema`.
    ///
    /// Implementations must tolerate fenced JSON and leading prose by
    /// extracting the first balanced object or array, and must retry with
    /// an instruction-repair message on schema-validation failure.
    async fn complete_json(
        &self,
        config: &ModelConfig,
        messages: &[Message],
        schema: &JsonSchema,
    ) -> Result<JsonCompletion, LlmError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_schema() -> JsonSchema {
        JsonSchema::new(
            "plan",
            json!({
                "type": "object",
                "required": ["plan_items", "rationale"],
                "properties": {
                    "plan_items": {"type": "array", "items": {"type": "string"}},
                    "rationale": {"type": "string"},
                    "confidence": {"type": "number", "minimum": 0.0, "maximum": 1.0}
                }
            }),
        )
    }

    #[test]
    fn test_schema_accepts_conforming_value() {
        let schema = sample_schema();
        let value = json!({
            "plan_items": ["read the auth docs"],
            "rationale": "start with authentication",
            "confidence": 0.8
        });
        assert!(schema.validate(&value).is_ok());
    }

    #[test]
    fn test_schema_reports_missing_required() {
        let schema = sample_schema();
        let value = json!({"plan_items": []});
        let violations = schema.validate(&value).unwrap_err();
        assert!(violations.iter().any(|v| v.contains("rationale")));
    }

    #[test]
    fn test_schema_reports_wrong_types() {
        let schema = sample_schema();
        let value = json!({"plan_items": "not an array", "rationale": 7});
        let violations = schema.validate(&value).unwrap_err();
        assert_eq!(violations.len(), 2);
    }

    #[test]
    fn test_schema_range_checks() {
        let schema = sample_schema();
        let value = json!({
            "plan_items": [],
            "rationale": "ok",
            "confidence": 1.5
        });
        let violations = schema.validate(&value).unwrap_err();
        assert!(violations.iter().any(|v| v.contains("above maximum")));
    }

    #[test]
    fn test_schema_enum_check() {
        let schema = JsonSchema::new(
            "status",
            json!({"type": "string", "enum": ["easy", "medium", "hard"]}),
        );
        assert!(schema.validate(&json!("medium")).is_ok());
        assert!(schema.validate(&json!("extreme")).is_err());
    }

    #[test]
    fn test_model_config_overrides() {
        let overrides = ModelOverrides {
            temperature: Some(0.1),
            max_tokens: Some(512),
        };
        let config = ModelConfig::new("openrouter", "model-x")
            .with_temperature(0.7)
            .with_overrides(&overrides);
        assert_eq!(config.temperature, Some(0.1));
        assert_eq!(config.max_tokens, Some(512));
    }
}
