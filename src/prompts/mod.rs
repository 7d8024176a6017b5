//! Prompt builders and response schemas for every model call.
//!
//! All JSON-returning calls pair a message builder with a named schema so
//! the model client can validate and repair responses. Builders receive
//! typed values and render plain text; nothing here talks to a provider.

use serde_json::json;

use crate::llm::{JsonSchema, Message};
use crate::retrieval::ScoredChunk;
use crate::types::{AgentMemoryState, Task, TaskAttempt, TaskEvaluation};

/// Evidence chunks included in judge prompts.
pub const JUDGE_EVIDENCE_LIMIT: usize = 12;

// ---------------------------------------------------------------------------
// Agent loop
// ---------------------------------------------------------------------------

/// Schema for the plan phase.
pub fn plan_schema() -> JsonSchema {
    JsonSchema::new(
        "plan",
        json!({
            "type": "object",
            "required": ["plan_items", "rationale"],
            "properties": {
                "plan_items": {"type": "array", "items": {"type": "string"}},
                "rationale": {"type": "string"}
            }
        }),
    )
}

/// Schema for the act phase.
pub fn act_schema() -> JsonSchema {
    JsonSchema::new(
        "act",
        json!({
            "type": "object",
            "required": ["answer", "step_output", "citations", "done"],
            "properties": {
                "answer": {"type": "string"},
                "step_output": {"type": "string"},
                "citations": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "required": ["source", "snippet_hash", "excerpt"],
                        "properties": {
                            "source": {"type": "string"},
                            "snippet_hash": {"type": "string"},
                            "excerpt": {"type": "string"}
                        }
                    }
                },
                "done": {"type": "boolean"},
                "done_reason": {"type": "string"},
                "discovered_facts": {"type": "array", "items": {"type": "string"}}
            }
        }),
    )
}

/// Schema for the reflect phase.
pub fn reflect_schema() -> JsonSchema {
    JsonSchema::new(
        "reflect",
        json!({
            "type": "object",
            "required": ["should_continue", "summary", "plan_updates", "confidence"],
            "properties": {
                "should_continue": {"type": "boolean"},
                "summary": {"type": "string"},
                "plan_updates": {"type": "array", "items": {"type": "string"}},
                "confidence": {"type": "number", "minimum": 0.0, "maximum": 1.0},
                "stop_reason": {"type": "string"}
            }
        }),
    )
}

fn render_chunks(chunks: &[ScoredChunk]) -> String {
    chunks
        .iter()
        .enumerate()
        .map(|(i, chunk)| {
            format!(
                "[{}] source: {}\nsnippet_hash: {}\n{}",
                i + 1,
                chunk.source_url,
                chunk.snippet_hash,
                chunk.text
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn render_memory(memory: &AgentMemoryState) -> String {
    let plan = memory
        .plan
        .iter()
        .map(|item| {
            format!(
                "- [{}] {}",
                if item.done { "x" } else { " " },
                item.text
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    let facts = memory
        .facts
        .iter()
        .map(|f| format!("- {}", f))
        .collect::<Vec<_>>()
        .join("\n");
    let summaries = memory
        .step_summaries
        .iter()
        .map(|s| format!("- {}", s))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "Goal: {}\nStep: {}\nRemaining budget: {} steps, {} tokens\n\nPlan:\n{}\n\nKnown facts:\n{}\n\nPrevious step summaries:\n{}",
        memory.goal,
        memory.current_step,
        memory.remaining_budget.steps,
        memory.remaining_budget.tokens,
        if plan.is_empty() { "(none)" } else { plan.as_str() },
        if facts.is_empty() { "(none)" } else { facts.as_str() },
        if summaries.is_empty() { "(none)" } else { summaries.as_str() },
    )
}

const AGENT_SYSTEM_PROMPT: &str = "You are a coding agent completing a documentation-driven task. \
You may only rely on the documentation excerpts provided to you; never invent APIs, \
endpoints, or configuration that the excerpts do not show. Cite the excerpts you use \
by their source and snippet_hash. Respond with JSON only.";

/// Messages for the plan phase.
pub fn build_plan_messages(
    task: &Task,
    memory: &AgentMemoryState,
    chunks: &[ScoredChunk],
) -> Vec<Message> {
    vec![
        Message::system(AGENT_SYSTEM_PROMPT),
        Message::user(format!(
            "Task: {}\n{}\n\nExpected signals a complete answer covers: {}\n\n{}\n\n\
             Documentation excerpts:\n{}\n\n\
             Produce or revise a short ordered plan for completing the task. \
             Return JSON: {{\"plan_items\": [..], \"rationale\": \"..\"}}",
            task.name,
            task.description,
            task.expected_signals.join(", "),
            render_memory(memory),
            render_chunks(chunks),
        )),
    ]
}

/// Messages for the act phase.
pub fn build_act_messages(
    task: &Task,
    memory: &AgentMemoryState,
    chunks: &[ScoredChunk],
    plan_items: &[String],
) -> Vec<Message> {
    vec![
        Message::system(AGENT_SYSTEM_PROMPT),
        Message::user(format!(
            "Task: {}\n{}\n\n{}\n\nCurrent plan:\n{}\n\n\
             Documentation excerpts:\n{}\n\n\
             Execute the next plan item(s). Update your working answer so it could be \
             followed end to end, cite every excerpt you used, and set done=true only \
             when the answer fully completes the task. Return JSON: \
             {{\"answer\": \"..\", \"step_output\": \"..\", \"citations\": \
             [{{\"source\": \"..\", \"snippet_hash\": \"..\", \"excerpt\": \"..\"}}], \
             \"done\": false, \"done_reason\": \"..\", \"discovered_facts\": [..]}}",
            task.name,
            task.description,
            render_memory(memory),
            plan_items
                .iter()
                .map(|p| format!("- {}", p))
                .collect::<Vec<_>>()
                .join("\n"),
            render_chunks(chunks),
        )),
    ]
}

/// Messages for the reflect phase.
pub fn build_reflect_messages(
    task: &Task,
    memory: &AgentMemoryState,
    answer: &str,
    step_output: &str,
    done: bool,
) -> Vec<Message> {
    vec![
        Message::system(AGENT_SYSTEM_PROMPT),
        Message::user(format!(
            "Task: {}\n\n{}\n\nLatest action output:\n{}\n\nWorking answer:\n{}\n\n\
             The action reported done={}. Reflect: is the answer complete and grounded, \
             or should another iteration run? Return JSON: {{\"should_continue\": true, \
             \"summary\": \"one-line summary of this step\", \"plan_updates\": [..], \
             \"confidence\": 0.0, \"stop_reason\": \"completed|stuck\"}}",
            task.name,
            render_memory(memory),
            step_output,
            answer,
            done,
        )),
    ]
}

// ---------------------------------------------------------------------------
// Judge
// ---------------------------------------------------------------------------

/// Schema for the alignment call.
pub fn alignment_schema() -> JsonSchema {
    JsonSchema::new(
        "alignment",
        json!({
            "type": "object",
            "required": ["is_supported_by_evidence", "unsupported_claims", "notes"],
            "properties": {
                "is_supported_by_evidence": {"type": "boolean"},
                "unsupported_claims": {"type": "array", "items": {"type": "string"}},
                "notes": {"type": "string"}
            }
        }),
    )
}

/// Schema for the rubric call.
pub fn rubric_schema() -> JsonSchema {
    JsonSchema::new(
        "rubric",
        json!({
            "type": "object",
            "required": ["scores", "rationale", "confidence"],
            "properties": {
                "scores": {
                    "type": "object",
                    "required": ["completeness", "correctness", "groundedness", "actionability"],
                    "properties": {
                        "completeness": {"type": "number", "minimum": 0.0, "maximum": 10.0},
                        "correctness": {"type": "number", "minimum": 0.0, "maximum": 10.0},
                        "groundedness": {"type": "number", "minimum": 0.0, "maximum": 10.0},
                        "actionability": {"type": "number", "minimum": 0.0, "maximum": 10.0}
                    }
                },
                "rationale": {"type": "string"},
                "confidence": {"type": "number", "minimum": 0.0, "maximum": 1.0},
                "suggested_failure_class": {"type": "string"}
            }
        }),
    )
}

fn render_attempt(attempt: &TaskAttempt) -> String {
    let steps = attempt
        .steps
        .iter()
        .enumerate()
        .map(|(i, s)| format!("{}. {}", i + 1, s))
        .collect::<Vec<_>>()
        .join("\n");
    let citations = attempt
        .citations
        .iter()
        .map(|c| {
            format!(
                "- {} ({}): {}",
                c.source,
                c.snippet_hash.as_deref().unwrap_or("no hash"),
                c.excerpt
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "Answer:\n{}\n\nSteps:\n{}\n\nCitations:\n{}",
        attempt.answer,
        if steps.is_empty() { "(none)" } else { steps.as_str() },
        if citations.is_empty() {
            "(none)"
        } else {
            citations.as_str()
        },
    )
}

/// Messages for the alignment call.
pub fn build_alignment_messages(
    task: &Task,
    attempt: &TaskAttempt,
    evidence: &[ScoredChunk],
) -> Vec<Message> {
    let evidence = &evidence[..evidence.len().min(JUDGE_EVIDENCE_LIMIT)];
    vec![
        Message::system(
            "You verify whether a candidate answer is supported by documentation evidence. \
             Flag every claim that the evidence does not back. Respond with JSON only.",
        ),
        Message::user(format!(
            "Task: {}\n{}\n\nCandidate attempt:\n{}\n\nEvidence:\n{}\n\n\
             Return JSON: {{\"is_supported_by_evidence\": true, \
             \"unsupported_claims\": [..], \"notes\": \"..\"}}",
            task.name,
            task.description,
            render_attempt(attempt),
            render_chunks(evidence),
        )),
    ]
}

/// Messages for the rubric call.
pub fn build_rubric_messages(
    task: &Task,
    attempt: &TaskAttempt,
    alignment_supported: bool,
    unsupported_claims: &[String],
) -> Vec<Message> {
    vec![
        Message::system(
            "You grade how well an agent completed a documentation-driven task. Score each \
             criterion from 0 to 10: completeness (covers everything the task needs), \
             correctness (technically right), groundedness (backed by the cited docs), \
             actionability (a developer could follow it). Respond with JSON only.",
        ),
        Message::user(format!(
            "Task: {}\n{}\nExpected signals: {}\n\nAttempt:\n{}\n\n\
             Evidence alignment: supported={}; unsupported claims: {}\n\n\
             Return JSON: {{\"scores\": {{\"completeness\": 0, \"correctness\": 0, \
             \"groundedness\": 0, \"actionability\": 0}}, \"rationale\": \"..\", \
             \"confidence\": 0.0, \"suggested_failure_class\": \
             \"missing_content|outdated_content|incorrect_content|ambiguous_instructions|\
             missing_examples|broken_links|insufficient_detail|poor_structure\"}}",
            task.name,
            task.description,
            task.expected_signals.join(", "),
            render_attempt(attempt),
            alignment_supported,
            if unsupported_claims.is_empty() {
                "(none)".to_string()
            } else {
                unsupported_claims.join("; ")
            },
        )),
    ]
}

// ---------------------------------------------------------------------------
// Skill optimization
// ---------------------------------------------------------------------------

/// Required section headers of a generated skill document.
pub const SKILL_SECTIONS: [&str; 5] = [
    "# Purpose",
    "# Retrieval Strategy",
    "# Critical Workflows",
    "# Failure Prevention",
    "# Verification Checklist",
];

/// Schema for the skill-generation call.
pub fn skill_schema() -> JsonSchema {
    JsonSchema::new(
        "optimized_skill",
        json!({
            "type": "object",
            "required": ["optimized_skill_markdown", "optimization_notes"],
            "properties": {
                "optimized_skill_markdown": {"type": "string"},
                "optimization_notes": {"type": "array", "items": {"type": "string"}}
            }
        }),
    )
}

/// Messages for the skill-generation call.
pub fn build_skill_messages(
    docs_url: &str,
    site_skill: Option<&str>,
    failures: &[TaskEvaluation],
) -> Vec<Message> {
    let failure_digest = failures
        .iter()
        .map(|f| {
            format!(
                "- task {}: class={}, scores=[completeness {:.1}, correctness {:.1}, \
                 groundedness {:.1}, actionability {:.1}], rationale: {}",
                f.task_id,
                f.failure_class
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "unclassified".to_string()),
                f.criterion_scores.completeness,
                f.criterion_scores.correctness,
                f.criterion_scores.groundedness,
                f.criterion_scores.actionability,
                f.rationale,
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    vec![
        Message::system(
            "You write agent skill documents that teach coding agents how to use a \
             documentation site effectively. Respond with JSON only.",
        ),
        Message::user(format!(
            "Documentation site: {}\n\nExisting site skill:\n{}\n\n\
             Baseline failures to prevent:\n{}\n\n\
             Write a fully-formed markdown skill document with exactly these sections: \
             {}. Address every failure above. Return JSON: \
             {{\"optimized_skill_markdown\": \"..\", \"optimization_notes\": [..]}}",
            docs_url,
            site_skill.unwrap_or("(none)"),
            failure_digest,
            SKILL_SECTIONS.join(", "),
        )),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_task() -> Task {
        Task::new(
            "run-1",
            "Authenticate",
            "Authenticate against the API",
            "authentication",
            "medium",
            vec!["api key".to_string()],
        )
    }

    #[test]
    fn test_plan_messages_include_memory() {
        let task = sample_task();
        let mut memory = AgentMemoryState::new("exec-1", "Authenticate");
        memory.facts.push("keys live in the dashboard".to_string());
        let messages = build_plan_messages(&task, &memory, &[]);
        assert_eq!(messages.len(), 2);
        assert!(messages[1].content.contains("keys live in the dashboard"));
        assert!(messages[1].content.contains("Authenticate"));
    }

    #[test]
    fn test_act_schema_requires_citations() {
        let schema = act_schema();
        let missing = serde_json::json!({"answer": "a", "step_output": "b", "done": false});
        assert!(schema.validate(&missing).is_err());

        let complete = serde_json::json!({
            "answer": "a", "step_output": "b", "citations": [], "done": true
        });
        assert!(schema.validate(&complete).is_ok());
    }

    #[test]
    fn test_rubric_schema_bounds_scores() {
        let schema = rubric_schema();
        let out_of_range = serde_json::json!({
            "scores": {"completeness": 11.0, "correctness": 5.0, "groundedness": 5.0, "actionability": 5.0},
            "rationale": "r",
            "confidence": 0.5
        });
        assert!(schema.validate(&out_of_range).is_err());
    }

    #[test]
    fn test_evidence_truncated_to_limit() {
        let task = sample_task();
        let attempt = TaskAttempt::default();
        let evidence: Vec<ScoredChunk> = (0..20)
            .map(|i| ScoredChunk {
                source_url: format!("https://docs.example.com/p{}", i),
                snippet_hash: format!("{:016x}", i),
                text: format!("chunk {}", i),
                score: 1.0,
            })
            .collect();
        let messages = build_alignment_messages(&task, &attempt, &evidence);
        assert!(messages[1].content.contains("chunk 11"));
        assert!(!messages[1].content.contains("chunk 12"));
    }

    #[test]
    fn test_skill_messages_name_required_sections() {
        let messages = build_skill_messages("https://docs.example.com", None, &[]);
        for section in SKILL_SECTIONS {
            assert!(messages[1].content.contains(section));
        }
    }
}
