//! Task synthesis: templates, heading-derived tasks, and user-defined
//! tasks.
//!
//! User tasks come first, then the canonical documentation-workflow
//! templates, then tasks derived from markdown headings in the ingested
//! artifacts. The list is deduplicated by normalized name and truncated
//! to the run's task budget.

use regex::Regex;

use crate::config::RunConfig;
use crate::ingest::{Artifact, ArtifactType};
use crate::types::Task;

/// One canonical documentation workflow.
struct TaskTemplate {
    name: &'static str,
    description: &'static str,
    category: &'static str,
    difficulty: &'static str,
    expected_signals: &'static [&'static str],
}

/// Workflows every documentation site is expected to support.
const TEMPLATES: [TaskTemplate; 5] = [
    TaskTemplate {
        name: "Authenticate an API request",
        description: "Using only the documentation, show how a client obtains credentials \
                      and attaches them to a request.",
        category: "authentication",
        difficulty: "medium",
        expected_signals: &["api key", "authorization"],
    },
    TaskTemplate {
        name: "Install and run the quickstart",
        description: "Install the client library and reproduce the documented quickstart \
                      end to end.",
        category: "quickstart",
        difficulty: "easy",
        expected_signals: &["install", "quickstart"],
    },
    TaskTemplate {
        name: "Configure the client",
        description: "Enumerate the client configuration options the documentation describes \
                      and show a working configuration.",
        category: "configuration",
        difficulty: "medium",
        expected_signals: &["config", "option"],
    },
    TaskTemplate {
        name: "Make a first API call",
        description: "Construct the simplest documented API call and explain each required \
                      parameter.",
        category: "api_usage",
        difficulty: "easy",
        expected_signals: &["request", "response"],
    },
    TaskTemplate {
        name: "Handle error responses",
        description: "Describe the documented error model and implement retry-worthy error \
                      handling for it.",
        category: "error_handling",
        difficulty: "hard",
        expected_signals: &["error", "status code"],
    },
];

/// Maximum heading-derived tasks considered per artifact.
const HEADINGS_PER_ARTIFACT: usize = 4;

/// Synthesizes the run's task list.
pub fn synthesize_tasks(run_id: &str, config: &RunConfig, artifacts: &[Artifact]) -> Vec<Task> {
    let mut tasks: Vec<Task> = Vec::new();
    let mut seen: Vec<String> = Vec::new();

    let mut push = |tasks: &mut Vec<Task>, seen: &mut Vec<String>, task: Task| {
        let key = normalize_name(&task.name);
        if !key.is_empty() && !seen.contains(&key) {
            seen.push(key);
            tasks.push(task);
        }
    };

    // User-defined tasks take priority over synthesized ones.
    for user_task in &config.user_tasks {
        push(
            &mut tasks,
            &mut seen,
            Task::new(
                run_id,
                user_task.name.trim(),
                user_task.description.trim(),
                user_task.category.as_deref().unwrap_or("custom"),
                user_task.difficulty.as_deref().unwrap_or("medium"),
                user_task.expected_signals.clone(),
            ),
        );
    }

    for template in &TEMPLATES {
        push(
            &mut tasks,
            &mut seen,
            Task::new(
                run_id,
                template.name,
                template.description,
                template.category,
                template.difficulty,
                template
                    .expected_signals
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
            ),
        );
    }

    for task in heading_tasks(run_id, artifacts) {
        push(&mut tasks, &mut seen, task);
    }

    tasks.truncate(config.max_tasks);
    tasks
}

/// Derives tasks from H2/H3 markdown headings of page artifacts.
fn heading_tasks(run_id: &str, artifacts: &[Artifact]) -> Vec<Task> {
    let heading_pattern =
        Regex::new(r"(?m)^#{2,3}\s+(.+)$").expect("heading pattern is valid");
    let code_term = Regex::new(r"`([^`\n]{2,40})`").expect("code-term pattern is valid");

    let mut tasks = Vec::new();
    for artifact in artifacts {
        if artifact.artifact_type != ArtifactType::Page {
            continue;
        }

        let headings: Vec<(usize, String)> = heading_pattern
            .captures_iter(&artifact.content)
            .take(HEADINGS_PER_ARTIFACT)
            .filter_map(|caps| {
                let m = caps.get(1)?;
                let text = m.as_str().trim().trim_matches('#').trim();
                if text.len() < 4 {
                    None
                } else {
                    Some((m.end(), text.to_string()))
                }
            })
            .collect();

        for (offset, heading) in headings {
            // Section body: up to the next heading or 600 chars.
            let rest = &artifact.content[offset.min(artifact.content.len())..];
            let body_end = heading_pattern
                .find(rest)
                .map(|m| m.start())
                .unwrap_or(rest.len())
                .min(600);
            let body = rest[..floor_char_boundary(rest, body_end)].trim();

            let mut signals = vec![heading.to_lowercase()];
            for caps in code_term.captures_iter(body).take(2) {
                if let Some(term) = caps.get(1) {
                    signals.push(term.as_str().to_lowercase());
                }
            }

            let description = format!(
                "Following the '{}' section of {}, implement the documented workflow.",
                heading, artifact.source_url
            );
            tasks.push(Task::new(
                run_id,
                format!("Implement: {}", heading),
                description,
                "doc_workflow",
                "medium",
                signals,
            ));
        }
    }
    tasks
}

fn normalize_name(name: &str) -> String {
    name.to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn floor_char_boundary(text: &str, index: usize) -> usize {
    let mut index = index.min(text.len());
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UserTask;

    fn page(url: &str, content: &str) -> Artifact {
        Artifact::new(ArtifactType::Page, url, content)
    }

    #[test]
    fn test_templates_without_artifacts() {
        let config = RunConfig::default();
        let tasks = synthesize_tasks("run-1", &config, &[]);
        assert_eq!(tasks.len(), TEMPLATES.len());
        assert!(tasks.iter().any(|t| t.category == "authentication"));
        assert!(tasks.iter().all(|t| !t.expected_signals.is_empty()));
    }

    #[test]
    fn test_user_tasks_come_first() {
        let mut config = RunConfig::default();
        config.user_tasks = vec![UserTask {
            name: "Rotate a webhook secret".to_string(),
            description: "Rotate the webhook signing secret without downtime".to_string(),
            category: None,
            difficulty: Some("hard".to_string()),
            expected_signals: vec!["webhook".to_string(), "secret".to_string()],
        }];

        let tasks = synthesize_tasks("run-1", &config, &[]);
        assert_eq!(tasks[0].name, "Rotate a webhook secret");
        assert_eq!(tasks[0].category, "custom");
        assert_eq!(tasks[0].difficulty, "hard");
    }

    #[test]
    fn test_heading_derived_tasks() {
        let config = RunConfig::default();
        let artifact = page(
            "https://docs.example.com/webhooks",
            "# Webhooks\n\nintro\n\n## Verify signatures\n\nUse the `X-Signature` header \
             with your `signing_secret`.\n\n## Replay protection\n\nCheck timestamps.",
        );
        let tasks = synthesize_tasks("run-1", &config, &[artifact]);

        let verify = tasks
            .iter()
            .find(|t| t.name == "Implement: Verify signatures")
            .expect("heading task present");
        assert_eq!(verify.category, "doc_workflow");
        assert!(verify.expected_signals.contains(&"verify signatures".to_string()));
        assert!(verify.expected_signals.contains(&"x-signature".to_string()));
    }

    #[test]
    fn test_deduplicates_by_normalized_name() {
        let mut config = RunConfig::default();
        config.user_tasks = vec![UserTask {
            name: "  Authenticate an   API request ".to_string(),
            description: "user version".to_string(),
            category: None,
            difficulty: None,
            expected_signals: Vec::new(),
        }];

        let tasks = synthesize_tasks("run-1", &config, &[]);
        let auth_count = tasks
            .iter()
            .filter(|t| normalize_name(&t.name) == "authenticate an api request")
            .count();
        assert_eq!(auth_count, 1);
        // The user's version won
        assert_eq!(tasks[0].description, "user version");
    }

    #[test]
    fn test_truncated_to_max_tasks() {
        let mut config = RunConfig::default();
        config.max_tasks = 3;
        let artifact = page(
            "https://docs.example.com/guide",
            "## One\n\nbody\n\n## Two\n\nbody\n\n## Three\n\nbody",
        );
        let tasks = synthesize_tasks("run-1", &config, &[artifact]);
        assert_eq!(tasks.len(), 3);
    }

    #[test]
    fn test_skill_artifacts_not_mined_for_headings() {
        let config = RunConfig::default();
        let skill = Artifact::new(
            ArtifactType::Skill,
            "https://docs.example.com/skill.md",
            "## Purpose\n\nagent guidance",
        );
        let tasks = synthesize_tasks("run-1", &config, &[skill]);
        assert!(tasks.iter().all(|t| t.category != "doc_workflow"));
    }
}
