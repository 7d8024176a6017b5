//! JSON extraction from model responses.
//!
//! Models asked for JSON frequently wrap it in markdown fences or precede
//! it with prose. Extraction strategies, in order: a ```json fenced block,
//! a generic fenced block, then the first balanced `{…}` or `[…]` found in
//! the raw text. Brace matching is string- and escape-aware so braces
//! inside string literals do not confuse the scan.

use regex::Regex;

/// Extracts the first JSON candidate from a model response.
///
/// Returns `None` when no balanced object or array can be found. The
/// returned string is not guaranteed to parse; callers validate with
/// `serde_json` and the target schema.
pub fn extract_json_candidate(content: &str) -> Option<String> {
    let trimmed = content.trim();

    if let Some(block) = fenced_block(trimmed) {
        if let Some(candidate) = first_balanced(&block) {
            return Some(candidate);
        }
    }

    first_balanced(trimmed)
}

/// Pulls the body out of the first fenced code block, if any.
fn fenced_block(content: &str) -> Option<String> {
    // The (?s) flag lets '.' span lines inside the fence.
    let fence = Regex::new(r"(?s)```(?:json)?\s*\n?(.*?)```").ok()?;
    fence
        .captures(content)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
}

/// Finds the first balanced JSON object or array in `content`.
fn first_balanced(content: &str) -> Option<String> {
    let start = content.find(['{', '['])?;
    let rest = &content[start..];
    let open = rest.chars().next()?;
    let close = if open == '{' { '}' } else { ']' };

    let mut depth: usize = 0;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, c) in rest.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match c {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            c if c == open && !in_string => depth += 1,
            c if c == close && !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(rest[..=i].to_string());
                }
            }
            _ => {}
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_object() {
        let input = r#"{"key": "value"}"#;
        assert_eq!(extract_json_candidate(input).as_deref(), Some(input));
    }

    #[test]
    fn test_direct_array() {
        let input = r#"[1, 2, 3]"#;
        assert_eq!(extract_json_candidate(input).as_deref(), Some(input));
    }

    #[test]
    fn test_fenced_json_block() {
        let input = "Here you go:\n```json\n{\"done\": true}\n```\nHope that helps.";
        assert_eq!(
            extract_json_candidate(input).as_deref(),
            Some(r#"{"done": true}"#)
        );
    }

    #[test]
    fn test_generic_fence() {
        let input = "```\n{\"a\": 1}\n```";
        assert_eq!(extract_json_candidate(input).as_deref(), Some(r#"{"a": 1}"#));
    }

    #[test]
    fn test_leading_prose() {
        let input = r#"Sure, the plan is: {"plan_items": ["step one"], "rationale": "x"} done."#;
        let candidate = extract_json_candidate(input).unwrap();
        assert!(candidate.starts_with('{'));
        assert!(candidate.ends_with('}'));
        assert!(serde_json::from_str::<serde_json::Value>(&candidate).is_ok());
    }

    #[test]
    fn test_braces_inside_strings() {
        let input = r#"{"text": "a { brace } in a string"}"#;
        assert_eq!(extract_json_candidate(input).as_deref(), Some(input));
    }

    #[test]
    fn test_escaped_quotes() {
        let input = r#"{"quote": "he said \"hi\""}"#;
        assert_eq!(extract_json_candidate(input).as_deref(), Some(input));
    }

    #[test]
    fn test_nested_structures() {
        let input = r#"{"outer": {"inner": [1, {"deep": true}]}}"#;
        assert_eq!(extract_json_candidate(input).as_deref(), Some(input));
    }

    #[test]
    fn test_no_json() {
        assert_eq!(extract_json_candidate("plain prose, nothing else"), None);
        assert_eq!(extract_json_candidate(""), None);
    }

    #[test]
    fn test_unbalanced_returns_none() {
        assert_eq!(extract_json_candidate(r#"{"key": "value""#), None);
    }
}
