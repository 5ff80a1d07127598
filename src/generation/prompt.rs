//! Deterministic prompt assembly.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: String,
    pub content: String,
}

fn title_case(role: &str) -> String {
    let mut chars = role.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// Builds the same prompt string for the same inputs, every time:
/// `System: …` (if present), each history turn as `Role: content`
/// (empty content skipped), `User: {prompt}`, then a trailing
/// `Assistant:` line.
pub fn build_prompt(prompt: &str, system_prompt: Option<&str>, history: &[HistoryEntry]) -> String {
    let mut lines = Vec::new();

    if let Some(system) = system_prompt {
        lines.push(format!("System: {system}"));
    }

    for entry in history {
        if entry.content.is_empty() {
            continue;
        }
        lines.push(format!("{}: {}", title_case(&entry.role), entry.content));
    }

    lines.push(format!("User: {prompt}"));
    lines.push("Assistant:".to_string());

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_for_same_inputs() {
        let history = vec![HistoryEntry {
            role: "user".into(),
            content: "earlier message".into(),
        }];
        let a = build_prompt("hi", Some("be terse"), &history);
        let b = build_prompt("hi", Some("be terse"), &history);
        assert_eq!(a, b);
    }

    #[test]
    fn trailing_line_is_always_assistant() {
        let prompt = build_prompt("hi", None, &[]);
        assert_eq!(prompt.lines().last(), Some("Assistant:"));
    }

    #[test]
    fn empty_history_content_is_skipped() {
        let history = vec![HistoryEntry {
            role: "assistant".into(),
            content: String::new(),
        }];
        let prompt = build_prompt("hi", None, &history);
        assert!(!prompt.contains("Assistant: "));
        assert_eq!(prompt, "User: hi\nAssistant:");
    }

    #[test]
    fn roles_are_title_cased() {
        let history = vec![HistoryEntry {
            role: "user".into(),
            content: "hello".into(),
        }];
        let prompt = build_prompt("hi", None, &history);
        assert!(prompt.contains("User: hello"));
    }
}
