//! Extracts a fenced ` ```actions ` JSON block from generated text.

use serde::{Deserialize, Serialize};
use serde_json::Value;

const OPEN_FENCE: &str = "```actions";
const CLOSE_FENCE: &str = "```";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: serde_json::Map<String, Value>,
}

/// Splits `text` into a trimmed message and an optional list of
/// actions. Absent or unterminated fences leave the whole text as the
/// message. Malformed array elements are silently skipped; an array
/// that ends up empty after filtering is reported as `None`.
pub fn parse_actions(text: &str) -> (String, Option<Vec<Action>>) {
    let Some(open_at) = text.find(OPEN_FENCE) else {
        return (text.trim().to_string(), None);
    };
    let body_start = open_at + OPEN_FENCE.len();
    let Some(close_offset) = text[body_start..].find(CLOSE_FENCE) else {
        return (text.trim().to_string(), None);
    };
    let close_at = body_start + close_offset;

    let before = &text[..open_at];
    let after = &text[close_at + CLOSE_FENCE.len()..];
    let body = text[body_start..close_at].trim();

    let message = format!("{before}{after}").trim().to_string();

    let actions = match serde_json::from_str::<Value>(body) {
        Ok(Value::Array(items)) => {
            let cleaned: Vec<Action> = items
                .into_iter()
                .filter_map(|item| {
                    let obj = item.as_object()?;
                    let kind = obj.get("type")?.as_str()?.to_string();
                    let payload = obj.get("payload")?.as_object()?.clone();
                    Some(Action { kind, payload })
                })
                .collect();
            if cleaned.is_empty() {
                None
            } else {
                Some(cleaned)
            }
        }
        _ => None,
    };

    (message, actions)
}

/// Inverse of `parse_actions`, used by the round-trip property test:
/// renders a message with an embedded actions fence the parser can
/// recover losslessly.
pub fn compose(message: &str, actions: Option<&[Action]>) -> String {
    match actions {
        None | Some([]) => message.to_string(),
        Some(actions) => {
            let body = serde_json::to_string(actions).expect("actions always serialize");
            format!("{message}\n{OPEN_FENCE}\n{body}\n{CLOSE_FENCE}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn action(kind: &str, payload: Value) -> Action {
        Action {
            kind: kind.to_string(),
            payload: payload.as_object().unwrap().clone(),
        }
    }

    #[test]
    fn no_fence_returns_whole_text() {
        let (message, actions) = parse_actions("just plain text");
        assert_eq!(message, "just plain text");
        assert_eq!(actions, None);
    }

    #[test]
    fn unterminated_fence_returns_whole_text() {
        let text = "Hi!\n```actions\n[{}]";
        let (message, actions) = parse_actions(text);
        assert_eq!(message, text.trim());
        assert_eq!(actions, None);
    }

    #[test]
    fn extracts_actions_and_trims_surrounding_text() {
        let text = "Hi!\n```actions\n[{\"type\":\"open\",\"payload\":{\"path\":\".\"}}]\n```\nBye.";
        let (message, actions) = parse_actions(text);
        assert_eq!(message, "Hi!\n\nBye.");
        assert_eq!(
            actions,
            Some(vec![action("open", json!({"path": "."}))])
        );
    }

    #[test]
    fn malformed_elements_are_skipped() {
        let text = "```actions\n[{\"type\":\"open\",\"payload\":{\"path\":\".\"}}, \"not-an-object\", {\"type\":42}]\n```";
        let (_message, actions) = parse_actions(text);
        assert_eq!(actions, Some(vec![action("open", json!({"path": "."}))]));
    }

    #[test]
    fn all_malformed_yields_none() {
        let text = "```actions\n[\"nope\"]\n```";
        let (_message, actions) = parse_actions(text);
        assert_eq!(actions, None);
    }

    #[test]
    fn compose_then_parse_round_trips() {
        let actions = vec![action("open", json!({"path": "."}))];
        let composed = compose("hello there", Some(&actions));
        let (message, parsed) = parse_actions(&composed);
        assert_eq!(message, "hello there");
        assert_eq!(parsed, Some(actions));
    }
}
