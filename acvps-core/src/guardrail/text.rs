//! Pulls the text guardrails should see out of a request or response body.

use serde_json::Value;

/// Top-level fields checked in order before falling back to chat shapes.
const TEXT_FIELDS: [&str; 8] = [
    "query", "input", "prompt", "answer", "output", "response", "text", "content",
];

/// The prompt or answer text of an LLM exchange body.
///
/// Looks at common top-level fields, then the last chat message, then the
/// first completion choice. Anything else is evaluated as raw text.
pub fn extract_text(body: &[u8]) -> String {
    if let Ok(value) = serde_json::from_slice::<Value>(body)
        && let Some(text) = from_json(&value)
    {
        return text.to_string();
    }
    String::from_utf8_lossy(body).into_owned()
}

fn from_json(value: &Value) -> Option<&str> {
    let map = value.as_object()?;

    for field in TEXT_FIELDS {
        if let Some(text) = map.get(field).and_then(Value::as_str) {
            return Some(text);
        }
    }

    if let Some(text) = map
        .get("messages")
        .and_then(Value::as_array)
        .and_then(|messages| messages.last())
        .and_then(|message| message.get("content"))
        .and_then(Value::as_str)
    {
        return Some(text);
    }

    let choice = map.get("choices")?.as_array()?.first()?;
    choice
        .get("message")
        .and_then(|m| m.get("content"))
        .or_else(|| choice.get("text"))
        .and_then(Value::as_str)
}
