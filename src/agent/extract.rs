//! Turning the terminal message of a run into caller output

use crate::agent::message::{ChatMessage, MessageContent};
use serde::de::DeserializeOwned;

/// Text of the last message, trimmed. Empty when there is none.
pub fn extract_final_text(messages: &[ChatMessage]) -> String {
    let Some(last) = messages.last() else {
        return String::new();
    };

    match &last.content {
        MessageContent::Text(text) => text.trim().to_string(),
        MessageContent::Parts(parts) => parts
            .iter()
            .filter_map(|part| part.text())
            .collect::<Vec<_>>()
            .join(" ")
            .trim()
            .to_string(),
        MessageContent::ToolCalls { text, .. } => {
            text.as_deref().map(str::trim).unwrap_or_default().to_string()
        }
        MessageContent::ToolResult { .. } => String::new(),
    }
}

/// Remove a surrounding markdown code fence, with or without a language tag.
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the language tag line
    let body = match rest.find('\n') {
        Some(pos) => &rest[pos + 1..],
        None => rest,
    };
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

/// Outermost `[...]` or `{...}` span, whichever opens first.
fn json_span(text: &str) -> Option<&str> {
    let start = text.find(['[', '{'])?;
    let close = if text[start..].starts_with('[') { ']' } else { '}' };
    let end = text.rfind(close)?;
    (end > start).then(|| &text[start..=end])
}

/// Parse structured model output, tolerating fences and surrounding prose.
pub fn extract_json<T: DeserializeOwned>(text: &str) -> Option<T> {
    let cleaned = strip_code_fences(text);
    if let Ok(value) = serde_json::from_str(cleaned) {
        return Some(value);
    }
    serde_json::from_str(json_span(cleaned)?).ok()
}
