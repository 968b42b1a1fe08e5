//! Per-item classification shared by the JSON processors.
//!
//! | `type`    | condition                 | kind       | content                          |
//! |-----------|---------------------------|------------|----------------------------------|
//! | system    | `subtype == "init"`       | Init       | none                             |
//! | system    | otherwise                 | System     | serialized item                  |
//! | assistant | has a `tool_use` entry    | ToolCall   | `name: {name}\ninputs: {json}`   |
//! | assistant | otherwise                 | Text       | first text entry, else item      |
//! | user      |                           | ToolResult | joined entry text                |
//! | result    |                           | Result     | `result` field, else item        |
//! | other     |                           | Text       | serialized item                  |

use rb_core::types::StepKind;
use serde_json::Value;

use crate::processor::StepPayload;

pub fn classify_item(item: &Value) -> StepPayload {
    let raw = item.to_string();
    match item.get("type").and_then(Value::as_str) {
        Some("system") => {
            if item.get("subtype").and_then(Value::as_str) == Some("init") {
                StepPayload::new(StepKind::Init, raw, None)
            } else {
                StepPayload::new(StepKind::System, raw.clone(), Some(raw))
            }
        }
        Some("assistant") => assistant(item, raw),
        Some("user") => user(item, raw),
        Some("result") => {
            let content = item
                .get("result")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| raw.clone());
            StepPayload::new(StepKind::Result, raw, Some(content))
        }
        _ => StepPayload::new(StepKind::Text, raw.clone(), Some(raw)),
    }
}

fn message_entries(item: &Value) -> &[Value] {
    item.get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn entry_type(entry: &Value) -> Option<&str> {
    entry.get("type").and_then(Value::as_str)
}

fn assistant(item: &Value, raw: String) -> StepPayload {
    let entries = message_entries(item);

    if let Some(tool) = entries.iter().find(|e| entry_type(e) == Some("tool_use")) {
        let name = tool.get("name").and_then(Value::as_str).unwrap_or_default();
        let inputs = tool
            .get("input")
            .map(Value::to_string)
            .unwrap_or_else(|| "{}".to_string());
        let mut payload = StepPayload::new(
            StepKind::ToolCall,
            raw,
            Some(format!("name: {name}\ninputs: {inputs}")),
        );
        payload.tool_use_id = tool.get("id").and_then(Value::as_str).map(str::to_string);
        return payload;
    }

    let text = entries
        .iter()
        .find(|e| entry_type(e) == Some("text"))
        .and_then(|e| e.get("text"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let content = text.unwrap_or_else(|| raw.clone());
    StepPayload::new(StepKind::Text, raw, Some(content))
}

fn user(item: &Value, raw: String) -> StepPayload {
    let message_content = item.get("message").and_then(|m| m.get("content"));

    // Plain string content carries no correlation id.
    if let Some(text) = message_content.and_then(Value::as_str) {
        return StepPayload::new(StepKind::ToolResult, raw, Some(text.to_string()));
    }

    let entries = message_entries(item);
    let tool_use_id = entries
        .first()
        .and_then(|e| e.get("tool_use_id"))
        .and_then(Value::as_str)
        .map(str::to_string);

    let content = entries
        .iter()
        .flat_map(entry_texts)
        .collect::<Vec<_>>()
        .join("\n");

    let mut payload = StepPayload::new(StepKind::ToolResult, raw, Some(content));
    payload.tool_use_id = tool_use_id;
    payload
}

/// Text carried by a tool-result entry: a string `content`, the `text`
/// fields of an array `content`, or the entry's own `text`.
fn entry_texts(entry: &Value) -> Vec<String> {
    match entry.get("content") {
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .map(str::to_string)
            .collect(),
        _ => entry
            .get("text")
            .and_then(Value::as_str)
            .map(|t| vec![t.to_string()])
            .unwrap_or_default(),
    }
}
