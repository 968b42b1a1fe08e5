use std::sync::LazyLock;

use rb_core::types::{LogProcessorKind, Step, StepKind};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::classify::classify_item;

/// One step's worth of output, before it is attached to a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepPayload {
    pub kind: StepKind,
    pub raw_response: String,
    pub content: Option<String>,
    pub tool_use_id: Option<String>,
}

impl StepPayload {
    pub fn new(kind: StepKind, raw_response: impl Into<String>, content: Option<String>) -> Self {
        Self {
            kind,
            raw_response: raw_response.into(),
            content,
            tool_use_id: None,
        }
    }

    pub fn into_step(self, run_id: Uuid) -> Step {
        Step::new(run_id, self.kind, self.raw_response, self.content)
            .with_tool_use_id(self.tool_use_id)
    }
}

// ---------------------------------------------------------------------------
// Processor
// ---------------------------------------------------------------------------

/// Lazy, finite stream of payloads borrowed from the raw text.
pub type Payloads<'a> = Box<dyn Iterator<Item = StepPayload> + 'a>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogProcessor {
    kind: LogProcessorKind,
}

impl LogProcessor {
    pub fn new(kind: LogProcessorKind) -> Self {
        Self { kind }
    }

    pub fn kind(&self) -> LogProcessorKind {
        self.kind
    }

    pub fn process<'a>(&self, raw: &'a str) -> Payloads<'a> {
        match self.kind {
            LogProcessorKind::Text => Box::new(std::iter::once(text_payload(raw))),
            LogProcessorKind::ClaudeJson => claude_json(raw),
            LogProcessorKind::ClaudeStreamingJson => claude_streaming_json(raw),
            LogProcessorKind::Auto => {
                if looks_like_json(raw) {
                    claude_json(raw)
                } else {
                    Box::new(std::iter::once(text_payload(raw)))
                }
            }
        }
    }
}

pub fn process(kind: LogProcessorKind, raw: &str) -> Payloads<'_> {
    LogProcessor::new(kind).process(raw)
}

// ---------------------------------------------------------------------------
// Text
// ---------------------------------------------------------------------------

static FAILURE_WORD: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)\b(error|exception|failed|failure)\b").ok());

/// Whether plain text reads as a failure report. Covers `api error` and
/// status-code lines such as `500 request failed`.
pub fn is_failure_text(text: &str) -> bool {
    FAILURE_WORD
        .as_ref()
        .is_some_and(|re| re.is_match(text))
}

fn text_payload(raw: &str) -> StepPayload {
    let kind = if is_failure_text(raw) {
        StepKind::Error
    } else {
        StepKind::Text
    };
    StepPayload::new(kind, raw, Some(raw.to_string()))
}

// ---------------------------------------------------------------------------
// JSON
// ---------------------------------------------------------------------------

fn looks_like_json(raw: &str) -> bool {
    let trimmed = raw.trim();
    (trimmed.starts_with('{') && trimmed.ends_with('}'))
        || (trimmed.starts_with('[') && trimmed.ends_with(']'))
}

fn parse_error(raw: &str) -> StepPayload {
    StepPayload::new(StepKind::Error, raw, Some(raw.to_string()))
}

fn claude_json(raw: &str) -> Payloads<'_> {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(serde_json::Value::Array(items)) => {
            Box::new(items.into_iter().map(|item| classify_item(&item)))
        }
        Ok(item) => Box::new(std::iter::once(classify_item(&item))),
        Err(err) => {
            tracing::debug!(error = %err, "agent output is not valid JSON");
            Box::new(std::iter::once(parse_error(raw)))
        }
    }
}

fn claude_streaming_json(raw: &str) -> Payloads<'_> {
    Box::new(
        raw.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| match serde_json::from_str::<serde_json::Value>(line) {
                Ok(item) => classify_item(&item),
                Err(_) => parse_error(line),
            }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_pattern_compiles() {
        assert!(FAILURE_WORD.is_some());
        assert!(is_failure_text("Build FAILED"));
        assert!(!is_failure_text("errors-free"));
    }

    #[test]
    fn auto_detects_bracketed_json() {
        let raw = "  [{\"type\":\"result\",\"result\":\"ok\"}]\n";
        let out: Vec<_> = process(LogProcessorKind::Auto, raw).collect();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, StepKind::Result);

        let out: Vec<_> = process(LogProcessorKind::Auto, "{ not really").collect();
        assert_eq!(out[0].kind, StepKind::Text);
    }

    #[test]
    fn failure_words_are_whole_words() {
        assert!(is_failure_text("HTTP 503: request FAILED"));
        assert!(is_failure_text("API Error: overloaded"));
        assert!(!is_failure_text("200 OK"));
        assert!(!is_failure_text("errors are counted by the errorless logger"));
    }

    #[test]
    fn streaming_is_lazy() {
        let raw = "{\"type\":\"result\",\"result\":\"a\"}\nnot json\n";
        let mut it = process(LogProcessorKind::ClaudeStreamingJson, raw);
        assert_eq!(it.next().map(|p| p.kind), Some(StepKind::Result));
        assert_eq!(it.next().map(|p| p.kind), Some(StepKind::Error));
        assert!(it.next().is_none());
    }
}
