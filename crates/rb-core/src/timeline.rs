use std::collections::HashMap;

use crate::filter::SensitiveFilter;
use crate::types::{Step, StepKind};

// ---------------------------------------------------------------------------
// Per-consumer dispatch tables
// ---------------------------------------------------------------------------

impl StepKind {
    /// Renderer label.
    pub fn label(&self) -> &'static str {
        match self {
            StepKind::Text => "text",
            StepKind::Init => "init",
            StepKind::System => "system",
            StepKind::ToolCall => "tool_call",
            StepKind::ToolResult => "tool_result",
            StepKind::Result => "result",
            StepKind::Error => "error",
        }
    }

    /// Whether steps of this kind link through `tool_use_id`.
    pub fn carries_correlation(&self) -> bool {
        matches!(self, StepKind::ToolCall | StepKind::ToolResult)
    }

    /// Whether the filter applies to this kind's text on read.
    pub fn is_filtered(&self) -> bool {
        match self {
            StepKind::Text
            | StepKind::Init
            | StepKind::System
            | StepKind::ToolCall
            | StepKind::ToolResult
            | StepKind::Result
            | StepKind::Error => true,
        }
    }
}

// ---------------------------------------------------------------------------
// Filtered reads
// ---------------------------------------------------------------------------

impl Step {
    pub fn filtered_content(&self, filter: &SensitiveFilter) -> Option<String> {
        let content = self.content.as_deref()?;
        Some(if self.kind.is_filtered() {
            filter.apply(content)
        } else {
            content.to_string()
        })
    }

    pub fn filtered_raw_response(&self, filter: &SensitiveFilter) -> String {
        if self.kind.is_filtered() {
            filter.apply(&self.raw_response)
        } else {
            self.raw_response.clone()
        }
    }

    /// Filtered content, falling back to the filtered raw response.
    pub fn display_text(&self, filter: &SensitiveFilter) -> String {
        self.filtered_content(filter)
            .unwrap_or_else(|| self.filtered_raw_response(filter))
    }
}

// ---------------------------------------------------------------------------
// Correlation
// ---------------------------------------------------------------------------

/// Pair each tool call with its result. A call whose process was interrupted
/// before the result arrived pairs with `None`.
pub fn pair_tool_calls(steps: &[Step]) -> Vec<(&Step, Option<&Step>)> {
    let mut results: HashMap<&str, &Step> = HashMap::new();
    for step in steps.iter().filter(|s| s.kind == StepKind::ToolResult) {
        if let Some(id) = step.tool_use_id.as_deref() {
            results.entry(id).or_insert(step);
        }
    }

    steps
        .iter()
        .filter(|s| s.kind == StepKind::ToolCall)
        .map(|call| {
            let result = call
                .tool_use_id
                .as_deref()
                .and_then(|id| results.get(id).copied());
            (call, result)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn call(run: Uuid, id: &str) -> Step {
        Step::new(run, StepKind::ToolCall, "{}", Some("name: Bash".into()))
            .with_tool_use_id(Some(id.to_string()))
    }

    fn result(run: Uuid, id: &str) -> Step {
        Step::new(run, StepKind::ToolResult, "{}", Some("out".into()))
            .with_tool_use_id(Some(id.to_string()))
    }

    #[test]
    fn pairs_calls_with_results() {
        let run = Uuid::new_v4();
        let steps = vec![call(run, "a"), call(run, "b"), result(run, "a")];
        let pairs = pair_tool_calls(&steps);
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].1.map(|s| s.content.as_deref()), Some(Some("out")));
        assert!(pairs[1].1.is_none());
    }

    #[test]
    fn correlation_table() {
        assert!(StepKind::ToolCall.carries_correlation());
        assert!(StepKind::ToolResult.carries_correlation());
        assert!(!StepKind::Text.carries_correlation());
        assert_eq!(StepKind::ToolResult.label(), "tool_result");
    }

    #[test]
    fn filtered_read_leaves_stored_value() {
        let run = Uuid::new_v4();
        let step = Step::new(run, StepKind::Text, "tok123", Some("using tok123".into()));
        let filter = SensitiveFilter::new(vec!["tok123".to_string()], "[FILTERED]");
        assert_eq!(step.filtered_content(&filter).as_deref(), Some("using [FILTERED]"));
        assert_eq!(step.filtered_raw_response(&filter), "[FILTERED]");
        assert_eq!(step.content.as_deref(), Some("using tok123"));
    }

    #[test]
    fn display_text_falls_back_to_raw() {
        let step = Step::new(Uuid::new_v4(), StepKind::Init, "{\"type\":\"system\"}", None);
        assert_eq!(step.display_text(&SensitiveFilter::none()), "{\"type\":\"system\"}");
    }
}
