use uuid::Uuid;

/// Generate an OpenTelemetry-compatible trace ID (32 hex characters).
pub fn generate_trace_id() -> String {
    Uuid::new_v4().as_simple().to_string()
}

/// Generate a span ID (16 hex characters).
pub fn generate_span_id() -> String {
    Uuid::new_v4().as_simple().to_string()[..16].to_string()
}

/// Create a named span for a top-level operation (one CLI command, one
/// rebuild), returning the span and its trace ID for correlation.
pub fn create_operation_span(operation: &str) -> (tracing::Span, String) {
    let trace_id = generate_trace_id();
    let span = create_child_span(&trace_id, operation);
    (span, trace_id)
}

/// Create a span under an existing trace ID.
pub fn create_child_span(trace_id: &str, operation: &str) -> tracing::Span {
    let span_id = generate_span_id();
    tracing::info_span!(
        "operation",
        trace_id = %trace_id,
        span_id = %span_id,
        operation = %operation,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_id_format() {
        let id = generate_trace_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn span_id_format() {
        let id = generate_span_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn operation_spans_get_fresh_traces() {
        let (span, a) = create_operation_span("run");
        let (_, b) = create_operation_span("run");
        assert_ne!(a, b);
        let _guard = span.enter();
    }

    #[test]
    fn child_span_enters() {
        let trace_id = generate_trace_id();
        let span = create_child_span(&trace_id, "rebuild");
        let _guard = span.enter();
    }
}
