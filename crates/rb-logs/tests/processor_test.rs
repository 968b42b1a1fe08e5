use rb_core::types::{LogProcessorKind, StepKind};
use rb_logs::{decode_container_output, process, StepPayload};
use uuid::Uuid;

fn run(kind: LogProcessorKind, raw: &str) -> Vec<StepPayload> {
    process(kind, raw).collect()
}

#[test]
fn text_failure_keywords_classify_as_error() {
    for input in [
        "Error: something broke",
        "an EXCEPTION was thrown",
        "build failed",
        "FAILURE in step 3",
        "API Error: 500 internal",
    ] {
        let out = run(LogProcessorKind::Text, input);
        assert_eq!(out.len(), 1, "{input}");
        assert_eq!(out[0].kind, StepKind::Error, "{input}");
    }
}

#[test]
fn text_without_keywords_is_text() {
    for input in ["all good", "", "terrorism is not a keyword match", "failures counted: 0"] {
        let out = run(LogProcessorKind::Text, input);
        assert_eq!(out.len(), 1, "{input}");
        assert_eq!(out[0].kind, StepKind::Text, "{input}");
        assert_eq!(out[0].content.as_deref(), Some(input));
    }
}

#[test]
fn claude_json_array_keeps_order() {
    let raw = r#"[
        {"type":"system","subtype":"init"},
        {"type":"assistant","message":{"content":[{"type":"text","text":"hi"}]}},
        {"type":"result","result":"done"}
    ]"#;
    let out = run(LogProcessorKind::ClaudeJson, raw);
    let kinds: Vec<_> = out.iter().map(|p| p.kind).collect();
    assert_eq!(kinds, vec![StepKind::Init, StepKind::Text, StepKind::Result]);
    assert_eq!(out[2].content.as_deref(), Some("done"));
}

#[test]
fn claude_json_single_object_is_one_step() {
    let out = run(LogProcessorKind::ClaudeJson, r#"{"type":"result","result":"ok"}"#);
    assert_eq!(out.len(), 1);
}

#[test]
fn claude_json_invalid_is_single_error_with_raw_text() {
    let raw = "{\"type\": broken";
    let out = run(LogProcessorKind::ClaudeJson, raw);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].kind, StepKind::Error);
    assert_eq!(out[0].content.as_deref(), Some(raw));
}

#[test]
fn streaming_skips_blank_lines_and_isolates_bad_ones() {
    let raw = concat!(
        "{\"type\":\"system\",\"subtype\":\"init\"}\n",
        "\n",
        "   \n",
        "this is not json\n",
        "{\"type\":\"result\",\"result\":\"fin\"}\n",
    );
    let out = run(LogProcessorKind::ClaudeStreamingJson, raw);
    assert_eq!(out.len(), 3);
    assert_eq!(out[0].kind, StepKind::Init);
    assert_eq!(out[1].kind, StepKind::Error);
    assert_eq!(out[1].content.as_deref(), Some("this is not json"));
    assert_eq!(out[2].kind, StepKind::Result);
    assert_eq!(out[2].content.as_deref(), Some("fin"));
}

#[test]
fn tool_use_becomes_tool_call_with_exact_content() {
    let raw = r#"{"type":"assistant","message":{"content":[{"type":"tool_use","id":"toolu_01","name":"Bash","input":{"command":"ls"}}]}}"#;
    let out = run(LogProcessorKind::ClaudeStreamingJson, raw);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].kind, StepKind::ToolCall);
    assert_eq!(
        out[0].content.as_deref(),
        Some("name: Bash\ninputs: {\"command\":\"ls\"}")
    );
    assert_eq!(out[0].tool_use_id.as_deref(), Some("toolu_01"));
}

#[test]
fn tool_result_carries_correlation_id() {
    let raw = r#"{"type":"user","message":{"content":[{"tool_use_id":"X","content":"out"}]}}"#;
    let out = run(LogProcessorKind::ClaudeJson, raw);
    assert_eq!(out[0].kind, StepKind::ToolResult);
    assert_eq!(out[0].tool_use_id.as_deref(), Some("X"));
    assert_eq!(out[0].content.as_deref(), Some("out"));
}

#[test]
fn non_init_system_serializes_item() {
    let out = run(
        LogProcessorKind::ClaudeJson,
        r#"{"type":"system","subtype":"compact"}"#,
    );
    assert_eq!(out[0].kind, StepKind::System);
    assert_eq!(
        out[0].content.as_deref(),
        Some(r#"{"type":"system","subtype":"compact"}"#)
    );
}

#[test]
fn demultiplexes_stdout_and_stderr_in_order() {
    let mut bytes = vec![1, 0, 0, 0, 0, 0, 0, 5];
    bytes.extend_from_slice(b"hello");
    bytes.extend_from_slice(&[2, 0, 0, 0, 0, 0, 0, 3]);
    bytes.extend_from_slice(b"err");
    assert_eq!(decode_container_output(&bytes), "helloerr");
}

#[test]
fn overlong_trailing_frame_is_dropped() {
    let mut bytes = vec![1, 0, 0, 0, 0, 0, 0, 2];
    bytes.extend_from_slice(b"ok");
    bytes.extend_from_slice(&[1, 0, 0, 0, 0, 0, 0, 50]);
    bytes.extend_from_slice(b"short");
    assert_eq!(decode_container_output(&bytes), "ok");
}

#[test]
fn payload_becomes_step_for_run() {
    let run_id = Uuid::new_v4();
    let raw = r#"{"type":"user","message":{"content":[{"tool_use_id":"X","content":"out"}]}}"#;
    let step = run(LogProcessorKind::Auto, raw)
        .remove(0)
        .into_step(run_id);
    assert_eq!(step.run_id, run_id);
    assert_eq!(step.tool_use_id.as_deref(), Some("X"));
}
