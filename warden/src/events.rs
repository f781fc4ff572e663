//! Worker event stream model.
//!
//! The worker emits one self-contained JSON object per stdout line with a
//! `kind` discriminator. Decoding is schema-tolerant: unknown fields are
//! ignored, missing payload fields default, and unrecognized kinds map to
//! [`WorkerEvent::Unknown`] instead of failing. Lines that are not JSON
//! objects at all are not events — the formatter passes them through
//! unchanged rather than dropping them.

use serde::Deserialize;

/// Maximum characters of tool input/result shown on one formatted line.
const DISPLAY_TRUNCATE_CHARS: usize = 300;

pub const SESSION_START_MARKER: &str = "=== session started ===";

/// Final result metadata carried by the terminal `completion` event.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Completion {
    #[serde(default)]
    pub response: String,
    #[serde(default)]
    pub turns: i64,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default)]
    pub duration_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerEvent {
    Init,
    AgentText {
        #[serde(default)]
        text: String,
    },
    ToolCall {
        #[serde(default)]
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    ToolResult {
        #[serde(default)]
        content: String,
    },
    Completion(Completion),
    /// Recognized event framing, unhandled kind. Suppressed when formatted.
    Unknown,
}

/// Parse one worker output line into an event.
///
/// Returns `None` when the line is not a discriminated JSON object —
/// callers must treat that as opaque passthrough data, never as an error.
pub fn parse_event(line: &str) -> Option<WorkerEvent> {
    let value: serde_json::Value = serde_json::from_str(line.trim()).ok()?;
    value.get("kind")?.as_str()?;
    Some(serde_json::from_value(value).unwrap_or(WorkerEvent::Unknown))
}

/// Render an event as a displayable line. Empty string means suppressed.
pub fn format_event(event: &WorkerEvent) -> String {
    match event {
        WorkerEvent::Init => SESSION_START_MARKER.to_string(),
        WorkerEvent::AgentText { text } => text.clone(),
        WorkerEvent::ToolCall { name, input } => {
            let rendered = match input {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            format!("[tool] {name}: {}", truncate_chars(&rendered))
        }
        WorkerEvent::ToolResult { content } => {
            format!("[result] {}", truncate_chars(content))
        }
        WorkerEvent::Completion(c) => format!(
            "=== done: {} turns, ${:.4}, {}s ===",
            c.turns,
            c.cost_usd,
            c.duration_ms / 1000
        ),
        WorkerEvent::Unknown => String::new(),
    }
}

/// Format one raw worker line: parseable events render per kind, anything
/// else passes through verbatim.
pub fn format_line(line: &str) -> String {
    match parse_event(line) {
        Some(event) => format_event(&event),
        None => line.to_string(),
    }
}

fn truncate_chars(s: &str) -> String {
    if s.chars().count() <= DISPLAY_TRUNCATE_CHARS {
        return s.to_string();
    }
    let mut out: String = s.chars().take(DISPLAY_TRUNCATE_CHARS).collect();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn malformed_lines_pass_through_unchanged() {
        for line in [
            "plain text output",
            "{not json",
            "",
            "[1, 2, 3]",
            r#"{"no_kind": true}"#,
            r#"{"kind": 42}"#,
        ] {
            assert_eq!(format_line(line), line, "line: {line:?}");
        }
    }

    #[test]
    fn unknown_kinds_are_suppressed() {
        for line in [
            r#"{"kind": "heartbeat"}"#,
            r#"{"kind": "debug", "payload": {"x": 1}}"#,
            r#"{"kind": ""}"#,
        ] {
            assert_eq!(parse_event(line), Some(WorkerEvent::Unknown));
            assert_eq!(format_line(line), "");
        }
    }

    #[test]
    fn init_formats_to_start_marker() {
        assert_eq!(format_line(r#"{"kind": "init"}"#), SESSION_START_MARKER);
    }

    #[test]
    fn agent_text_is_verbatim() {
        let line = r#"{"kind": "agent_text", "text": "checking service health"}"#;
        assert_eq!(format_line(line), "checking service health");
    }

    #[test]
    fn tool_call_renders_name_and_input() {
        let line = r#"{"kind": "tool_call", "name": "Bash", "input": "systemctl status api"}"#;
        assert_eq!(format_line(line), "[tool] Bash: systemctl status api");

        let line = json!({"kind": "tool_call", "name": "Read", "input": {"path": "/etc/hosts"}})
            .to_string();
        assert_eq!(format_line(&line), r#"[tool] Read: {"path":"/etc/hosts"}"#);
    }

    #[test]
    fn long_tool_result_truncates_to_exactly_300_plus_ellipsis() {
        let content = "x".repeat(450);
        let line = json!({"kind": "tool_result", "content": content}).to_string();
        let formatted = format_line(&line);
        let body = formatted.strip_prefix("[result] ").unwrap();
        assert_eq!(body.chars().count(), 303);
        assert!(body.ends_with("..."));
        assert_eq!(&body[..300], "x".repeat(300));
    }

    #[test]
    fn result_at_limit_is_not_truncated() {
        let content = "y".repeat(300);
        let line = json!({"kind": "tool_result", "content": content}).to_string();
        assert_eq!(format_line(&line), format!("[result] {content}"));
    }

    #[test]
    fn completion_formats_summary_and_carries_metadata() {
        let line = r#"{"kind": "completion", "response": "all healthy", "turns": 5, "cost_usd": 0.01, "duration_ms": 30000}"#;
        let event = parse_event(line).unwrap();
        assert_eq!(format_event(&event), "=== done: 5 turns, $0.0100, 30s ===");
        match event {
            WorkerEvent::Completion(c) => {
                assert_eq!(c.response, "all healthy");
                assert_eq!(c.turns, 5);
                assert_eq!(c.cost_usd, 0.01);
                assert_eq!(c.duration_ms, 30000);
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn completion_tolerates_missing_fields() {
        let event = parse_event(r#"{"kind": "completion"}"#).unwrap();
        assert_eq!(
            event,
            WorkerEvent::Completion(Completion {
                response: String::new(),
                turns: 0,
                cost_usd: 0.0,
                duration_ms: 0,
            })
        );
    }

    #[test]
    fn extra_fields_are_ignored() {
        let line = r#"{"kind": "agent_text", "text": "hi", "session": 9, "ts": "2026-01-01"}"#;
        assert_eq!(format_line(line), "hi");
    }
}
