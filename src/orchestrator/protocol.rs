//! JSON frame codec and inbound routing (§4.8, §6).
//!
//! Every frame carries exactly one `type` discriminator, matching the
//! reference codebase's `serde(tag = "type")` convention for its own wire
//! types (`NativeToolCall`, `MessageChunk`). Unknown `type` values and extra
//! unknown fields are ignored by `serde_json`'s default behavior; nothing
//! special is needed to satisfy that part of §6.

use super::task::TaskStatus;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum InboundFrame {
    CreateTask {
        request_id: String,
        task_kind: String,
        #[serde(default)]
        client_id: Option<String>,
        prompt: String,
        #[serde(default)]
        context: Option<Value>,
        #[serde(default)]
        allowed_tools: Option<Vec<String>>,
    },
    CommandResult {
        task_id: String,
        call_id: String,
        ok: bool,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        error: Option<String>,
    },
    CancelTask {
        task_id: String,
    },
    Ping,
    UserAnswer {
        task_id: String,
        call_id: String,
        answer: String,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum OutboundFrame {
    TaskCreated {
        request_id: String,
        task_id: String,
        status: TaskStatus,
    },
    TaskUpdate {
        task_id: String,
        status: TaskStatus,
    },
    StatusUpdate {
        task_id: String,
        message: String,
    },
    CommandCall {
        task_id: String,
        call_id: String,
        command: String,
        args: Value,
    },
    UserQuestion {
        task_id: String,
        call_id: String,
        question: String,
    },
    TaskCompleted {
        task_id: String,
        result: Value,
    },
    /// `task_id` is set for a task that existed; `request_id` is set instead
    /// when the failure happens before a task could be created (unknown
    /// `task_kind` at `create-task` time, per §3's Task Kind Profile note).
    TaskFailed {
        #[serde(skip_serializing_if = "Option::is_none")]
        task_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        error: String,
    },
    Pong,
}

/// Parse a raw inbound text payload into a frame.
///
/// Returns `None` (logged) for malformed JSON or an unrecognized `type`,
/// matching §6's "unknown types are logged and ignored".
pub fn parse_inbound(raw: &str) -> Option<InboundFrame> {
    match serde_json::from_str::<InboundFrame>(raw) {
        Ok(frame) => Some(frame),
        Err(e) => {
            log::warn!("dropping unparseable inbound frame: {}", e);
            None
        }
    }
}

pub fn serialize_outbound(frame: &OutboundFrame) -> String {
    serde_json::to_string(frame).expect("OutboundFrame always serializes")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_create_task_frame() {
        let raw = r#"{"type":"create-task","request_id":"r1","task_kind":"general-agent","prompt":"hi"}"#;
        let frame = parse_inbound(raw).unwrap();
        match frame {
            InboundFrame::CreateTask { request_id, task_kind, prompt, .. } => {
                assert_eq!(request_id, "r1");
                assert_eq!(task_kind, "general-agent");
                assert_eq!(prompt, "hi");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn unknown_type_is_dropped_not_panicking() {
        assert!(parse_inbound(r#"{"type":"unknown-frame"}"#).is_none());
    }

    #[test]
    fn malformed_json_is_dropped() {
        assert!(parse_inbound("not json").is_none());
    }

    #[test]
    fn task_failed_omits_absent_fields() {
        let frame = OutboundFrame::TaskFailed {
            task_id: None,
            request_id: Some("r1".to_string()),
            error: "unknown task kind".to_string(),
        };
        let json = serialize_outbound(&frame);
        assert!(!json.contains("task_id"));
        assert!(json.contains("request_id"));
    }

    #[test]
    fn command_call_round_trips_shape() {
        let frame = OutboundFrame::CommandCall {
            task_id: "t1".to_string(),
            call_id: "c1".to_string(),
            command: "read-file".to_string(),
            args: serde_json::json!({"path": "/a.txt"}),
        };
        let json = serialize_outbound(&frame);
        assert!(json.contains("\"type\":\"command-call\""));
    }
}
