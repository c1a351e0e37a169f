//! Streaming evaluation protocol
//!
//! JSON-framed messages carried over one session's channel. Every frame has a
//! `type` tag:
//! - server -> client frames are [`Event`]
//! - the only client -> server frame is [`ClientMessage::Cancel`]

use serde::{Deserialize, Serialize};

/// Maximum characters of program output carried in a single test result
pub const MAX_OUTPUT_CHARS: usize = 4096;

/// Result of one test case, in arrival order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestOutcome {
    #[serde(rename = "test_name")]
    pub name: String,
    pub passed: bool,
    /// Hidden tests never carry this
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_output: Option<String>,
    /// Hidden tests never carry this
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub is_hidden: bool,
}

impl TestOutcome {
    /// Drop anything a hidden test must not disclose
    pub fn redacted(mut self) -> Self {
        if self.is_hidden {
            self.expected_output = None;
            self.actual_output = None;
        }
        self
    }
}

/// AI-derived quality assessment, at most one per session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feedback {
    /// 0-100
    pub overall_score: u32,
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub improvements: Vec<String>,
    #[serde(default)]
    pub best_practices: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complexity_analysis: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

/// Terminal summary of one runner invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub success: bool,
    pub passed_tests: u32,
    pub total_tests: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<u64>,
}

/// Server -> client message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// First frame of every session
    TaskId { task_id: String },
    /// Advisory progress text
    Status { content: String },
    TestResult(TestOutcome),
    Feedback(Feedback),
    /// Terminal: the runner completed
    Result(RunSummary),
    /// Terminal: execution failed or timed out
    Error { content: String },
    /// Terminal: the client cancelled before completion
    Cancelled { reason: String },
}

impl Event {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Event::Result(_) | Event::Error { .. } | Event::Cancelled { .. }
        )
    }

    /// Wire name of the frame type, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Event::TaskId { .. } => "task_id",
            Event::Status { .. } => "status",
            Event::TestResult(_) => "test_result",
            Event::Feedback(_) => "feedback",
            Event::Result(_) => "result",
            Event::Error { .. } => "error",
            Event::Cancelled { .. } => "cancelled",
        }
    }

    pub fn to_frame(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_frame(frame: &str) -> serde_json::Result<Self> {
        serde_json::from_str(frame)
    }
}

/// Client -> server message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Cancel,
}

impl ClientMessage {
    pub fn from_frame(frame: &str) -> serde_json::Result<Self> {
        serde_json::from_str(frame)
    }
}

/// Truncate program output to [`MAX_OUTPUT_CHARS`]
pub fn truncate_output(output: &str) -> String {
    output.chars().take(MAX_OUTPUT_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_result_frame_matches_wire_shape() {
        let event = Event::TestResult(TestOutcome {
            name: "Test 1".into(),
            passed: true,
            expected_output: Some("3".into()),
            actual_output: Some("3".into()),
            error_message: None,
            is_hidden: false,
        });

        let value: serde_json::Value = serde_json::from_str(&event.to_frame().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "test_result",
                "test_name": "Test 1",
                "passed": true,
                "expected_output": "3",
                "actual_output": "3",
                "is_hidden": false
            })
        );
    }

    #[test]
    fn test_parse_result_frame_without_execution_time() {
        let event =
            Event::from_frame(r#"{"type":"result","success":false,"passed_tests":1,"total_tests":2}"#)
                .unwrap();
        assert_eq!(
            event,
            Event::Result(RunSummary {
                success: false,
                passed_tests: 1,
                total_tests: 2,
                execution_time_ms: None,
            })
        );
        assert!(event.is_terminal());
    }

    #[test]
    fn test_parse_feedback_frame_with_missing_lists() {
        let event = Event::from_frame(r#"{"type":"feedback","overall_score":85,"hint":"use a map"}"#)
            .unwrap();
        match event {
            Event::Feedback(feedback) => {
                assert_eq!(feedback.overall_score, 85);
                assert!(feedback.strengths.is_empty());
                assert_eq!(feedback.hint.as_deref(), Some("use a map"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_task_id_and_status_are_not_terminal() {
        assert!(!Event::TaskId { task_id: "eval_1".into() }.is_terminal());
        assert!(!Event::Status { content: "Running Test 1...".into() }.is_terminal());
        assert!(Event::Error { content: "runner crashed".into() }.is_terminal());
        assert!(Event::Cancelled { reason: "client".into() }.is_terminal());
    }

    #[test]
    fn test_client_cancel_frame() {
        assert_eq!(
            ClientMessage::from_frame(r#"{"type":"cancel"}"#).unwrap(),
            ClientMessage::Cancel
        );
        assert!(ClientMessage::from_frame(r#"{"type":"resume"}"#).is_err());
        assert!(ClientMessage::from_frame("not json").is_err());
    }

    #[test]
    fn test_hidden_outcome_is_redacted() {
        let outcome = TestOutcome {
            name: "Hidden 1".into(),
            passed: false,
            expected_output: Some("42".into()),
            actual_output: Some("41".into()),
            error_message: None,
            is_hidden: true,
        }
        .redacted();

        assert!(outcome.expected_output.is_none());
        assert!(outcome.actual_output.is_none());
        let frame = Event::TestResult(outcome).to_frame().unwrap();
        assert!(!frame.contains("42"));
    }

    #[test]
    fn test_truncate_output() {
        let long = "a".repeat(MAX_OUTPUT_CHARS + 10);
        assert_eq!(truncate_output(&long).len(), MAX_OUTPUT_CHARS);
        assert_eq!(truncate_output("short"), "short");
    }
}
