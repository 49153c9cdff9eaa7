//! Core types for Testscope

use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Whether a node is a single test or a `describe` group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestKind {
    #[default]
    Test,
    Describe,
}

/// Test status as shown in the tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    #[default]
    Idle,
    Running,
    Passed,
    Failed,
    Skipped,
    Todo,
    Timeout,
}

impl TestStatus {
    /// Map a raw reporter status (`pass`, `fail`, ...) onto the tree status.
    pub fn from_reported(raw: &str) -> Self {
        match raw {
            "pass" => TestStatus::Passed,
            "fail" => TestStatus::Failed,
            "timeout" => TestStatus::Timeout,
            "todo" => TestStatus::Todo,
            _ => TestStatus::Skipped,
        }
    }

    pub fn is_failure(self) -> bool {
        matches!(self, TestStatus::Failed | TestStatus::Timeout)
    }

    /// Terminal states that count as "did not fail" for group aggregation.
    pub fn is_settled_ok(self) -> bool {
        matches!(
            self,
            TestStatus::Passed | TestStatus::Skipped | TestStatus::Todo
        )
    }
}

impl std::fmt::Display for TestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestStatus::Idle => write!(f, "idle"),
            TestStatus::Running => write!(f, "running"),
            TestStatus::Passed => write!(f, "passed"),
            TestStatus::Failed => write!(f, "failed"),
            TestStatus::Skipped => write!(f, "skipped"),
            TestStatus::Todo => write!(f, "todo"),
            TestStatus::Timeout => write!(f, "timeout"),
        }
    }
}

/// Raw reporter statuses that mean "skipped".
pub fn is_skip_status(raw: &str) -> bool {
    matches!(raw, "skip" | "skipped_because_label")
}

/// One discovered test or group, keyed by its stable id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestNode {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: TestKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default)]
    pub status: TestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub children: Vec<String>,
}

impl TestNode {
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: TestKind) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind,
            parent_id: None,
            url: None,
            line: None,
            status: TestStatus::Idle,
            duration: None,
            error: None,
            children: Vec::new(),
        }
    }

    /// Stand-in for a parent that has not been reported yet.
    pub fn placeholder_group(id: impl Into<String>) -> Self {
        Self::new(id, "Group", TestKind::Describe)
    }

    /// Stand-in for a test referenced by `start`/`end` before `found`.
    pub fn placeholder_test(id: impl Into<String>) -> Self {
        let id = id.into();
        let name = format!("Test {}", id);
        Self::new(id, name, TestKind::Test)
    }

    /// Append a child id, keeping discovery order and no duplicates.
    pub fn add_child(&mut self, child_id: &str) {
        if !self.children.iter().any(|c| c == child_id) {
            self.children.push(child_id.to_string());
        }
    }

    /// Forget the outcome of the previous run.
    pub fn reset_result(&mut self) {
        self.status = TestStatus::Idle;
        self.duration = None;
        self.error = None;
    }
}

/// Overall phase of the current run, from the client's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunPhase {
    #[default]
    Idle,
    Running,
    Done,
}

/// Counts over the test leaves of the tree
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub running: usize,
    pub duration_ms: f64,
}

// Inspector payloads. These are owned by the runtime's protocol; only the
// fields the reconciler reads are modelled.

/// `TestReporter.found`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FoundParams {
    #[serde(deserialize_with = "ephemeral_id")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: TestKind,
    #[serde(default, deserialize_with = "optional_ephemeral_id")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub line: Option<u32>,
}

/// `TestReporter.start`
#[derive(Debug, Clone, Deserialize)]
pub struct StartParams {
    #[serde(deserialize_with = "ephemeral_id")]
    pub id: String,
}

/// `TestReporter.end`
#[derive(Debug, Clone, Deserialize)]
pub struct EndParams {
    #[serde(deserialize_with = "ephemeral_id")]
    pub id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub elapsed: Value,
    #[serde(default)]
    pub error: Option<Value>,
}

impl EndParams {
    /// Message of the reported error, if any.
    pub fn error_message(&self) -> Option<String> {
        match self.error.as_ref()? {
            Value::String(s) => Some(s.clone()),
            Value::Object(map) => map
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string),
            _ => None,
        }
    }
}

/// `Runtime.consoleAPICalled`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsolePayload {
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(rename = "type", default)]
    pub level: Option<String>,
    #[serde(default)]
    pub timestamp: Option<f64>,
    #[serde(default)]
    pub stack_trace: Option<StackTrace>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackTrace {
    #[serde(default)]
    pub call_frames: Vec<CallFrame>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallFrame {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub line_number: Option<u32>,
    #[serde(default)]
    pub column_number: Option<u32>,
    #[serde(default)]
    pub function_name: Option<String>,
}

/// Ids arrive as numbers from the runtime but are handled as strings.
fn ephemeral_id<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(de::Error::custom(format!("invalid test id: {}", other))),
    }
}

fn optional_ephemeral_id<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s)),
        Value::Number(n) => Ok(Some(n.to_string())),
        other => Err(de::Error::custom(format!("invalid parent id: {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_mapping() {
        assert_eq!(TestStatus::from_reported("pass"), TestStatus::Passed);
        assert_eq!(TestStatus::from_reported("fail"), TestStatus::Failed);
        assert_eq!(TestStatus::from_reported("timeout"), TestStatus::Timeout);
        assert_eq!(TestStatus::from_reported("todo"), TestStatus::Todo);
        assert_eq!(TestStatus::from_reported("skip"), TestStatus::Skipped);
        assert_eq!(TestStatus::from_reported("whatever"), TestStatus::Skipped);
    }

    #[test]
    fn test_found_params_numeric_ids() {
        let params: FoundParams = serde_json::from_value(json!({
            "id": 7,
            "name": "adds",
            "type": "test",
            "parentId": 3,
            "url": "file:///tmp/a.test.ts",
            "line": 12
        }))
        .unwrap();
        assert_eq!(params.id, "7");
        assert_eq!(params.parent_id.as_deref(), Some("3"));
        assert_eq!(params.kind, TestKind::Test);
        assert_eq!(params.line, Some(12));
    }

    #[test]
    fn test_found_params_without_parent() {
        let params: FoundParams = serde_json::from_value(json!({
            "id": "1",
            "name": "math",
            "type": "describe",
            "parentId": null
        }))
        .unwrap();
        assert_eq!(params.parent_id, None);
        assert_eq!(params.kind, TestKind::Describe);
    }

    #[test]
    fn test_end_error_message() {
        let params: EndParams = serde_json::from_value(json!({
            "id": 2,
            "status": "fail",
            "elapsed": 4,
            "error": { "message": "expected 1 to be 2" }
        }))
        .unwrap();
        assert_eq!(params.error_message().as_deref(), Some("expected 1 to be 2"));
    }

    #[test]
    fn test_node_children_dedup() {
        let mut node = TestNode::placeholder_group("g");
        node.add_child("a");
        node.add_child("b");
        node.add_child("a");
        assert_eq!(node.children, vec!["a", "b"]);
    }

    #[test]
    fn test_node_serializes_type_field() {
        let node = TestNode::new("1", "adds", TestKind::Test);
        let value = serde_json::to_value(&node).unwrap();
        assert_eq!(value["type"], "test");
        assert_eq!(value["status"], "idle");
        assert!(value.get("parentId").is_none());
    }
}
