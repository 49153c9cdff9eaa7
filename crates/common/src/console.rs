//! Bounded console log kept by the client

use crate::types::ConsolePayload;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;

/// Number of console entries retained per run
pub const CONSOLE_CAPACITY: usize = 200;

/// One console call made by the test process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsoleEntry {
    pub id: u64,
    pub level: String,
    pub message: String,
    /// Milliseconds since the Unix epoch
    pub timestamp: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// Ring buffer of console entries; the oldest entry is evicted on overflow.
#[derive(Debug, Clone)]
pub struct ConsoleLog {
    entries: VecDeque<ConsoleEntry>,
    capacity: usize,
    next_id: u64,
}

impl ConsoleLog {
    pub fn new() -> Self {
        Self::with_capacity(CONSOLE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            next_id: 0,
        }
    }

    /// Record a console payload, attributing it to `test_id`.
    pub fn record(&mut self, payload: &ConsolePayload, test_id: Option<String>) -> &ConsoleEntry {
        let level = payload.level.clone().unwrap_or_else(|| "log".to_string());
        let message = if payload.args.is_empty() {
            level.clone()
        } else {
            payload
                .args
                .iter()
                .map(stringify_arg)
                .collect::<Vec<_>>()
                .join(" ")
        };

        let source = payload
            .stack_trace
            .as_ref()
            .and_then(|trace| trace.call_frames.first())
            .map(|frame| {
                format!(
                    "{}:{}:{}",
                    frame.url.as_deref().unwrap_or("unknown"),
                    frame.line_number.unwrap_or(0).saturating_add(1),
                    frame.column_number.unwrap_or(0).saturating_add(1)
                )
            });

        self.next_id += 1;
        let entry = ConsoleEntry {
            id: self.next_id,
            level,
            message,
            timestamp: payload
                .timestamp
                .unwrap_or_else(|| chrono::Utc::now().timestamp_millis() as f64),
            test_id,
            source,
        };
        self.push(entry)
    }

    /// Record a free-form line, e.g. an error without an owning test.
    pub fn record_line(&mut self, level: &str, message: &str, test_id: Option<String>) -> &ConsoleEntry {
        self.next_id += 1;
        let entry = ConsoleEntry {
            id: self.next_id,
            level: level.to_string(),
            message: message.to_string(),
            timestamp: chrono::Utc::now().timestamp_millis() as f64,
            test_id,
            source: None,
        };
        self.push(entry)
    }

    fn push(&mut self, entry: ConsoleEntry) -> &ConsoleEntry {
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
        &self.entries[self.entries.len() - 1]
    }

    /// Drop all entries; ids keep increasing.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn entries(&self) -> impl Iterator<Item = &ConsoleEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ConsoleLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Render one console argument as text.
///
/// Inspector arguments are remote objects; primitives carry a `value`,
/// everything else a `description`.
pub fn stringify_arg(arg: &Value) -> String {
    match arg {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(_) | Value::Number(_) => arg.to_string(),
        Value::Object(map) => {
            if let Some(value) = map.get("value") {
                return stringify_arg(value);
            }
            if let Some(description) = map.get("description").and_then(Value::as_str) {
                return description.to_string();
            }
            match map.get("type").and_then(Value::as_str) {
                Some("undefined") => "undefined".to_string(),
                _ => serde_json::to_string_pretty(arg).unwrap_or_else(|_| arg.to_string()),
            }
        }
        Value::Array(_) => serde_json::to_string_pretty(arg).unwrap_or_else(|_| arg.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CallFrame, StackTrace};
    use serde_json::json;

    #[test]
    fn test_ring_buffer_evicts_oldest() {
        let mut log = ConsoleLog::with_capacity(3);
        for i in 0..5 {
            log.record_line("log", &format!("line {}", i), None);
        }
        let ids: Vec<u64> = log.entries().map(|e| e.id).collect();
        assert_eq!(ids, vec![3, 4, 5]);
        assert_eq!(log.len(), 3);
    }

    #[test]
    fn test_record_payload() {
        let payload = ConsolePayload {
            args: vec![
                json!({"type": "string", "value": "sum is"}),
                json!({"type": "number", "value": 3}),
            ],
            level: Some("warning".to_string()),
            timestamp: Some(1000.0),
            stack_trace: Some(StackTrace {
                call_frames: vec![CallFrame {
                    url: Some("file:///a.test.ts".to_string()),
                    line_number: Some(4),
                    column_number: Some(2),
                    function_name: None,
                }],
            }),
        };
        let mut log = ConsoleLog::new();
        let entry = log.record(&payload, Some("7".to_string())).clone();
        assert_eq!(entry.message, "sum is 3");
        assert_eq!(entry.level, "warning");
        assert_eq!(entry.timestamp, 1000.0);
        assert_eq!(entry.test_id.as_deref(), Some("7"));
        assert_eq!(entry.source.as_deref(), Some("file:///a.test.ts:5:3"));
    }

    #[test]
    fn test_source_location_saturates() {
        let payload = ConsolePayload {
            args: vec![json!("edge")],
            stack_trace: Some(StackTrace {
                call_frames: vec![CallFrame {
                    url: None,
                    line_number: Some(u32::MAX),
                    column_number: Some(u32::MAX),
                    function_name: None,
                }],
            }),
            ..Default::default()
        };
        let mut log = ConsoleLog::new();
        let entry = log.record(&payload, None);
        let expected = format!("unknown:{}:{}", u32::MAX, u32::MAX);
        assert_eq!(entry.source.as_deref(), Some(expected.as_str()));
    }

    #[test]
    fn test_record_without_args_uses_level() {
        let mut log = ConsoleLog::new();
        let entry = log.record(&ConsolePayload::default(), None);
        assert_eq!(entry.message, "log");
        assert_eq!(entry.source, None);
    }

    #[test]
    fn test_stringify_objects() {
        assert_eq!(
            stringify_arg(&json!({"type": "object", "description": "Object"})),
            "Object"
        );
        assert_eq!(stringify_arg(&json!({"type": "undefined"})), "undefined");
        assert_eq!(stringify_arg(&json!(true)), "true");
    }
}
