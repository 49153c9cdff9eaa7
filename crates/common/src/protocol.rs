//! Messages exchanged between the daemon and connected UI clients
//!
//! Inbound: a [`ClientCommand`] per WebSocket text frame.
//! Outbound: one [`RelayMessage`] per frame, shaped `{ "type": ..., "data": ... }`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Command sent by a UI client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientCommand {
    Run(RunRequest),
}

impl ClientCommand {
    /// Parse a client frame; anything malformed yields `None`.
    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }
}

/// Parameters of a run. Both fields absent means a full run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_name_pattern: Option<String>,
}

impl RunRequest {
    pub fn full() -> Self {
        Self::default()
    }

    /// Explicit files, ignoring an empty list.
    pub fn files(&self) -> &[String] {
        self.files.as_deref().unwrap_or_default()
    }

    /// Name filter, ignoring an empty string.
    pub fn name_pattern(&self) -> Option<&str> {
        self.test_name_pattern.as_deref().filter(|p| !p.is_empty())
    }

    pub fn is_filtered(&self) -> bool {
        !self.files().is_empty() || self.name_pattern().is_some()
    }
}

/// Which stream of the test process an output chunk came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl std::fmt::Display for OutputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputStream::Stdout => write!(f, "stdout"),
            OutputStream::Stderr => write!(f, "stderr"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputChunk {
    pub stream: OutputStream,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestError {
    #[serde(default)]
    pub test_id: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitInfo {
    pub code: Option<i32>,
}

/// Change reported by the file watcher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChangeInfo {
    pub filename: String,
    pub full_path: String,
    pub is_test_file: bool,
}

/// Event relayed to every connected client.
///
/// `found`, `start`, `end` and `console` carry the inspector's params untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum RelayMessage {
    Found(Value),
    Start(Value),
    End(Value),
    Output(OutputChunk),
    Console(Value),
    Error(TestError),
    Exit(ExitInfo),
    FileChanged(FileChangeInfo),
}

impl RelayMessage {
    pub fn output(stream: OutputStream, data: impl Into<String>) -> Self {
        RelayMessage::Output(OutputChunk {
            stream,
            data: data.into(),
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RelayMessage::Found(_) => "found",
            RelayMessage::Start(_) => "start",
            RelayMessage::End(_) => "end",
            RelayMessage::Output(_) => "output",
            RelayMessage::Console(_) => "console",
            RelayMessage::Error(_) => "error",
            RelayMessage::Exit(_) => "exit",
            RelayMessage::FileChanged(_) => "file-changed",
        }
    }
}
