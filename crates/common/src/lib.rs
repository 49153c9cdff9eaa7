//! Testscope Common Library
//!
//! Shared model, wire protocol, inspector client and run reconciliation for
//! the Testscope daemon and its clients.

pub mod console;
pub mod error;
pub mod inspector;
pub mod pattern;
pub mod protocol;
pub mod reconcile;
pub mod signal;
pub mod types;

// Re-export commonly used types
pub use console::{ConsoleEntry, ConsoleLog, CONSOLE_CAPACITY};
pub use error::{Error, Result};
pub use inspector::{InspectorClient, InspectorEvent};
pub use pattern::{build_test_name_pattern, normalize_file_path};
pub use protocol::{
    ClientCommand, ExitInfo, FileChangeInfo, OutputStream, RelayMessage, RunRequest, TestError,
};
pub use reconcile::{LeafSelection, ReconciliationStore, RunIdentityMap, RunOptions, TestTree};
pub use signal::{SignalChannel, SignalEvent};
pub use types::*;

/// Testscope version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default port for the daemon's HTTP/WebSocket server
pub const DEFAULT_PORT: u16 = 51205;

/// Default config file, looked up in the working directory
pub fn default_config_path() -> std::path::PathBuf {
    std::path::PathBuf::from("testscope.toml")
}
