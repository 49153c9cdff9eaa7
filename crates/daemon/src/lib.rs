//! Testscope daemon
//!
//! Spawns the test process, attaches to its inspector and relays test events
//! to browser clients over WebSocket.

pub mod broadcast;
pub mod config;
pub mod server;
pub mod session;
pub mod watcher;

pub use broadcast::{Broadcaster, RunSink};
pub use config::{DaemonConfig, RunnerConfig, WatchConfig};
pub use session::{RunQueue, RunSession, SessionManager, SessionState};
pub use watcher::FileWatcher;

use std::process::{Command, Stdio};

/// Open `url` with the platform's default handler.
pub fn open_browser(url: &str) -> std::io::Result<()> {
    let mut cmd = if cfg!(target_os = "macos") {
        Command::new("open")
    } else if cfg!(target_os = "windows") {
        let mut cmd = Command::new("cmd");
        cmd.args(["/c", "start", ""]);
        cmd
    } else {
        Command::new("xdg-open")
    };

    cmd.arg(url)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map(|_| ())
}
