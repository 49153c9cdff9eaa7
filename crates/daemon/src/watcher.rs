//! Source watcher
//!
//! Watches the configured directories and broadcasts a `file-changed`
//! message once changes settle. Clients decide what to re-run.

use crate::broadcast::Broadcaster;
use crate::config::WatchConfig;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::time::Duration;
use testscope_common::normalize_file_path;
use testscope_common::protocol::FileChangeInfo;
use testscope_common::RelayMessage;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

static TEST_FILE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\.(test|spec)\.(ts|tsx|js|jsx|mts|mjs|cts|cjs)$").expect("static test file pattern")
});

/// Directories whose contents never trigger a re-run
const IGNORED_DIRS: &[&str] = &["node_modules", ".git", "dist", "target"];

pub fn is_test_file(name: &str) -> bool {
    TEST_FILE.is_match(name)
}

fn is_ignored(path: &Path) -> bool {
    path.components().any(|c| {
        c.as_os_str()
            .to_str()
            .is_some_and(|name| IGNORED_DIRS.contains(&name))
    })
}

/// Describe a changed path for clients. Ignored paths yield `None`.
pub fn change_info(path: &Path) -> Option<FileChangeInfo> {
    if is_ignored(path) {
        return None;
    }
    let filename = path.file_name()?.to_string_lossy().into_owned();
    let absolute = std::fs::canonicalize(path)
        .or_else(|_| std::path::absolute(path))
        .unwrap_or_else(|_| path.to_path_buf());
    let full_path = normalize_file_path(&absolute.to_string_lossy())?;

    Some(FileChangeInfo {
        is_test_file: is_test_file(&filename),
        filename,
        full_path,
    })
}

/// Running watcher; dropping it stops watching.
pub struct FileWatcher {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl FileWatcher {
    /// Start watching `config.paths`. Paths that do not exist are skipped.
    pub fn spawn(config: &WatchConfig, broadcaster: Broadcaster) -> notify::Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel::<PathBuf>();

        let mut watcher =
            notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| match res {
                Ok(event) => match event.kind {
                    EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) => {
                        for path in event.paths {
                            let _ = tx.send(path);
                        }
                    }
                    _ => {}
                },
                Err(e) => warn!("File watcher error: {}", e),
            })?;

        for path in &config.paths {
            if !path.exists() {
                warn!("Not watching missing path {}", path.display());
                continue;
            }
            watcher.watch(path, RecursiveMode::Recursive)?;
            info!("Watching {}", path.display());
        }

        let task = tokio::spawn(debounce(
            rx,
            Duration::from_millis(config.debounce_ms),
            broadcaster,
        ));

        Ok(Self {
            _watcher: watcher,
            task,
        })
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Report the last path of each burst once `quiet` passes without changes.
async fn debounce(mut rx: mpsc::UnboundedReceiver<PathBuf>, quiet: Duration, broadcaster: Broadcaster) {
    while let Some(mut latest) = rx.recv().await {
        let closed = loop {
            match tokio::time::timeout(quiet, rx.recv()).await {
                Ok(Some(path)) => latest = path,
                Ok(None) => break true,
                Err(_) => break false,
            }
        };

        if let Some(info) = change_info(&latest) {
            debug!("File changed: {} (test file: {})", info.full_path, info.is_test_file);
            broadcaster.broadcast(&RelayMessage::FileChanged(info));
        }
        if closed {
            break;
        }
    }
}
