//! Daemon configuration

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// HTTP/WebSocket port
    pub port: u16,

    /// Bind address
    pub host: String,

    /// Directory with the built UI bundle
    pub static_dir: PathBuf,

    /// Open the UI in a browser once listening
    pub open_browser: bool,

    /// Test process configuration
    pub runner: RunnerConfig,

    /// File watcher configuration
    pub watch: WatchConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            port: testscope_common::DEFAULT_PORT,
            host: "127.0.0.1".to_string(),
            static_dir: PathBuf::from("dist/client"),
            open_browser: true,
            runner: RunnerConfig::default(),
            watch: WatchConfig::default(),
        }
    }
}

/// How the test process is launched
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Program and leading arguments
    pub command: Vec<String>,

    /// Default root passed when no explicit files are requested
    pub test_root: Option<String>,

    /// Default path filter passed after the root
    pub test_pattern: Option<String>,

    /// Flag that takes the name-filter expression
    pub name_filter_flag: String,

    /// Variable carrying the inspector URL
    pub inspect_env: String,

    /// Variable carrying the handshake address
    pub notify_env: String,

    /// Extra environment for the test process
    pub env: BTreeMap<String, String>,

    /// Inspector connect attempts before giving up
    pub connect_attempts: u32,

    /// Delay between connect attempts
    pub connect_retry_ms: u64,

    /// Working directory of the test process
    pub cwd: Option<PathBuf>,

    /// Copy the test process's stdout/stderr to the daemon's own
    pub mirror_output: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            command: vec!["bun".to_string(), "test".to_string()],
            test_root: None,
            test_pattern: None,
            name_filter_flag: "--test-name-pattern".to_string(),
            inspect_env: "BUN_INSPECT".to_string(),
            notify_env: "BUN_INSPECT_NOTIFY".to_string(),
            env: BTreeMap::new(),
            connect_attempts: 5,
            connect_retry_ms: 300,
            cwd: None,
            mirror_output: true,
        }
    }
}

/// File watcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    pub enabled: bool,

    /// Directories watched recursively
    pub paths: Vec<PathBuf>,

    /// Quiet period before a change is reported
    pub debounce_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            paths: vec![PathBuf::from(".")],
            debounce_ms: 50,
        }
    }
}

/// The parts of `bunfig.toml` the daemon cares about
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Bunfig {
    #[serde(default)]
    pub test: BunfigTest,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct BunfigTest {
    pub root: Option<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub preload: Vec<String>,
}

impl Bunfig {
    /// Read `bunfig.toml` from `dir`. Missing or malformed files yield `None`.
    pub fn read(dir: &Path) -> Option<Self> {
        let path = dir.join("bunfig.toml");
        let content = std::fs::read_to_string(&path).ok()?;
        match toml::from_str(&content) {
            Ok(bunfig) => Some(bunfig),
            Err(e) => {
                debug!("Ignoring malformed {}: {}", path.display(), e);
                None
            }
        }
    }
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) => vec![s],
        OneOrMany::Many(v) => v,
    })
}

impl DaemonConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Fill gaps from `bunfig.toml` in the runner's working directory.
    pub fn apply_bunfig(&mut self) -> Option<Bunfig> {
        let bunfig = Bunfig::read(&self.working_dir())?;
        if self.runner.test_root.is_none() {
            self.runner.test_root = bunfig.test.root.clone();
        }
        if !bunfig.test.preload.is_empty() {
            debug!("bunfig preloads: {:?}", bunfig.test.preload);
        }
        Some(bunfig)
    }

    /// Directory the test process runs in
    pub fn working_dir(&self) -> PathBuf {
        self.runner
            .cwd
            .clone()
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// URL shown to the operator and opened in the browser
    pub fn ui_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

impl RunnerConfig {
    /// Delay between inspector connect attempts
    pub fn retry_delay(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.connect_retry_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = DaemonConfig::default();
        assert_eq!(config.port, 51205);
        assert_eq!(config.runner.command, vec!["bun", "test"]);
        assert_eq!(config.runner.connect_attempts, 5);
        assert_eq!(config.runner.connect_retry_ms, 300);
        assert_eq!(config.watch.debounce_ms, 50);
        assert_eq!(config.ui_url(), "http://127.0.0.1:51205");
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempdir().unwrap();
        let config = DaemonConfig::load(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config.port, 51205);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("testscope.toml");
        std::fs::write(
            &path,
            "port = 4000\n[runner]\ncommand = [\"npx\", \"vitest\"]\n[watch]\nenabled = false\n",
        )
        .unwrap();

        let config = DaemonConfig::load(&path).unwrap();
        assert_eq!(config.port, 4000);
        assert_eq!(config.runner.command, vec!["npx", "vitest"]);
        assert_eq!(config.runner.inspect_env, "BUN_INSPECT");
        assert!(!config.watch.enabled);
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("testscope.toml");
        std::fs::write(&path, "port = \"many\"").unwrap();
        assert!(DaemonConfig::load(&path).is_err());
    }

    #[test]
    fn test_bunfig_fills_test_root() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("bunfig.toml"),
            "[test]\nroot = \"./src\"\npreload = \"./setup.ts\"\n",
        )
        .unwrap();

        let mut config = DaemonConfig::default();
        config.runner.cwd = Some(dir.path().to_path_buf());
        let bunfig = config.apply_bunfig().unwrap();
        assert_eq!(bunfig.test.preload, vec!["./setup.ts"]);
        assert_eq!(config.runner.test_root.as_deref(), Some("./src"));

        config.runner.test_root = Some("explicit".to_string());
        config.apply_bunfig();
        assert_eq!(config.runner.test_root.as_deref(), Some("explicit"));
    }

    #[test]
    fn test_malformed_bunfig_is_ignored() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("bunfig.toml"), "[test\nroot=").unwrap();
        assert!(Bunfig::read(dir.path()).is_none());
    }
}
