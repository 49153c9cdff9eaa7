//! Testscope Daemon
//!
//! Serves the UI, runs tests on request and streams their progress.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use testscope_daemon::server::{self, AppState};
use testscope_daemon::{Broadcaster, DaemonConfig, FileWatcher, SessionManager};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "testscoped")]
#[command(about = "Testscope daemon - watch test runs live in the browser")]
#[command(version)]
struct Cli {
    /// Path filter passed to the test runner
    #[arg(env = "TESTSCOPE_PATTERN")]
    pattern: Option<String>,

    /// Configuration file path
    #[arg(short, long, default_value = "testscope.toml")]
    config: PathBuf,

    /// HTTP/WebSocket port
    #[arg(short, long, env = "TESTSCOPE_PORT")]
    port: Option<u16>,

    /// Test root (defaults to bunfig's [test].root)
    #[arg(long, env = "TESTSCOPE_ROOT")]
    root: Option<String>,

    /// Do not open a browser
    #[arg(long)]
    no_open: bool,

    /// Do not watch files
    #[arg(long)]
    no_watch: bool,

    /// Start a full run as soon as the server is up
    #[arg(long)]
    run: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    info!("Testscope daemon v{}", testscope_common::VERSION);

    // Load configuration, then let flags override it
    let mut config = DaemonConfig::load(&cli.config)?;
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(root) = cli.root {
        config.runner.test_root = Some(root);
    }
    if let Some(pattern) = cli.pattern {
        config.runner.test_pattern = Some(pattern);
    }
    if cli.no_open {
        config.open_browser = false;
    }
    if cli.no_watch {
        config.watch.enabled = false;
    }
    config.apply_bunfig();

    info!("Command: {}", config.runner.command.join(" "));
    if let Some(root) = &config.runner.test_root {
        info!("Test root: {}", root);
    }
    if let Some(pattern) = &config.runner.test_pattern {
        info!("Pattern: {}", pattern);
    }

    let broadcaster = Broadcaster::new();
    let sessions = Arc::new(SessionManager::new(
        config.runner.clone(),
        broadcaster.clone(),
    ));
    let state = Arc::new(AppState::new(sessions.clone()));
    let runs = state.runs.clone();

    let _watcher = if config.watch.enabled {
        match FileWatcher::spawn(&config.watch, broadcaster.clone()) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                warn!("File watching disabled: {}", e);
                None
            }
        }
    } else {
        None
    };

    let listener = tokio::net::TcpListener::bind(config.bind_addr()).await?;
    let app = server::router(state, config.static_dir.clone());
    let server_handle = tokio::spawn(server::serve(listener, app));

    let url = config.ui_url();
    info!("UI available at {}", url);

    if config.open_browser {
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            if let Err(e) = testscope_daemon::open_browser(&url) {
                warn!("Could not open browser ({}). Please visit: {}", e, url);
            }
        });
    }

    if cli.run {
        runs.submit(Default::default());
    }

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task failed: {}", e),
                Ok(Ok(())) => {}
            }
        }
    }

    sessions.stop().await;
    info!("Daemon shutdown complete");
    Ok(())
}
