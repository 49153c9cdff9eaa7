//! Testscope CLI - Main Entry Point

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use testscope_cli::output::{self, OutputFormat};
use testscope_cli::{DaemonClient, DriverOptions, RunDriver};
use testscope_common::{build_test_name_pattern, RunOptions};

/// Testscope CLI - run bun tests through the Testscope daemon
#[derive(Parser)]
#[command(name = "testscope")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Daemon address
    #[arg(
        long,
        default_value = "http://127.0.0.1:51205",
        env = "TESTSCOPE_URL",
        global = true
    )]
    daemon_addr: String,

    /// Output format
    #[arg(long, default_value = "table", global = true)]
    format: OutputFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run tests and report the results
    Run(RunArgs),

    /// Check daemon status
    Status,

    /// Show version information
    Version,
}

#[derive(Args)]
struct RunArgs {
    /// Test files to run (all files when empty)
    files: Vec<String>,

    /// Raw test name filter passed to the runner
    #[arg(short = 't', long, conflicts_with = "only")]
    test_name_pattern: Option<String>,

    /// Run only the test or group at this path, e.g. "math > adds"
    #[arg(long)]
    only: Vec<String>,

    /// Keep running and re-run tests when files change
    #[arg(short, long)]
    watch: bool,

    /// Mirror the test process's stdout/stderr
    #[arg(long)]
    output: bool,

    /// Print console calls made by tests
    #[arg(long)]
    console: bool,

    /// Print the test tree after each run
    #[arg(long)]
    tree: bool,
}

impl RunArgs {
    fn run_options(&self) -> RunOptions {
        let test_name_pattern = match &self.test_name_pattern {
            Some(pattern) => Some(pattern.clone()),
            None => {
                let paths: Vec<Vec<String>> = self
                    .only
                    .iter()
                    .map(|p| p.split(" > ").map(|s| s.trim().to_string()).collect())
                    .collect();
                build_test_name_pattern(&paths)
            }
        };
        RunOptions {
            files: self.files.clone(),
            test_name_pattern,
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let client = DaemonClient::new(&cli.daemon_addr)?;

    match cli.command {
        Commands::Run(args) => {
            let mut socket = match client.connect().await {
                Ok(socket) => socket,
                Err(e) => {
                    output::print_error(&format!("Cannot connect to daemon: {:#}", e));
                    std::process::exit(1);
                }
            };

            let mut driver = RunDriver::new(DriverOptions {
                format: cli.format,
                show_output: args.output,
                show_console: args.console,
                show_tree: args.tree,
            });
            let options = args.run_options();

            if args.watch {
                tokio::select! {
                    result = driver.watch(&mut socket, options) => result?,
                    _ = tokio::signal::ctrl_c() => {}
                }
                socket.close().await.ok();
            } else {
                let (report, _) = driver.run(&mut socket, options).await?;
                driver.finish(&report);
                socket.close().await.ok();
                if !report.succeeded() {
                    std::process::exit(1);
                }
            }
        }
        Commands::Status => match client.health().await {
            Ok(health) => {
                output::print_success(&format!(
                    "Daemon v{} is running at {}",
                    health.version,
                    client.base_url()
                ));
                println!("  Clients: {}", health.clients);
                println!(
                    "  Session: {}",
                    health.session.as_deref().unwrap_or("idle")
                );
            }
            Err(e) => {
                output::print_error(&format!("Daemon is not responding at {}: {}", cli.daemon_addr, e));
                std::process::exit(1);
            }
        },
        Commands::Version => {
            println!("Testscope CLI v{}", testscope_common::VERSION);
        }
    }

    Ok(())
}
