//! Drives runs over the relay socket and reports progress as events arrive

use crate::client::RelaySocket;
use crate::output::{self, FailureReport, OutputFormat, RunReport};
use anyhow::{bail, Result};
use testscope_common::protocol::OutputStream;
use testscope_common::{
    EndParams, ReconciliationStore, RelayMessage, RunOptions, TestKind, TestStatus,
};
use tracing::debug;

/// What to print while following a run
#[derive(Debug, Clone, Copy, Default)]
pub struct DriverOptions {
    pub format: OutputFormat,
    /// Mirror the test process's stdout/stderr
    pub show_output: bool,
    pub show_console: bool,
    /// Print the full tree after each run
    pub show_tree: bool,
}

pub struct RunDriver {
    store: ReconciliationStore,
    options: DriverOptions,
}

impl RunDriver {
    pub fn new(options: DriverOptions) -> Self {
        Self {
            store: ReconciliationStore::new(),
            options,
        }
    }

    pub fn store(&self) -> &ReconciliationStore {
        &self.store
    }

    /// Start a run and follow it until the process exits.
    ///
    /// Also returns the re-run requested by a file change seen mid-run.
    pub async fn run(
        &mut self,
        socket: &mut RelaySocket,
        run: RunOptions,
    ) -> Result<(RunReport, Option<RunOptions>)> {
        let request = self.store.begin_run(run);
        debug!(?request, "Starting run");
        socket.send_run(&request).await?;

        let mut rerun = None;
        loop {
            let Some(message) = socket.next_message().await? else {
                bail!("daemon closed the connection during the run");
            };
            if let Some(next) = self.observe(&message) {
                rerun = Some(next);
            }
            if let RelayMessage::Exit(info) = &message {
                return Ok((self.report(info.code), rerun));
            }
        }
    }

    /// Run, then keep re-running whatever changed files ask for.
    pub async fn watch(&mut self, socket: &mut RelaySocket, initial: RunOptions) -> Result<()> {
        let mut next = Some(initial);
        loop {
            if let Some(run) = next.take() {
                let (report, rerun) = self.run(socket, run).await?;
                self.finish(&report);
                next = rerun;
                if next.is_some() {
                    continue;
                }
                if self.options.format != OutputFormat::Json {
                    output::print_info("Waiting for file changes...");
                }
            }

            match socket.next_message().await? {
                Some(message) => next = self.observe(&message),
                None => bail!("daemon closed the connection"),
            }
        }
    }

    /// Print the end-of-run output.
    pub fn finish(&self, report: &RunReport) {
        if self.options.show_tree && self.options.format != OutputFormat::Json {
            println!();
            output::print_tree(self.store.tree());
        }
        output::print_report(report, self.options.format);
    }

    /// Fold one message into the store and print what it changed.
    pub fn observe(&mut self, message: &RelayMessage) -> Option<RunOptions> {
        let target = self.end_target(message);
        let before = target
            .as_deref()
            .and_then(|id| self.store.node(id))
            .map(|n| n.status)
            .unwrap_or_default();

        let follow_up = self.store.apply(message);
        if self.options.format == OutputFormat::Json {
            return follow_up;
        }

        match message {
            RelayMessage::End(_) => {
                let Some(id) = target else {
                    return follow_up;
                };
                let Some(node) = self.store.node(&id) else {
                    return follow_up;
                };
                let settled = !matches!(node.status, TestStatus::Idle | TestStatus::Running);
                if node.kind == TestKind::Test && settled && node.status != before {
                    let path = self.store.tree().test_path(&id).unwrap_or_default();
                    println!("{}", output::result_line(&path, node.status, node.duration));
                }
            }
            RelayMessage::Output(chunk) if self.options.show_output => match chunk.stream {
                OutputStream::Stdout => print!("{}", chunk.data),
                OutputStream::Stderr => eprint!("{}", chunk.data),
            },
            RelayMessage::Console(_) if self.options.show_console => {
                if let Some(entry) = self.store.console_entries().last() {
                    println!("{}", output::console_line(entry));
                }
            }
            RelayMessage::Error(error) if error.test_id.is_none() => {
                output::print_error(&error.message);
            }
            RelayMessage::FileChanged(info) => {
                output::print_info(&format!("Changed: {}", info.filename));
            }
            _ => {}
        }
        follow_up
    }

    /// Report for the run that just exited, failures in tree order.
    pub fn report(&self, exit_code: Option<i32>) -> RunReport {
        let tree = self.store.tree();
        let failures = tree
            .roots()
            .iter()
            .flat_map(|root| tree.collect_leaf_tests(root))
            .filter_map(|leaf| {
                let node = tree.get(&leaf.id)?;
                node.status.is_failure().then(|| FailureReport {
                    id: leaf.id.clone(),
                    path: leaf.path,
                    file: leaf.file,
                    status: node.status,
                    error: node.error.clone(),
                })
            })
            .collect();

        RunReport {
            summary: self.store.summary(),
            failures,
            exit_code,
        }
    }

    /// Stable id an `end` message will land on.
    fn end_target(&self, message: &RelayMessage) -> Option<String> {
        let RelayMessage::End(data) = message else {
            return None;
        };
        let params: EndParams = serde_json::from_value(data.clone()).ok()?;
        Some(self.store.identities().resolve(&params.id))
    }
}
