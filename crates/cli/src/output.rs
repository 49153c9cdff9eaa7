//! Output formatting for CLI

use clap::ValueEnum;
use colored::{ColoredString, Colorize};
use comfy_table::{presets::UTF8_FULL, Cell, Color, ContentArrangement, Table};
use serde::Serialize;
use testscope_common::{ConsoleEntry, TestKind, TestStatus, TestSummary, TestTree};

/// Output format
#[derive(Debug, Clone, Copy, ValueEnum, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable table format
    #[default]
    Table,
    /// JSON format
    Json,
    /// Plain text format
    Plain,
}

/// One failed test in a report
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureReport {
    pub id: String,
    pub path: Vec<String>,
    pub file: Option<String>,
    pub status: TestStatus,
    pub error: Option<String>,
}

/// Outcome of one run as the client saw it
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub summary: TestSummary,
    pub failures: Vec<FailureReport>,
    pub exit_code: Option<i32>,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.failures.is_empty() && self.summary.failed == 0 && self.exit_code == Some(0)
    }
}

pub fn status_icon(status: TestStatus) -> ColoredString {
    match status {
        TestStatus::Idle => "○".dimmed(),
        TestStatus::Running => "◐".cyan(),
        TestStatus::Passed => "✓".green(),
        TestStatus::Failed => "✗".red(),
        TestStatus::Timeout => "⏱".red(),
        TestStatus::Skipped => "↷".yellow(),
        TestStatus::Todo => "✎".magenta(),
    }
}

/// `12ms`, `1.50s`
pub fn format_duration(ms: f64) -> String {
    if ms < 1000.0 {
        format!("{:.0}ms", ms)
    } else {
        format!("{:.2}s", ms / 1000.0)
    }
}

/// Progress line for a finished test
pub fn result_line(path: &[String], status: TestStatus, duration: Option<f64>) -> String {
    let name = path.join(" > ");
    let name = if status.is_failure() {
        name.red().to_string()
    } else {
        name
    };
    match duration {
        Some(ms) => format!(
            "{} {} {}",
            status_icon(status),
            name,
            format!("({})", format_duration(ms)).dimmed()
        ),
        None => format!("{} {}", status_icon(status), name),
    }
}

pub fn console_line(entry: &ConsoleEntry) -> String {
    let level = match entry.level.as_str() {
        "error" => entry.level.red(),
        "warn" | "warning" => entry.level.yellow(),
        "debug" | "trace" => entry.level.dimmed(),
        _ => entry.level.cyan(),
    };
    match &entry.source {
        Some(source) => format!(
            "  [{}] {} {}",
            level,
            entry.message,
            source.as_str().dimmed()
        ),
        None => format!("  [{}] {}", level, entry.message),
    }
}

/// Render the tree with group statuses aggregated from their children.
pub fn render_tree(tree: &TestTree) -> Vec<String> {
    fn walk(tree: &TestTree, id: &str, depth: usize, lines: &mut Vec<String>) {
        let Some(node) = tree.get(id) else {
            return;
        };
        let status = tree.aggregate_status(id);
        let indent = "  ".repeat(depth);
        let name = match node.kind {
            TestKind::Describe => node.name.bold().to_string(),
            TestKind::Test => node.name.clone(),
        };
        let mut line = format!("{}{} {}", indent, status_icon(status), name);
        if let Some(ms) = node.duration {
            line.push_str(&format!(" {}", format!("({})", format_duration(ms)).dimmed()));
        }
        lines.push(line);
        for child in &node.children {
            walk(tree, child, depth + 1, lines);
        }
    }

    let mut lines = Vec::new();
    for root in tree.roots() {
        walk(tree, root, 0, &mut lines);
    }
    lines
}

pub fn print_tree(tree: &TestTree) {
    for line in render_tree(tree) {
        println!("{}", line);
    }
}

pub fn summary_table(summary: &TestSummary) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);

    table.set_header(vec!["Total", "Passed", "Failed", "Skipped", "Duration"]);
    table.add_row(vec![
        Cell::new(summary.total),
        Cell::new(summary.passed).fg(Color::Green),
        Cell::new(summary.failed).fg(if summary.failed > 0 {
            Color::Red
        } else {
            Color::Reset
        }),
        Cell::new(summary.skipped).fg(Color::Yellow),
        Cell::new(format_duration(summary.duration_ms)),
    ]);
    table
}

/// Print the end-of-run report
pub fn print_report(report: &RunReport, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(report).unwrap_or_default());
        }
        OutputFormat::Table | OutputFormat::Plain => {
            if !report.failures.is_empty() {
                println!();
                println!("{}", "Failures:".red().bold());
                for failure in &report.failures {
                    println!("  {} {}", status_icon(failure.status), failure.path.join(" > "));
                    if let Some(file) = &failure.file {
                        println!("    {}", file.dimmed());
                    }
                    if let Some(error) = &failure.error {
                        for line in error.lines() {
                            println!("    {}", line);
                        }
                    }
                }
            }

            println!();
            if format == OutputFormat::Table {
                println!("{}", summary_table(&report.summary));
            } else {
                let s = &report.summary;
                println!("Total: {}", s.total);
                println!("Passed: {}", s.passed);
                println!("Failed: {}", s.failed);
                println!("Skipped: {}", s.skipped);
                println!("Duration: {}", format_duration(s.duration_ms));
            }

            let code = report
                .exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "none".to_string());
            if report.succeeded() {
                print_success(&format!("All tests passed (exit code {})", code));
            } else {
                print_error(&format!(
                    "{} failed (exit code {})",
                    report.summary.failed, code
                ));
            }
        }
    }
}

/// Print success message
pub fn print_success(message: &str) {
    println!("✅ {}", message);
}

/// Print error message
pub fn print_error(message: &str) {
    eprintln!("❌ {}", message);
}

/// Print warning message
pub fn print_warning(message: &str) {
    println!("⚠️  {}", message);
}

/// Print info message
pub fn print_info(message: &str) {
    println!("ℹ️  {}", message);
}
