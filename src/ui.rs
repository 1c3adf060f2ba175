//! Terminal output: spinners and coloured summaries.
//!
//! `indicatif` drives the spinner shown while the supervisor waits on the
//! worker; `console` styles the one-line summaries printed after the JSON.

use std::time::Duration;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::pipeline::CycleSummary;
use crate::state_machine::{ApplicationStatus, WorkItem};
use crate::supervisor::{ControlStatus, HealthReport, WorkerState};

/// Spinner shown while a control operation waits on the worker.
pub struct Spinner {
    pb: ProgressBar,
}

impl Spinner {
    pub fn start(message: impl Into<String>) -> Self {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
            pb.set_style(style);
        }
        pb.set_message(message.into());
        pb.enable_steady_tick(Duration::from_millis(100));
        Self { pb }
    }

    pub fn finish(self) {
        self.pb.finish_and_clear();
    }
}

fn pretty<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_default()
}

/// One-line summary of a control response and whether it succeeded.
fn control_line(status: &ControlStatus) -> (bool, String) {
    match status {
        ControlStatus::Started { pid } => (true, format!("Worker started (pid {pid})")),
        ControlStatus::AlreadyRunning { pid } => {
            (true, format!("Worker already running (pid {pid})"))
        }
        ControlStatus::Stopped { pid, forced: false } => {
            (true, format!("Worker {pid} stopped"))
        }
        ControlStatus::Stopped { pid, forced: true } => {
            (true, format!("Worker {pid} killed"))
        }
        ControlStatus::NotRunning => (true, "Worker is not running".to_string()),
        ControlStatus::Restarted { pid } => (true, format!("Worker restarted (pid {pid})")),
        ControlStatus::Failed { message } => (false, format!("Failed: {message}")),
    }
}

pub fn print_control(status: &ControlStatus) {
    println!("{}", pretty(status));
    let (ok, line) = control_line(status);
    if ok {
        println!("  {} {line}", Style::new().green().bold().apply_to("✓"));
    } else {
        println!("  {} {line}", Style::new().red().bold().apply_to("✗"));
    }
}

pub fn print_health(report: &HealthReport) {
    println!("{}", pretty(report));

    let (mark, style) = match (report.state, report.healthy) {
        (WorkerState::Running, true) => ("●", Style::new().green().bold()),
        (WorkerState::Running, false) => ("●", Style::new().yellow().bold()),
        (WorkerState::Crashed, _) => ("✗", Style::new().red().bold()),
        _ => ("○", Style::new().dim()),
    };
    let pid = report
        .pid
        .map(|p| format!(" (pid {p})"))
        .unwrap_or_default();
    let poll = report
        .last_poll_at
        .map(|t| format!(", last poll {}", t.format("%Y-%m-%d %H:%M:%S UTC")))
        .unwrap_or_default();
    println!(
        "  {} Worker {:?}{pid}{poll}",
        style.apply_to(mark),
        report.state
    );
    if report.requires_manual_intervention {
        println!(
            "  {} Restart limit reached; run `jobpilot start` after fixing the cause",
            Style::new().red().bold().apply_to("!")
        );
    }
}

pub fn print_cycle(summary: &CycleSummary) {
    let green = Style::new().green();
    let yellow = Style::new().yellow();
    let red = Style::new().red();
    println!(
        "Cycle: {} claimed, {} ready, {} not viable, {} retried, {} failed",
        summary.claimed,
        green.apply_to(summary.materials_ready),
        summary.not_viable,
        yellow.apply_to(summary.retried),
        red.apply_to(summary.failed),
    );
    if summary.claim_lost > 0 || summary.released > 0 || summary.store_errors > 0 {
        println!(
            "       {} claims lost, {} released, {} store errors",
            summary.claim_lost, summary.released, summary.store_errors
        );
    }
}

/// Status line plus artifacts for one item.
pub fn print_item(label: &str, item: &WorkItem) {
    let style = match item.status {
        ApplicationStatus::MaterialsReady => Style::new().green().bold(),
        ApplicationStatus::NotViable => Style::new().yellow().bold(),
        ApplicationStatus::Failed => Style::new().red().bold(),
        _ => Style::new().cyan(),
    };
    println!();
    println!(
        "{}",
        style.apply_to(format!("─── {label}: {} ───", item.status))
    );
    if let Some(artifacts) = &item.artifacts {
        let analysis = artifacts.analysis();
        println!("match score: {}", analysis.match_score);
        println!("reasoning: {}", analysis.reasoning);
        if let Some(document) = artifacts.document() {
            println!();
            println!("{}", document.text);
        }
    }
    if let Some(error) = &item.meta.last_error {
        println!("last error: {error}");
    }
    if !item.status.is_terminal() {
        println!(
            "{}",
            Style::new().dim().apply_to("not finished; the next cycle picks it up again")
        );
    }
}
