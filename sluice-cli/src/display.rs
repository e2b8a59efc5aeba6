//! Terminal rendering of runs and logs

use colored::*;
use sluice_core::domain::log::{LogEntry, LogLevel};
use sluice_core::domain::run::{Run, RunStatus, StageResult, StageStatus, StepStatus};
use sluice_core::dto::run::RunSummary;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Print one line group per run in a listing
pub fn print_run_summary(run: &RunSummary) {
    println!("  {} Run {}", "▸".cyan(), run.id.to_string().dimmed());
    println!("    Pipeline: {}", run.pipeline);
    println!("    Status:   {}", colorize_run_status(run.status));
    println!("    Commit:   {}@{}", run.branch, run.commit_ref.dimmed());
    println!(
        "    Stages:   {}/{} succeeded",
        run.stages_succeeded, run.stages_total
    );
    println!(
        "    Created:  {}",
        run.created_at.format(TIME_FORMAT).to_string().dimmed()
    );
    println!();
}

/// Print a run with every stage result
///
/// Stages are listed in `order` when given, by name otherwise.
pub fn print_run_details(run: &Run, order: Option<&[&str]>) {
    println!("{}", "Run Details:".bold());
    println!("  ID:        {}", run.id.to_string().cyan());
    println!("  Pipeline:  {}", run.pipeline);
    println!("  Status:    {}", colorize_run_status(run.status));
    println!("  Branch:    {}", run.trigger.branch);
    println!("  Commit:    {}", run.trigger.commit_ref);
    println!("  Created:   {}", run.created_at.format(TIME_FORMAT));
    if let Some(started) = run.started_at {
        println!("  Started:   {}", started.format(TIME_FORMAT));
    }
    if let Some(finished) = run.finished_at {
        println!("  Finished:  {}", finished.format(TIME_FORMAT));
        if let Some(started) = run.started_at {
            let duration = finished.signed_duration_since(started);
            println!("  Duration:  {}s", duration.num_seconds());
        }
    }
    if run.cancel_requested {
        println!("  {}", "Cancellation was requested".yellow());
    }

    println!("\n{}", "Stages:".bold());
    let names: Vec<&str> = match order {
        Some(order) => order.to_vec(),
        None => run.stages.keys().map(String::as_str).collect(),
    };
    for name in names {
        if let Some(stage) = run.stages.get(name) {
            print_stage(name, stage);
        }
    }
}

fn print_stage(name: &str, stage: &StageResult) {
    let attempts = if stage.attempts > 1 {
        format!(" ({} attempts)", stage.attempts)
    } else {
        String::new()
    };
    println!(
        "  {} {} {}{}",
        stage_marker(stage.status),
        name.bold(),
        colorize_stage_status(stage.status),
        attempts.dimmed()
    );
    if stage.status != StageStatus::Succeeded {
        if let Some(reason) = &stage.reason {
            println!("      {}", reason.dimmed());
        }
    }
    for step in &stage.steps {
        let exit = step
            .exit_code
            .map(|code| format!("exit {}", code))
            .unwrap_or_else(|| "no exit code".to_string());
        let marker = match step.status {
            StepStatus::Succeeded => "✓".green(),
            StepStatus::Failed | StepStatus::TimedOut => "✗".red(),
            StepStatus::Cancelled => "-".dimmed(),
        };
        println!("      {} {} ({})", marker, step.name, exit.dimmed());
    }
}

/// Print a log entry with its stage/step attribution
pub fn print_log_entry(log: &LogEntry) {
    let level_str = log.level.to_string();
    let level_colored = match log.level {
        LogLevel::Debug => level_str.dimmed(),
        LogLevel::Info => level_str.cyan(),
        LogLevel::Warning => level_str.yellow(),
        LogLevel::Error => level_str.red(),
    };
    let source = match (&log.stage, &log.step) {
        (Some(stage), Some(step)) => format!("{}/{} ", stage, step),
        (Some(stage), None) => format!("{} ", stage),
        _ => String::new(),
    };

    println!(
        "{} [{}] {}{}",
        log.timestamp.format("%H:%M:%S").to_string().dimmed(),
        level_colored,
        source.magenta(),
        log.message
    );
}

pub fn colorize_run_status(status: RunStatus) -> ColoredString {
    let status_str = status.as_str();
    match status {
        RunStatus::Pending => status_str.yellow(),
        RunStatus::Running => status_str.cyan(),
        RunStatus::Succeeded => status_str.green(),
        RunStatus::Failed => status_str.red(),
        RunStatus::Cancelled => status_str.dimmed(),
    }
}

fn colorize_stage_status(status: StageStatus) -> ColoredString {
    let status_str = status.as_str();
    match status {
        StageStatus::Pending => status_str.yellow(),
        StageStatus::Running => status_str.cyan(),
        StageStatus::Succeeded => status_str.green(),
        StageStatus::Failed => status_str.red(),
        StageStatus::Skipped | StageStatus::Cancelled => status_str.dimmed(),
    }
}

fn stage_marker(status: StageStatus) -> ColoredString {
    match status {
        StageStatus::Succeeded => "✓".green(),
        StageStatus::Failed => "✗".red(),
        StageStatus::Running => "▸".cyan(),
        _ => "-".dimmed(),
    }
}
