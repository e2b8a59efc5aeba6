//! Execution context for one stage of a run
//!
//! Contains all state a stage needs while it executes:
//! - Run identity and the per-run variables threaded into every step
//! - The stage's private workspace
//! - The stage's redactor
//! - The run's log buffer

use sluice_core::domain::log::{LogEntry, LogLevel};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

use crate::redact::Redactor;
use crate::service::LogBufferService;

/// Output lines longer than this are cut, after redaction
pub const MAX_LINE_LENGTH: usize = 8192;

pub struct StageContext {
    pub run_id: Uuid,
    pub stage: String,
    pub workspace: PathBuf,

    /// Run-scoped environment (`SLUICE_RUN_ID`, `SLUICE_BRANCH`, configured
    /// variables, ...) added to every step of the stage
    pub variables: BTreeMap<String, String>,

    redactor: Redactor,
    logs: Arc<dyn LogBufferService>,
}

impl StageContext {
    pub fn new(
        run_id: Uuid,
        stage: impl Into<String>,
        workspace: PathBuf,
        variables: BTreeMap<String, String>,
        logs: Arc<dyn LogBufferService>,
    ) -> Self {
        Self {
            run_id,
            stage: stage.into(),
            workspace,
            variables,
            redactor: Redactor::new(),
            logs,
        }
    }

    pub fn redactor(&self) -> &Redactor {
        &self.redactor
    }

    /// Redacts `message` and adds it to the run's log buffer
    pub fn log(&self, level: LogLevel, step: Option<&str>, message: &str) {
        let mut entry =
            LogEntry::new(level, self.redactor.redact(message)).for_stage(self.stage.clone());
        if let Some(step) = step {
            entry = entry.for_step(step);
        }
        self.logs.add_entry(entry);
    }

    pub fn log_debug(&self, message: &str) {
        self.log(LogLevel::Debug, None, message);
    }

    pub fn log_info(&self, message: &str) {
        self.log(LogLevel::Info, None, message);
    }

    pub fn log_warning(&self, message: &str) {
        self.log(LogLevel::Warning, None, message);
    }

    pub fn log_error(&self, message: &str) {
        self.log(LogLevel::Error, None, message);
    }

    /// Records captured command output, one entry per line
    ///
    /// The whole text is redacted before it is split, so a secret spanning
    /// several lines is masked as a unit. Long lines are cut only after that.
    /// Returns the number of entries written.
    pub fn log_output(&self, step: &str, level: LogLevel, output: &str) -> usize {
        if output.is_empty() {
            return 0;
        }

        let redacted = self.redactor.redact(output);
        let mut count = 0;
        for line in redacted.lines() {
            self.logs.add_entry(
                LogEntry::new(level, truncate_line(line))
                    .for_stage(self.stage.clone())
                    .for_step(step),
            );
            count += 1;
        }
        count
    }
}

fn truncate_line(line: &str) -> String {
    if line.len() <= MAX_LINE_LENGTH {
        return line.to_string();
    }
    let mut cut = MAX_LINE_LENGTH;
    while !line.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}... [truncated]", &line[..cut])
}
