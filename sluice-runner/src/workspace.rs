//! Stage workspaces
//!
//! Every stage of every run executes in its own directory,
//! `<base>/<run_id>/<stage>`, seeded from the configured source checkout.
//! Workspaces are never shared between stages: distinct stage names always
//! map to distinct directories.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

/// Creates and removes per-stage workspaces
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    base: PathBuf,
    source_dir: Option<PathBuf>,
    keep: bool,
}

impl WorkspaceManager {
    pub fn new(base: PathBuf) -> Self {
        Self {
            base,
            source_dir: None,
            keep: false,
        }
    }

    /// Copies `source` into each workspace before the stage starts
    pub fn with_source(mut self, source: Option<PathBuf>) -> Self {
        self.source_dir = source;
        self
    }

    pub fn keep_workspaces(mut self, keep: bool) -> Self {
        self.keep = keep;
        self
    }

    pub fn run_dir(&self, run_id: Uuid) -> PathBuf {
        self.base.join(run_id.to_string())
    }

    pub fn stage_dir(&self, run_id: Uuid, stage: &str) -> PathBuf {
        self.run_dir(run_id).join(dir_name(stage))
    }

    /// Creates a fresh workspace for `stage`, replacing any left by a previous attempt
    pub async fn prepare(&self, run_id: Uuid, stage: &str) -> Result<PathBuf> {
        let dir = self.stage_dir(run_id, stage);
        let source = self.source_dir.clone();
        let base = self.base.clone();

        let target = dir.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            if target.exists() {
                std::fs::remove_dir_all(&target).with_context(|| {
                    format!("Failed to clear workspace {}", target.display())
                })?;
            }
            std::fs::create_dir_all(&target)
                .with_context(|| format!("Failed to create workspace {}", target.display()))?;

            if let Some(source) = source {
                copy_tree(&source, &target, &base).with_context(|| {
                    format!(
                        "Failed to copy {} into workspace {}",
                        source.display(),
                        target.display()
                    )
                })?;
            }
            Ok(())
        })
        .await
        .context("Workspace preparation task failed")??;

        debug!("Prepared workspace {}", dir.display());
        Ok(dir)
    }

    /// Removes every workspace of a run unless configured to keep them
    pub async fn cleanup(&self, run_id: Uuid) {
        if self.keep {
            return;
        }

        let dir = self.run_dir(run_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => debug!("Removed workspaces in {}", dir.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove workspaces in {}: {}", dir.display(), e),
        }
    }
}

/// Encodes a stage name as a single path component
///
/// ASCII letters, digits and `-` are kept; every other byte (including `_`)
/// becomes `_XX` in hex, so the mapping is injective and never yields `.`,
/// `..` or a separator. The empty name maps to a lone `_`.
fn dir_name(stage: &str) -> String {
    if stage.is_empty() {
        return "_".to_string();
    }

    let mut name = String::with_capacity(stage.len());
    for byte in stage.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' {
            name.push(byte as char);
        } else {
            name.push_str(&format!("_{:02X}", byte));
        }
    }
    name
}

/// Recursive copy that never descends into `exclude` (the workspace base may
/// live inside the source checkout)
fn copy_tree(from: &Path, to: &Path, exclude: &Path) -> std::io::Result<()> {
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let path = entry.path();
        if path == exclude {
            continue;
        }

        let target = to.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            std::fs::create_dir_all(&target)?;
            copy_tree(&path, &target, exclude)?;
        } else if file_type.is_symlink() {
            copy_symlink(&path, &target)?;
        } else {
            std::fs::copy(&path, &target)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(from: &Path, to: &Path) -> std::io::Result<()> {
    let link = std::fs::read_link(from)?;
    std::os::unix::fs::symlink(link, to)
}

#[cfg(not(unix))]
fn copy_symlink(from: &Path, to: &Path) -> std::io::Result<()> {
    std::fs::copy(from, to).map(|_| ())
}
