//! Service Module
//!
//! Business logic layer for the orchestrator.
//! Services sit between the HTTP handlers and the pipeline runner.

pub mod hook;
pub mod run;

// Re-export for convenience
pub use hook as hook_service;
pub use run as run_service;
