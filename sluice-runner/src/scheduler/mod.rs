//! Scheduler layer
//!
//! Turns push events into runs and drives each run's stages to completion.

pub mod orchestrator;
pub mod trigger;

pub use orchestrator::PipelineOrchestrator;
pub use trigger::TriggerListener;
