//! Service layer
//!
//! Stage execution, log buffering and run history. All services are
//! trait-based so the orchestrator can be driven by test doubles.

mod history;
mod log_buffer;
mod stage;

// Re-export traits
pub use history::RunHistory;
pub use log_buffer::LogBufferService;
pub use stage::StageService;

// Re-export implementations
pub use history::{HistoryError, InMemoryRunHistory};
pub use log_buffer::InMemoryLogBuffer;
pub use stage::StageRunner;
