//! Core domain types
//!
//! This module contains the core domain structures used across Sluice services.
//! These types represent the fundamental business entities and are shared between
//! the orchestrator service (for persistence) and the runner (for execution).

pub mod log;
pub mod pipeline;
pub mod run;
pub mod secret;
