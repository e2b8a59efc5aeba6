//! Data Transfer Objects for the orchestrator HTTP API
//!
//! DTOs are lightweight representations of domain entities optimized for
//! network transfer between the orchestrator, the client and the CLI.

pub mod health;
pub mod run;
pub mod trigger;
