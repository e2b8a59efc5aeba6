//! Sluice Core
//!
//! Core types and abstractions for the Sluice CI/CD orchestrator.
//!
//! This crate contains:
//! - Domain types: Core business entities (PipelineDefinition, Run, etc.)
//! - DTOs: Data transfer objects for the orchestrator HTTP API
//! - Errors: The failure taxonomy shared by the runner and the orchestrator

pub mod domain;
pub mod dto;
pub mod error;
