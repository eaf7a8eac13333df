//! Novel Engine Core: shared records and collaborator contracts.
//!
//! This crate defines the record types, typed task payloads and the traits
//! the orchestration engine uses to reach its collaborators (record store,
//! task queue, step handlers). It contains no infrastructure code.

pub mod clock;
pub mod error;
pub mod handler;
pub mod payload;
pub mod queue;
pub mod records;
pub mod repository;
pub mod step;
