//! Novel Engine: iteration pipeline.
//!
//! Drives a scene through PLAN → DRAFT → EXTRACT → CHECK → (REVISE →
//! EXTRACT → CHECK)* → COMMIT. The lifecycle manager seeds an iteration, the
//! dispatcher executes one task per queue delivery, and the state machine
//! decides what follows. All state lives in the record store, so workers are
//! interchangeable.

pub mod application;
pub mod domain;
