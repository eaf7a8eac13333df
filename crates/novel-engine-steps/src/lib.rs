//! Novel engine: step implementations.
//!
//! Stub handlers for the six pipeline steps. Generation is deterministic
//! (seeded by a SHA-256 digest of the text) so runs are reproducible without
//! a language model; the continuity and style checks are real rule sets
//! driven by project constraints and the latest style bible.

pub mod application;
pub mod domain;
