//! Pure generation and checking logic.

pub mod checks;
pub mod generation;
pub mod prose;
