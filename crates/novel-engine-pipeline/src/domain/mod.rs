//! Pure pipeline rules.

pub mod commands;
pub mod state_machine;
