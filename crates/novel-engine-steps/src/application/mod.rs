//! Step handlers wired to the record store.

pub mod handlers;
