//! Route modules by resource.

pub mod drafts;
pub mod elements;
pub mod health;
pub mod pipeline;
pub mod projects;
