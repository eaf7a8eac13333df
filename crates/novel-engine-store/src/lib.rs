//! Novel Engine: PostgreSQL persistence.
//!
//! [`pg_work_store::PgWorkStore`] implements both record store traits on one
//! pool; [`pg_task_queue::PgTaskQueue`] is a durable, at-least-once job queue
//! in the same database.

pub mod pg_task_queue;
pub mod pg_work_store;
mod rows;
pub mod schema;

use novel_engine_core::error::DomainError;

/// Maps a driver error to `DomainError::Infrastructure`, prefixed with what
/// was being attempted.
pub(crate) fn db_error(context: &'static str) -> impl FnOnce(sqlx::Error) -> DomainError {
    move |err| DomainError::Infrastructure(format!("{context}: {err}"))
}

/// Whether `err` is a unique-constraint violation.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| code == "23505")
}
