//! Application services: lifecycle, dispatch, workers and queries.

pub mod dispatcher;
pub mod lifecycle;
pub mod query_handlers;
pub mod reconciler;
pub mod registry;
pub mod worker;
