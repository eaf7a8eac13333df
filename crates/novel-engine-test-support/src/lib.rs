//! Shared test doubles and utilities for the novel engine.

mod clock;
mod handler;
mod queue;
mod store;

pub use clock::{FixedClock, SteppingClock};
pub use handler::ScriptedHandler;
pub use queue::{FailingTaskQueue, InMemoryTaskQueue};
pub use store::InMemoryWorkStore;
