//! Step handler abstraction.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::DomainError;
use crate::payload::{TaskInput, TaskOutput};
use crate::step::StepKind;

/// What a handler gets to see of the task it executes.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub task_id: Uuid,
    pub iteration_id: Uuid,
    pub step: StepKind,
    pub input: TaskInput,
}

/// A pluggable implementation of one pipeline step.
///
/// Handlers never touch task or iteration status; they read their input,
/// may write their own records (drafts, facts, check runs) and return an
/// output whose variant matches their step kind.
#[async_trait]
pub trait StepHandler: Send + Sync {
    /// The step kind this handler implements.
    fn step(&self) -> StepKind;

    /// Executes the step.
    async fn handle(&self, ctx: &StepContext) -> Result<TaskOutput, DomainError>;
}
