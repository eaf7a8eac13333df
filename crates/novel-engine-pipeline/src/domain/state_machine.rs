//! Successor computation for completed tasks.

use novel_engine_core::error::DomainError;
use novel_engine_core::payload::{TaskInput, TaskOutput};
use novel_engine_core::records::IterationStatus;
use novel_engine_core::repository::Advance;
use novel_engine_core::step::StepKind;

/// Decides what follows a completed task.
///
/// - PLAN, DRAFT, EXTRACT and REVISE follow [`StepKind::successor`].
/// - CHECK goes to COMMIT when every check passed; otherwise the iteration
///   fails once `current_attempt >= max_attempts`, else REVISE runs with
///   `current_attempt + 1`.
/// - COMMIT ends the iteration as passed.
///
/// The next input is `input` with its carry-over fields replaced by the
/// output's whitelist.
///
/// # Errors
///
/// Returns `DomainError::InvalidArgument` if `output` was not produced by a
/// handler for `step`.
pub fn next_advance(
    step: StepKind,
    input: &TaskInput,
    output: &TaskOutput,
) -> Result<Advance, DomainError> {
    if output.step_kind() != Some(step) {
        return Err(DomainError::InvalidArgument(format!(
            "{step} task produced an output for {}",
            output
                .step_kind()
                .map_or("a failure", |kind| kind.as_str())
        )));
    }

    let next_input = input.carrying(output.carry_over());

    match output {
        TaskOutput::Check(check) if check.all_passed => Ok(Advance::Next {
            step: StepKind::Commit,
            input: next_input,
        }),
        TaskOutput::Check(_) if input.current_attempt >= input.max_attempts => {
            Ok(Advance::Finish(IterationStatus::Failed))
        }
        TaskOutput::Check(_) => Ok(Advance::Next {
            step: StepKind::Revise,
            input: TaskInput {
                current_attempt: input.current_attempt + 1,
                ..next_input
            },
        }),
        TaskOutput::Commit(_) => Ok(Advance::Finish(IterationStatus::Passed)),
        _ => {
            let next = step.successor().ok_or_else(|| {
                DomainError::InvalidArgument(format!("{step} has no static successor"))
            })?;
            Ok(Advance::Next {
                step: next,
                input: next_input,
            })
        }
    }
}
