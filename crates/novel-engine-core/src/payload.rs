//! Typed task payloads.
//!
//! Every task carries a [`TaskInput`] and, once it has run, a [`TaskOutput`].
//! Only the iteration-scoped fields and the [`CarryOver`] whitelist travel
//! from one task's output into the next task's input; anything else a handler
//! reports stays on the task that produced it.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;
use crate::records::Finding;
use crate::step::StepKind;

/// One beat of a scene plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Beat {
    pub order: u32,
    pub description: String,
}

/// Outline produced by the PLAN step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenePlan {
    pub beats: Vec<Beat>,
    pub tone: String,
    pub pacing: String,
    pub word_target: u32,
}

/// A fact as reported by extraction. `id` is set once the fact is stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedFact {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    pub fact_type: String,
    pub subject_type: String,
    #[serde(default)]
    pub subject_id: Option<Uuid>,
    pub predicate: String,
    pub object: serde_json::Value,
    pub confidence: f64,
}

/// Input of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInput {
    pub scene_id: Uuid,
    pub max_attempts: u32,
    /// Number of REVISE transitions taken so far in this iteration.
    pub current_attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub draft_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<ScenePlan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub facts: Option<Vec<ExtractedFact>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub findings: Option<Vec<Finding>>,
}

impl TaskInput {
    /// Input of the first (PLAN) task of an iteration.
    #[must_use]
    pub fn initial(scene_id: Uuid, max_attempts: u32, starting_draft_id: Option<Uuid>) -> Self {
        Self {
            scene_id,
            max_attempts,
            current_attempt: 0,
            draft_id: starting_draft_id,
            plan: None,
            facts: None,
            findings: None,
        }
    }

    /// Builds the next task's input: the iteration-scoped fields of `self`
    /// plus whatever the completed task carried over.
    #[must_use]
    pub fn carrying(&self, carry: CarryOver) -> Self {
        Self {
            scene_id: self.scene_id,
            max_attempts: self.max_attempts,
            current_attempt: self.current_attempt,
            draft_id: carry.draft_id,
            plan: carry.plan,
            facts: carry.facts,
            findings: carry.findings,
        }
    }

    /// The draft this task operates on.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::InvalidArgument` if the input has no draft.
    pub fn require_draft(&self) -> Result<Uuid, DomainError> {
        self.draft_id
            .ok_or_else(|| DomainError::InvalidArgument("task input has no draft_id".into()))
    }
}

/// The whitelisted subset of a task output that flows into the next input.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CarryOver {
    pub draft_id: Option<Uuid>,
    pub plan: Option<ScenePlan>,
    pub facts: Option<Vec<ExtractedFact>>,
    pub findings: Option<Vec<Finding>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanOutput {
    pub plan: ScenePlan,
    /// Draft the iteration was started from, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_draft_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DraftOutput {
    pub draft_id: Uuid,
    pub version: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractOutput {
    pub draft_id: Uuid,
    pub facts: Vec<ExtractedFact>,
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckOutput {
    pub draft_id: Uuid,
    pub all_passed: bool,
    pub findings: Vec<Finding>,
    pub check_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviseOutput {
    pub draft_id: Uuid,
    pub version: i32,
    pub previous_draft_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitOutput {
    pub draft_id: Uuid,
    pub committed: bool,
}

/// Recorded in place of an output when a handler fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureOutput {
    pub error: String,
}

/// Output of a task, one variant per step kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum TaskOutput {
    Plan(PlanOutput),
    Draft(DraftOutput),
    Extract(ExtractOutput),
    Check(CheckOutput),
    Revise(ReviseOutput),
    Commit(CommitOutput),
    Failure(FailureOutput),
}

impl TaskOutput {
    /// Output recorded for a failed task.
    #[must_use]
    pub fn failure(error: impl Into<String>) -> Self {
        Self::Failure(FailureOutput {
            error: error.into(),
        })
    }

    /// The step kind that produces this output; `None` for failures.
    #[must_use]
    pub fn step_kind(&self) -> Option<StepKind> {
        match self {
            Self::Plan(_) => Some(StepKind::Plan),
            Self::Draft(_) => Some(StepKind::Draft),
            Self::Extract(_) => Some(StepKind::Extract),
            Self::Check(_) => Some(StepKind::Check),
            Self::Revise(_) => Some(StepKind::Revise),
            Self::Commit(_) => Some(StepKind::Commit),
            Self::Failure(_) => None,
        }
    }

    /// Extracts the carry-over whitelist: draft reference, plan, facts and
    /// findings.
    #[must_use]
    pub fn carry_over(&self) -> CarryOver {
        match self {
            Self::Plan(out) => CarryOver {
                draft_id: out.base_draft_id,
                plan: Some(out.plan.clone()),
                ..CarryOver::default()
            },
            Self::Draft(out) => CarryOver {
                draft_id: Some(out.draft_id),
                ..CarryOver::default()
            },
            Self::Extract(out) => CarryOver {
                draft_id: Some(out.draft_id),
                facts: Some(out.facts.clone()),
                ..CarryOver::default()
            },
            Self::Check(out) => CarryOver {
                draft_id: Some(out.draft_id),
                findings: Some(out.findings.clone()),
                ..CarryOver::default()
            },
            Self::Revise(out) => CarryOver {
                draft_id: Some(out.draft_id),
                ..CarryOver::default()
            },
            Self::Commit(out) => CarryOver {
                draft_id: Some(out.draft_id),
                ..CarryOver::default()
            },
            Self::Failure(_) => CarryOver::default(),
        }
    }
}
