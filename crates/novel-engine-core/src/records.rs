//! Persisted records of the scene catalog and the iteration pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;
use crate::payload::{TaskInput, TaskOutput};
use crate::step::StepKind;

/// Lifecycle status of an iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IterationStatus {
    /// Created, first task not yet handed to the queue.
    Pending,
    /// Tasks are being executed.
    Running,
    /// A draft was committed.
    Passed,
    /// Checks never passed within the attempt budget, or a step died.
    Failed,
}

impl IterationStatus {
    /// Stable storage name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Passed => "passed",
            Self::Failed => "failed",
        }
    }

    /// Whether no further transitions can happen.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Passed | Self::Failed)
    }
}

impl fmt::Display for IterationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IterationStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "passed" => Ok(Self::Passed),
            "failed" => Ok(Self::Failed),
            other => Err(DomainError::InvalidArgument(format!(
                "unknown iteration status: {other}"
            ))),
        }
    }
}

/// Execution status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting to be claimed by a worker.
    Pending,
    /// Claimed; the handler is executing.
    Running,
    /// Output persisted and the state machine advanced.
    Completed,
    /// The handler failed; the error is the task output.
    Failed,
}

impl TaskStatus {
    /// Stable storage name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(DomainError::InvalidArgument(format!(
                "unknown task status: {other}"
            ))),
        }
    }
}

/// Severity of a check finding. Only `Error` fails a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl Severity {
    /// Stable storage name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Info => "info",
        }
    }
}

impl FromStr for Severity {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "error" => Ok(Self::Error),
            "warning" => Ok(Self::Warning),
            "info" => Ok(Self::Info),
            other => Err(DomainError::InvalidArgument(format!(
                "unknown severity: {other}"
            ))),
        }
    }
}

/// A structured issue reported by a check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    /// Check-specific context (offending fact, constraint id, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl Finding {
    /// Creates a finding without extra details.
    #[must_use]
    pub fn new(severity: Severity, message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            suggestion: Some(suggestion.into()),
            details: None,
        }
    }

    /// Attaches check-specific context.
    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// A novel project; owns scenes, style bibles and constraints.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A scene: the unit of work iterations run against.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Scene {
    pub id: Uuid,
    pub project_id: Uuid,
    pub chapter_no: i32,
    pub scene_no: i32,
    /// Free-form scene card (title, tone, beats the author wants, ...).
    pub card: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// A versioned style guide for a project. The highest version is current.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StyleBible {
    pub id: Uuid,
    pub project_id: Uuid,
    pub version: i32,
    pub content: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// A project rule that drafts must satisfy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoryConstraint {
    pub id: Uuid,
    pub project_id: Uuid,
    /// e.g. `continuity`, `style`.
    pub constraint_type: String,
    pub rule: serde_json::Value,
    pub severity: Severity,
    pub created_at: DateTime<Utc>,
}

/// The kinds of named story elements a project catalogs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementKind {
    Character,
    Location,
}

impl ElementKind {
    /// Stable storage name, also the `subject_type` of facts about it.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Character => "character",
            Self::Location => "location",
        }
    }
}

impl fmt::Display for ElementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ElementKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "character" => Ok(Self::Character),
            "location" => Ok(Self::Location),
            other => Err(DomainError::InvalidArgument(format!(
                "unknown element kind: {other}"
            ))),
        }
    }
}

/// A character or location of a project. Unlike drafts these are edited in
/// place.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoryElement {
    pub id: Uuid,
    pub project_id: Uuid,
    pub kind: ElementKind,
    pub name: String,
    /// Free-form profile (traits, history, geography, ...).
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An immutable, versioned draft of a scene.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Draft {
    pub id: Uuid,
    pub scene_id: Uuid,
    pub version: i32,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

/// An immutable assertion extracted from a draft.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Fact {
    pub id: Uuid,
    pub source_draft_id: Uuid,
    pub fact_type: String,
    pub subject_type: String,
    pub subject_id: Option<Uuid>,
    pub predicate: String,
    pub object: serde_json::Value,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
}

/// The immutable outcome of one check kind over one draft.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckRun {
    pub id: Uuid,
    pub iteration_id: Uuid,
    pub draft_id: Uuid,
    pub check_kind: String,
    pub passed: bool,
    pub findings: Vec<Finding>,
    pub created_at: DateTime<Utc>,
}

/// One attempt cycle over a scene.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Iteration {
    pub id: Uuid,
    pub scene_id: Uuid,
    /// Monotonic per scene, starting at 1.
    pub iteration_no: i32,
    pub status: IterationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One step execution within an iteration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Task {
    pub id: Uuid,
    pub iteration_id: Uuid,
    pub step: StepKind,
    pub status: TaskStatus,
    pub input: TaskInput,
    pub output: Option<TaskOutput>,
    /// Delivery attempts (claims), not revision attempts.
    pub attempts: i32,
    pub locked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
