//! Row types and their conversion into domain records.

use chrono::{DateTime, Utc};
use novel_engine_core::error::DomainError;
use novel_engine_core::payload::{TaskInput, TaskOutput};
use novel_engine_core::records::{
    CheckRun, Draft, Fact, Finding, Iteration, Project, Scene, StoryConstraint, StoryElement,
    StyleBible, Task,
};
use sqlx::FromRow;
use sqlx::types::Json;
use uuid::Uuid;

#[derive(Debug, FromRow)]
pub(crate) struct ProjectRow {
    id: Uuid,
    name: String,
    description: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<ProjectRow> for Project {
    fn from(row: ProjectRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            description: row.description,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct SceneRow {
    id: Uuid,
    project_id: Uuid,
    chapter_no: i32,
    scene_no: i32,
    card: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl From<SceneRow> for Scene {
    fn from(row: SceneRow) -> Self {
        Self {
            id: row.id,
            project_id: row.project_id,
            chapter_no: row.chapter_no,
            scene_no: row.scene_no,
            card: row.card,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct StyleBibleRow {
    id: Uuid,
    project_id: Uuid,
    version: i32,
    content: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl From<StyleBibleRow> for StyleBible {
    fn from(row: StyleBibleRow) -> Self {
        Self {
            id: row.id,
            project_id: row.project_id,
            version: row.version,
            content: row.content,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct ConstraintRow {
    id: Uuid,
    project_id: Uuid,
    constraint_type: String,
    rule: serde_json::Value,
    severity: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<ConstraintRow> for StoryConstraint {
    type Error = DomainError;

    fn try_from(row: ConstraintRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            project_id: row.project_id,
            constraint_type: row.constraint_type,
            rule: row.rule,
            severity: row.severity.parse()?,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct ElementRow {
    id: Uuid,
    project_id: Uuid,
    kind: String,
    name: String,
    data: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ElementRow> for StoryElement {
    type Error = DomainError;

    fn try_from(row: ElementRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            project_id: row.project_id,
            kind: row.kind.parse()?,
            name: row.name,
            data: row.data,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct DraftRow {
    id: Uuid,
    scene_id: Uuid,
    version: i32,
    text: String,
    created_at: DateTime<Utc>,
}

impl From<DraftRow> for Draft {
    fn from(row: DraftRow) -> Self {
        Self {
            id: row.id,
            scene_id: row.scene_id,
            version: row.version,
            text: row.text,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct FactRow {
    id: Uuid,
    source_draft_id: Uuid,
    fact_type: String,
    subject_type: String,
    subject_id: Option<Uuid>,
    predicate: String,
    object: serde_json::Value,
    confidence: f64,
    created_at: DateTime<Utc>,
}

impl From<FactRow> for Fact {
    fn from(row: FactRow) -> Self {
        Self {
            id: row.id,
            source_draft_id: row.source_draft_id,
            fact_type: row.fact_type,
            subject_type: row.subject_type,
            subject_id: row.subject_id,
            predicate: row.predicate,
            object: row.object,
            confidence: row.confidence,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct CheckRunRow {
    id: Uuid,
    iteration_id: Uuid,
    draft_id: Uuid,
    check_kind: String,
    passed: bool,
    findings: Json<Vec<Finding>>,
    created_at: DateTime<Utc>,
}

impl From<CheckRunRow> for CheckRun {
    fn from(row: CheckRunRow) -> Self {
        Self {
            id: row.id,
            iteration_id: row.iteration_id,
            draft_id: row.draft_id,
            check_kind: row.check_kind,
            passed: row.passed,
            findings: row.findings.0,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct IterationRow {
    id: Uuid,
    scene_id: Uuid,
    iteration_no: i32,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<IterationRow> for Iteration {
    type Error = DomainError;

    fn try_from(row: IterationRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            scene_id: row.scene_id,
            iteration_no: row.iteration_no,
            status: row.status.parse()?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct TaskRow {
    id: Uuid,
    iteration_id: Uuid,
    step: String,
    status: String,
    input: Json<TaskInput>,
    output: Option<Json<TaskOutput>>,
    attempts: i32,
    locked_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<TaskRow> for Task {
    type Error = DomainError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            iteration_id: row.iteration_id,
            step: row.step.parse()?,
            status: row.status.parse()?,
            input: row.input.0,
            output: row.output.map(|json| json.0),
            attempts: row.attempts,
            locked_at: row.locked_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// A task row joined with its iteration's status, used to explain why a
/// conditional claim matched nothing.
#[derive(Debug, FromRow)]
pub(crate) struct TaskWithIterationRow {
    #[sqlx(flatten)]
    pub(crate) task: TaskRow,
    pub(crate) iteration_status: String,
}

pub(crate) const TASK_COLUMNS: &str =
    "id, iteration_id, step, status, input, output, attempts, locked_at, created_at, updated_at";

pub(crate) const ELEMENT_COLUMNS: &str =
    "id, project_id, kind, name, data, created_at, updated_at";

pub(crate) const DRAFT_COLUMNS: &str = "id, scene_id, version, text, created_at";
