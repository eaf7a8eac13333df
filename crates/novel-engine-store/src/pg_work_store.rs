//! `PostgreSQL` implementation of the `SceneCatalog` and `WorkStore` traits.
//!
//! Version and iteration numbers are allocated while holding a row lock on
//! the owning scene, and the unique constraints on `(scene_id, version)` and
//! `(scene_id, iteration_no)` back that up. Composite writes run in one
//! transaction each.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::debug;
use uuid::Uuid;

use novel_engine_core::error::DomainError;
use novel_engine_core::payload::{ExtractedFact, TaskInput, TaskOutput};
use novel_engine_core::records::{
    CheckRun, Draft, ElementKind, Fact, Iteration, IterationStatus, Project, Scene,
    StoryConstraint, StoryElement, StyleBible, Task, TaskStatus,
};
use novel_engine_core::repository::{
    Advance, ClaimOutcome, ElementPatch, NewCheckRun, NewConstraint, NewElement, NewProject,
    NewScene, SceneCatalog, WorkStore,
};
use novel_engine_core::step::StepKind;

use crate::rows::{
    CheckRunRow, ConstraintRow, DRAFT_COLUMNS, DraftRow, ELEMENT_COLUMNS, ElementRow, FactRow,
    IterationRow, ProjectRow, SceneRow, StyleBibleRow, TASK_COLUMNS, TaskRow,
    TaskWithIterationRow,
};
use crate::{db_error, is_unique_violation};

/// PostgreSQL-backed record store.
#[derive(Debug, Clone)]
pub struct PgWorkStore {
    pool: PgPool,
}

impl PgWorkStore {
    /// Creates a new `PgWorkStore`.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, DomainError> {
        self.pool.begin().await.map_err(db_error("begin transaction"))
    }
}

async fn lock_scene(
    tx: &mut Transaction<'static, Postgres>,
    scene_id: Uuid,
) -> Result<(), DomainError> {
    let locked: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM scene WHERE id = $1 FOR UPDATE")
        .bind(scene_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(db_error("lock scene"))?;
    match locked {
        Some(_) => Ok(()),
        None => Err(DomainError::not_found("scene", scene_id)),
    }
}

async fn project_exists(pool: &PgPool, project_id: Uuid) -> Result<bool, DomainError> {
    let found: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM project WHERE id = $1")
        .bind(project_id)
        .fetch_optional(pool)
        .await
        .map_err(db_error("look up project"))?;
    Ok(found.is_some())
}

async fn insert_task(
    tx: &mut Transaction<'static, Postgres>,
    iteration_id: Uuid,
    step: StepKind,
    input: &TaskInput,
    now: DateTime<Utc>,
) -> Result<Task, DomainError> {
    let row: TaskRow = sqlx::query_as(&format!(
        "INSERT INTO task (id, iteration_id, step, status, input, attempts, created_at, updated_at)
         VALUES ($1, $2, $3, 'pending', $4, 0, $5, $5)
         RETURNING {TASK_COLUMNS}"
    ))
    .bind(Uuid::now_v7())
    .bind(iteration_id)
    .bind(step.as_str())
    .bind(Json(input))
    .bind(now)
    .fetch_one(&mut **tx)
    .await
    .map_err(db_error("insert task"))?;
    row.try_into()
}

#[async_trait]
impl SceneCatalog for PgWorkStore {
    async fn create_project(&self, project: NewProject) -> Result<Project, DomainError> {
        let row: ProjectRow = sqlx::query_as(
            "INSERT INTO project (id, name, description) VALUES ($1, $2, $3)
             RETURNING id, name, description, created_at",
        )
        .bind(Uuid::new_v4())
        .bind(&project.name)
        .bind(&project.description)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("insert project"))?;
        Ok(row.into())
    }

    async fn get_project(&self, project_id: Uuid) -> Result<Option<Project>, DomainError> {
        let row: Option<ProjectRow> = sqlx::query_as(
            "SELECT id, name, description, created_at FROM project WHERE id = $1",
        )
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("load project"))?;
        Ok(row.map(Into::into))
    }

    async fn list_projects(&self) -> Result<Vec<Project>, DomainError> {
        let rows: Vec<ProjectRow> = sqlx::query_as(
            "SELECT id, name, description, created_at FROM project ORDER BY created_at, id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("list projects"))?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn create_scene(&self, scene: NewScene) -> Result<Scene, DomainError> {
        if !project_exists(&self.pool, scene.project_id).await? {
            return Err(DomainError::not_found("project", scene.project_id));
        }
        let row: SceneRow = sqlx::query_as(
            "INSERT INTO scene (id, project_id, chapter_no, scene_no, card)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING id, project_id, chapter_no, scene_no, card, created_at",
        )
        .bind(Uuid::new_v4())
        .bind(scene.project_id)
        .bind(scene.chapter_no)
        .bind(scene.scene_no)
        .bind(&scene.card)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                DomainError::Conflict(format!(
                    "scene {}.{} already exists",
                    scene.chapter_no, scene.scene_no
                ))
            } else {
                db_error("insert scene")(err)
            }
        })?;
        Ok(row.into())
    }

    async fn get_scene(&self, scene_id: Uuid) -> Result<Option<Scene>, DomainError> {
        let row: Option<SceneRow> = sqlx::query_as(
            "SELECT id, project_id, chapter_no, scene_no, card, created_at
             FROM scene WHERE id = $1",
        )
        .bind(scene_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("load scene"))?;
        Ok(row.map(Into::into))
    }

    async fn list_scenes(&self, project_id: Uuid) -> Result<Vec<Scene>, DomainError> {
        let rows: Vec<SceneRow> = sqlx::query_as(
            "SELECT id, project_id, chapter_no, scene_no, card, created_at
             FROM scene WHERE project_id = $1
             ORDER BY chapter_no, scene_no",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("list scenes"))?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn add_style_bible(
        &self,
        project_id: Uuid,
        content: serde_json::Value,
    ) -> Result<StyleBible, DomainError> {
        let mut tx = self.begin().await?;
        let locked: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM project WHERE id = $1 FOR UPDATE")
                .bind(project_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_error("lock project"))?;
        if locked.is_none() {
            return Err(DomainError::not_found("project", project_id));
        }
        let row: StyleBibleRow = sqlx::query_as(
            "INSERT INTO style_bible (id, project_id, version, content)
             SELECT $1, $2, COALESCE(MAX(version), 0) + 1, $3
             FROM style_bible WHERE project_id = $2
             RETURNING id, project_id, version, content, created_at",
        )
        .bind(Uuid::new_v4())
        .bind(project_id)
        .bind(&content)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error("insert style bible"))?;
        tx.commit().await.map_err(db_error("commit style bible"))?;
        Ok(row.into())
    }

    async fn latest_style_bible(
        &self,
        project_id: Uuid,
    ) -> Result<Option<StyleBible>, DomainError> {
        let row: Option<StyleBibleRow> = sqlx::query_as(
            "SELECT id, project_id, version, content, created_at
             FROM style_bible WHERE project_id = $1
             ORDER BY version DESC LIMIT 1",
        )
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("load style bible"))?;
        Ok(row.map(Into::into))
    }

    async fn add_constraint(
        &self,
        constraint: NewConstraint,
    ) -> Result<StoryConstraint, DomainError> {
        if !project_exists(&self.pool, constraint.project_id).await? {
            return Err(DomainError::not_found("project", constraint.project_id));
        }
        let row: ConstraintRow = sqlx::query_as(
            "INSERT INTO story_constraint (id, project_id, constraint_type, rule, severity)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING id, project_id, constraint_type, rule, severity, created_at",
        )
        .bind(Uuid::new_v4())
        .bind(constraint.project_id)
        .bind(&constraint.constraint_type)
        .bind(&constraint.rule)
        .bind(constraint.severity.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("insert constraint"))?;
        row.try_into()
    }

    async fn constraints_for_project(
        &self,
        project_id: Uuid,
    ) -> Result<Vec<StoryConstraint>, DomainError> {
        let rows: Vec<ConstraintRow> = sqlx::query_as(
            "SELECT id, project_id, constraint_type, rule, severity, created_at
             FROM story_constraint WHERE project_id = $1
             ORDER BY created_at, id",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("load constraints"))?;
        rows.into_iter().map(StoryConstraint::try_from).collect()
    }

    async fn create_element(&self, element: NewElement) -> Result<StoryElement, DomainError> {
        if !project_exists(&self.pool, element.project_id).await? {
            return Err(DomainError::not_found("project", element.project_id));
        }
        let row: ElementRow = sqlx::query_as(&format!(
            "INSERT INTO story_element (id, project_id, kind, name, data)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING {ELEMENT_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(element.project_id)
        .bind(element.kind.as_str())
        .bind(&element.name)
        .bind(&element.data)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("insert story element"))?;
        row.try_into()
    }

    async fn get_element(&self, element_id: Uuid) -> Result<Option<StoryElement>, DomainError> {
        let row: Option<ElementRow> = sqlx::query_as(&format!(
            "SELECT {ELEMENT_COLUMNS} FROM story_element WHERE id = $1"
        ))
        .bind(element_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("load story element"))?;
        row.map(StoryElement::try_from).transpose()
    }

    async fn list_elements(
        &self,
        project_id: Uuid,
        kind: ElementKind,
    ) -> Result<Vec<StoryElement>, DomainError> {
        let rows: Vec<ElementRow> = sqlx::query_as(&format!(
            "SELECT {ELEMENT_COLUMNS} FROM story_element
             WHERE project_id = $1 AND kind = $2
             ORDER BY created_at, id"
        ))
        .bind(project_id)
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("list story elements"))?;
        rows.into_iter().map(StoryElement::try_from).collect()
    }

    async fn update_element(
        &self,
        element_id: Uuid,
        patch: ElementPatch,
    ) -> Result<Option<StoryElement>, DomainError> {
        let row: Option<ElementRow> = sqlx::query_as(&format!(
            "UPDATE story_element
             SET name = COALESCE($2, name), data = COALESCE($3, data), updated_at = NOW()
             WHERE id = $1
             RETURNING {ELEMENT_COLUMNS}"
        ))
        .bind(element_id)
        .bind(patch.name)
        .bind(patch.data)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("update story element"))?;
        row.map(StoryElement::try_from).transpose()
    }

    async fn delete_element(&self, element_id: Uuid) -> Result<bool, DomainError> {
        let deleted = sqlx::query("DELETE FROM story_element WHERE id = $1")
            .bind(element_id)
            .execute(&self.pool)
            .await
            .map_err(db_error("delete story element"))?;
        Ok(deleted.rows_affected() > 0)
    }
}

#[async_trait]
impl WorkStore for PgWorkStore {
    async fn create_draft(&self, scene_id: Uuid, text: &str) -> Result<Draft, DomainError> {
        let mut tx = self.begin().await?;
        lock_scene(&mut tx, scene_id).await?;
        let row: DraftRow = sqlx::query_as(&format!(
            "INSERT INTO draft (id, scene_id, version, text)
             SELECT $1, $2, COALESCE(MAX(version), 0) + 1, $3
             FROM draft WHERE scene_id = $2
             RETURNING {DRAFT_COLUMNS}"
        ))
        .bind(Uuid::now_v7())
        .bind(scene_id)
        .bind(text)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error("insert draft"))?;
        tx.commit().await.map_err(db_error("commit draft"))?;
        let draft = Draft::from(row);
        debug!(draft_id = %draft.id, %scene_id, version = draft.version, "draft appended");
        Ok(draft)
    }

    async fn get_draft(&self, draft_id: Uuid) -> Result<Option<Draft>, DomainError> {
        let row: Option<DraftRow> =
            sqlx::query_as(&format!("SELECT {DRAFT_COLUMNS} FROM draft WHERE id = $1"))
                .bind(draft_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_error("load draft"))?;
        Ok(row.map(Into::into))
    }

    async fn list_drafts(&self, scene_id: Uuid) -> Result<Vec<Draft>, DomainError> {
        let rows: Vec<DraftRow> = sqlx::query_as(&format!(
            "SELECT {DRAFT_COLUMNS} FROM draft WHERE scene_id = $1 ORDER BY version DESC"
        ))
        .bind(scene_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("list drafts"))?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn max_draft_version(&self, scene_id: Uuid) -> Result<Option<i32>, DomainError> {
        let (max,): (Option<i32>,) =
            sqlx::query_as("SELECT MAX(version) FROM draft WHERE scene_id = $1")
                .bind(scene_id)
                .fetch_one(&self.pool)
                .await
                .map_err(db_error("max draft version"))?;
        Ok(max)
    }

    async fn record_facts(
        &self,
        draft_id: Uuid,
        facts: &[ExtractedFact],
    ) -> Result<Vec<Fact>, DomainError> {
        if self.get_draft(draft_id).await?.is_none() {
            return Err(DomainError::not_found("draft", draft_id));
        }
        let mut tx = self.begin().await?;
        let mut stored = Vec::with_capacity(facts.len());
        for fact in facts {
            let row: FactRow = sqlx::query_as(
                "INSERT INTO fact (id, source_draft_id, fact_type, subject_type, subject_id,
                                   predicate, object, confidence)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                 RETURNING id, source_draft_id, fact_type, subject_type, subject_id,
                           predicate, object, confidence, created_at",
            )
            .bind(Uuid::new_v4())
            .bind(draft_id)
            .bind(&fact.fact_type)
            .bind(&fact.subject_type)
            .bind(fact.subject_id)
            .bind(&fact.predicate)
            .bind(&fact.object)
            .bind(fact.confidence)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_error("insert fact"))?;
            stored.push(row.into());
        }
        tx.commit().await.map_err(db_error("commit facts"))?;
        Ok(stored)
    }

    async fn facts_for_draft(&self, draft_id: Uuid) -> Result<Vec<Fact>, DomainError> {
        let rows: Vec<FactRow> = sqlx::query_as(
            "SELECT id, source_draft_id, fact_type, subject_type, subject_id,
                    predicate, object, confidence, created_at
             FROM fact WHERE source_draft_id = $1
             ORDER BY created_at, id",
        )
        .bind(draft_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("load facts"))?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn record_check_run(&self, run: NewCheckRun) -> Result<CheckRun, DomainError> {
        let row: CheckRunRow = sqlx::query_as(
            "INSERT INTO check_run (id, iteration_id, draft_id, check_kind, passed, findings)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING id, iteration_id, draft_id, check_kind, passed, findings, created_at",
        )
        .bind(Uuid::now_v7())
        .bind(run.iteration_id)
        .bind(run.draft_id)
        .bind(&run.check_kind)
        .bind(run.passed)
        .bind(Json(&run.findings))
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("insert check run"))?;
        Ok(row.into())
    }

    async fn check_runs_for_iteration(
        &self,
        iteration_id: Uuid,
    ) -> Result<Vec<CheckRun>, DomainError> {
        let rows: Vec<CheckRunRow> = sqlx::query_as(
            "SELECT id, iteration_id, draft_id, check_kind, passed, findings, created_at
             FROM check_run WHERE iteration_id = $1
             ORDER BY created_at, id",
        )
        .bind(iteration_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("load check runs"))?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn begin_iteration(
        &self,
        scene_id: Uuid,
        first_input: &TaskInput,
        now: DateTime<Utc>,
    ) -> Result<(Iteration, Task), DomainError> {
        let mut tx = self.begin().await?;
        lock_scene(&mut tx, scene_id).await?;

        let iteration_id = Uuid::now_v7();
        sqlx::query(
            "INSERT INTO iteration (id, scene_id, iteration_no, status, created_at, updated_at)
             SELECT $1, $2, COALESCE(MAX(iteration_no), 0) + 1, 'pending', $3, $3
             FROM iteration WHERE scene_id = $2",
        )
        .bind(iteration_id)
        .bind(scene_id)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(db_error("insert iteration"))?;

        let task = insert_task(&mut tx, iteration_id, StepKind::Plan, first_input, now).await?;

        let row: IterationRow = sqlx::query_as(
            "UPDATE iteration SET status = 'running', updated_at = $2 WHERE id = $1
             RETURNING id, scene_id, iteration_no, status, created_at, updated_at",
        )
        .bind(iteration_id)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error("start iteration"))?;

        tx.commit().await.map_err(db_error("commit iteration"))?;
        Ok((row.try_into()?, task))
    }

    async fn get_iteration(&self, iteration_id: Uuid) -> Result<Option<Iteration>, DomainError> {
        let row: Option<IterationRow> = sqlx::query_as(
            "SELECT id, scene_id, iteration_no, status, created_at, updated_at
             FROM iteration WHERE id = $1",
        )
        .bind(iteration_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("load iteration"))?;
        row.map(Iteration::try_from).transpose()
    }

    async fn abandon_iteration(
        &self,
        iteration_id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        let mut tx = self.begin().await?;
        let updated = sqlx::query(
            "UPDATE iteration SET status = 'failed', updated_at = $2
             WHERE id = $1 AND status IN ('pending', 'running')",
        )
        .bind(iteration_id)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(db_error("fail iteration"))?;

        if updated.rows_affected() == 0 {
            return match self.get_iteration(iteration_id).await? {
                Some(_) => Ok(()),
                None => Err(DomainError::not_found("iteration", iteration_id)),
            };
        }

        sqlx::query(
            "UPDATE task SET status = 'failed', output = $2, updated_at = $3
             WHERE iteration_id = $1 AND status IN ('pending', 'running')",
        )
        .bind(iteration_id)
        .bind(Json(TaskOutput::failure(reason)))
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(db_error("fail open tasks"))?;

        tx.commit().await.map_err(db_error("commit abandon"))?;
        Ok(())
    }

    async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>, DomainError> {
        let row: Option<TaskRow> =
            sqlx::query_as(&format!("SELECT {TASK_COLUMNS} FROM task WHERE id = $1"))
                .bind(task_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_error("load task"))?;
        row.map(Task::try_from).transpose()
    }

    async fn tasks_for_iteration(&self, iteration_id: Uuid) -> Result<Vec<Task>, DomainError> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            "SELECT {TASK_COLUMNS} FROM task WHERE iteration_id = $1 ORDER BY created_at, id"
        ))
        .bind(iteration_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("list tasks"))?;
        rows.into_iter().map(Task::try_from).collect()
    }

    async fn claim_task(
        &self,
        task_id: Uuid,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<ClaimOutcome, DomainError> {
        let claimed: Option<TaskRow> = sqlx::query_as(
            "UPDATE task t
             SET status = 'running', locked_at = $2, attempts = t.attempts + 1, updated_at = $2
             FROM iteration i
             WHERE t.id = $1
               AND i.id = t.iteration_id
               AND i.status = 'running'
               AND (t.status IN ('pending', 'failed')
                    OR (t.status = 'running' AND (t.locked_at IS NULL OR t.locked_at < $3)))
             RETURNING t.id, t.iteration_id, t.step, t.status, t.input, t.output,
                       t.attempts, t.locked_at, t.created_at, t.updated_at",
        )
        .bind(task_id)
        .bind(now)
        .bind(stale_before)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("claim task"))?;

        if let Some(row) = claimed {
            return Ok(ClaimOutcome::Claimed(row.try_into()?));
        }

        let current: Option<TaskWithIterationRow> = sqlx::query_as(
            "SELECT t.id, t.iteration_id, t.step, t.status, t.input, t.output,
                    t.attempts, t.locked_at, t.created_at, t.updated_at,
                    i.status AS iteration_status
             FROM task t JOIN iteration i ON i.id = t.iteration_id
             WHERE t.id = $1",
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("load task"))?;
        let Some(current) = current else {
            return Err(DomainError::not_found("task", task_id));
        };

        let iteration_status: IterationStatus = current.iteration_status.parse()?;
        let task: Task = current.task.try_into()?;
        Ok(if task.status == TaskStatus::Completed {
            ClaimOutcome::AlreadyCompleted(task)
        } else if iteration_status != IterationStatus::Running {
            ClaimOutcome::IterationClosed(task)
        } else {
            ClaimOutcome::InFlight(task)
        })
    }

    async fn complete_task(
        &self,
        task_id: Uuid,
        locked_at: DateTime<Utc>,
        output: &TaskOutput,
        advance: &Advance,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>, DomainError> {
        let mut tx = self.begin().await?;
        let completed: Option<(Uuid,)> = sqlx::query_as(
            "UPDATE task SET status = 'completed', output = $2, updated_at = $3
             WHERE id = $1 AND status = 'running' AND locked_at = $4
             RETURNING iteration_id",
        )
        .bind(task_id)
        .bind(Json(output))
        .bind(now)
        .bind(locked_at)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error("complete task"))?;

        let Some((iteration_id,)) = completed else {
            return match self.get_task(task_id).await? {
                Some(task) if task.status == TaskStatus::Running => Err(DomainError::Conflict(
                    format!("task {task_id} was reclaimed by another worker"),
                )),
                Some(task) => Err(DomainError::Conflict(format!(
                    "task {task_id} is {} and cannot complete",
                    task.status
                ))),
                None => Err(DomainError::not_found("task", task_id)),
            };
        };

        let next = match advance {
            Advance::Next { step, input } => {
                let next = insert_task(&mut tx, iteration_id, *step, input, now).await?;
                sqlx::query("UPDATE iteration SET updated_at = $2 WHERE id = $1")
                    .bind(iteration_id)
                    .bind(now)
                    .execute(&mut *tx)
                    .await
                    .map_err(db_error("touch iteration"))?;
                Some(next)
            }
            Advance::Finish(status) => {
                sqlx::query(
                    "UPDATE iteration SET status = $2, updated_at = $3
                     WHERE id = $1 AND status = 'running'",
                )
                .bind(iteration_id)
                .bind(status.as_str())
                .bind(now)
                .execute(&mut *tx)
                .await
                .map_err(db_error("finish iteration"))?;
                None
            }
        };

        tx.commit().await.map_err(db_error("commit task completion"))?;
        Ok(next)
    }

    async fn fail_task(
        &self,
        task_id: Uuid,
        output: &TaskOutput,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        let updated = sqlx::query(
            "UPDATE task SET status = 'failed', output = $2, updated_at = $3
             WHERE id = $1 AND status = 'running'",
        )
        .bind(task_id)
        .bind(Json(output))
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_error("fail task"))?;
        if updated.rows_affected() == 0 && self.get_task(task_id).await?.is_none() {
            return Err(DomainError::not_found("task", task_id));
        }
        Ok(())
    }

    async fn stalled_tasks(
        &self,
        created_before: DateTime<Utc>,
    ) -> Result<Vec<Task>, DomainError> {
        let rows: Vec<TaskRow> = sqlx::query_as(
            "SELECT t.id, t.iteration_id, t.step, t.status, t.input, t.output,
                    t.attempts, t.locked_at, t.created_at, t.updated_at
             FROM task t JOIN iteration i ON i.id = t.iteration_id
             WHERE t.status = 'pending' AND t.attempts = 0 AND t.created_at < $1
               AND i.status = 'running'
             ORDER BY t.created_at, t.id",
        )
        .bind(created_before)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("list stalled tasks"))?;
        rows.into_iter().map(Task::try_from).collect()
    }

    async fn orphaned_tasks(
        &self,
        locked_before: DateTime<Utc>,
    ) -> Result<Vec<Task>, DomainError> {
        let rows: Vec<TaskRow> = sqlx::query_as(
            "SELECT t.id, t.iteration_id, t.step, t.status, t.input, t.output,
                    t.attempts, t.locked_at, t.created_at, t.updated_at
             FROM task t JOIN iteration i ON i.id = t.iteration_id
             WHERE t.status = 'running' AND (t.locked_at IS NULL OR t.locked_at < $1)
               AND i.status = 'running'
             ORDER BY t.locked_at, t.id",
        )
        .bind(locked_before)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("list orphaned tasks"))?;
        rows.into_iter().map(Task::try_from).collect()
    }
}
