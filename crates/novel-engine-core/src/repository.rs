//! Record store abstractions.
//!
//! [`SceneCatalog`] covers the authoring records the pipeline reads (scenes,
//! style bibles, constraints, characters and locations). [`WorkStore`] covers the pipeline's own
//! records and exposes the composite, transactional writes the orchestration
//! engine relies on for crash safety.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DomainError;
use crate::payload::{ExtractedFact, TaskInput, TaskOutput};
use crate::records::{
    CheckRun, Draft, ElementKind, Fact, Finding, Iteration, IterationStatus, Project, Scene,
    Severity, StoryConstraint, StoryElement, StyleBible, Task,
};
use crate::step::StepKind;

/// Fields for a new project.
#[derive(Debug, Clone)]
pub struct NewProject {
    pub name: String,
    pub description: Option<String>,
}

/// Fields for a new scene.
#[derive(Debug, Clone)]
pub struct NewScene {
    pub project_id: Uuid,
    pub chapter_no: i32,
    pub scene_no: i32,
    pub card: serde_json::Value,
}

/// Fields for a new project constraint.
#[derive(Debug, Clone)]
pub struct NewConstraint {
    pub project_id: Uuid,
    pub constraint_type: String,
    pub rule: serde_json::Value,
    pub severity: Severity,
}

/// Fields for a new character or location.
#[derive(Debug, Clone)]
pub struct NewElement {
    pub project_id: Uuid,
    pub kind: ElementKind,
    pub name: String,
    pub data: serde_json::Value,
}

/// Partial update of a character or location; `None` leaves a field as is.
#[derive(Debug, Clone, Default)]
pub struct ElementPatch {
    pub name: Option<String>,
    pub data: Option<serde_json::Value>,
}

/// Fields for a new check run.
#[derive(Debug, Clone)]
pub struct NewCheckRun {
    pub iteration_id: Uuid,
    pub draft_id: Uuid,
    pub check_kind: String,
    pub passed: bool,
    pub findings: Vec<Finding>,
}

/// What happens to an iteration once a task completes.
#[derive(Debug, Clone, PartialEq)]
pub enum Advance {
    /// Create the successor task.
    Next {
        /// Step kind of the successor.
        step: StepKind,
        /// Input of the successor.
        input: TaskInput,
    },
    /// No successor; the iteration ends with this status.
    Finish(IterationStatus),
}

/// Result of trying to claim a task for execution.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// The caller owns the task; it is now running with a fresh lock.
    Claimed(Task),
    /// The task already completed (duplicate delivery).
    AlreadyCompleted(Task),
    /// Another worker holds a lock that has not gone stale.
    InFlight(Task),
    /// The owning iteration is no longer running.
    IterationClosed(Task),
}

/// Scenes and the project-level documents checks read.
#[async_trait]
pub trait SceneCatalog: Send + Sync {
    /// Creates a project.
    async fn create_project(&self, project: NewProject) -> Result<Project, DomainError>;

    /// Loads a project by id.
    async fn get_project(&self, project_id: Uuid) -> Result<Option<Project>, DomainError>;

    /// All projects, oldest first.
    async fn list_projects(&self) -> Result<Vec<Project>, DomainError>;

    /// Creates a scene. Fails with `NotFound` if the project does not exist.
    async fn create_scene(&self, scene: NewScene) -> Result<Scene, DomainError>;

    /// Loads a scene by id.
    async fn get_scene(&self, scene_id: Uuid) -> Result<Option<Scene>, DomainError>;

    /// Scenes of a project in chapter, then scene, order.
    async fn list_scenes(&self, project_id: Uuid) -> Result<Vec<Scene>, DomainError>;

    /// Appends a style bible version (max + 1) to a project.
    async fn add_style_bible(
        &self,
        project_id: Uuid,
        content: serde_json::Value,
    ) -> Result<StyleBible, DomainError>;

    /// The highest-versioned style bible of a project.
    async fn latest_style_bible(&self, project_id: Uuid)
    -> Result<Option<StyleBible>, DomainError>;

    /// Adds a constraint to a project.
    async fn add_constraint(
        &self,
        constraint: NewConstraint,
    ) -> Result<StoryConstraint, DomainError>;

    /// All constraints of a project.
    async fn constraints_for_project(
        &self,
        project_id: Uuid,
    ) -> Result<Vec<StoryConstraint>, DomainError>;

    /// Adds a character or location. Fails with `NotFound` if the project
    /// does not exist.
    async fn create_element(&self, element: NewElement) -> Result<StoryElement, DomainError>;

    /// Loads a character or location by id.
    async fn get_element(&self, element_id: Uuid) -> Result<Option<StoryElement>, DomainError>;

    /// Elements of one kind in a project, oldest first.
    async fn list_elements(
        &self,
        project_id: Uuid,
        kind: ElementKind,
    ) -> Result<Vec<StoryElement>, DomainError>;

    /// Applies `patch` and returns the updated element, or `None` if it does
    /// not exist.
    async fn update_element(
        &self,
        element_id: Uuid,
        patch: ElementPatch,
    ) -> Result<Option<StoryElement>, DomainError>;

    /// Deletes an element. Returns whether it existed.
    async fn delete_element(&self, element_id: Uuid) -> Result<bool, DomainError>;
}

/// Pipeline records: drafts, facts, check runs, iterations and tasks.
///
/// Drafts are append-only; this trait deliberately has no way to update or
/// delete one.
#[async_trait]
pub trait WorkStore: Send + Sync {
    /// Appends a draft with version `max(version) + 1` for the scene. The
    /// version is computed and the row inserted in one transaction holding a
    /// lock on the scene.
    async fn create_draft(&self, scene_id: Uuid, text: &str) -> Result<Draft, DomainError>;

    /// Loads a draft by id.
    async fn get_draft(&self, draft_id: Uuid) -> Result<Option<Draft>, DomainError>;

    /// Drafts of a scene, newest version first.
    async fn list_drafts(&self, scene_id: Uuid) -> Result<Vec<Draft>, DomainError>;

    /// Highest draft version of a scene, if it has any drafts.
    async fn max_draft_version(&self, scene_id: Uuid) -> Result<Option<i32>, DomainError>;

    /// Stores extracted facts against their source draft.
    async fn record_facts(
        &self,
        draft_id: Uuid,
        facts: &[ExtractedFact],
    ) -> Result<Vec<Fact>, DomainError>;

    /// Facts extracted from a draft.
    async fn facts_for_draft(&self, draft_id: Uuid) -> Result<Vec<Fact>, DomainError>;

    /// Stores one check run.
    async fn record_check_run(&self, run: NewCheckRun) -> Result<CheckRun, DomainError>;

    /// Check runs of an iteration, oldest first.
    async fn check_runs_for_iteration(
        &self,
        iteration_id: Uuid,
    ) -> Result<Vec<CheckRun>, DomainError>;

    /// In one transaction: creates a pending iteration with the next
    /// `iteration_no` for the scene, creates its first PLAN task with
    /// `first_input`, and moves the iteration to running.
    async fn begin_iteration(
        &self,
        scene_id: Uuid,
        first_input: &TaskInput,
        now: DateTime<Utc>,
    ) -> Result<(Iteration, Task), DomainError>;

    /// Loads an iteration by id.
    async fn get_iteration(&self, iteration_id: Uuid) -> Result<Option<Iteration>, DomainError>;

    /// Marks an iteration failed along with any of its tasks that are still
    /// pending or running. Terminal iterations are left untouched.
    async fn abandon_iteration(
        &self,
        iteration_id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError>;

    /// Loads a task by id.
    async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>, DomainError>;

    /// Tasks of an iteration in creation order.
    async fn tasks_for_iteration(&self, iteration_id: Uuid) -> Result<Vec<Task>, DomainError>;

    /// Atomically claims a task: sets it running, stamps `locked_at = now`
    /// and increments its attempt counter, provided its iteration is running
    /// and the task is pending, failed, or running with a lock older than
    /// `stale_before`.
    ///
    /// Fails with `NotFound` if the task does not exist.
    async fn claim_task(
        &self,
        task_id: Uuid,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<ClaimOutcome, DomainError>;

    /// In one transaction: stores the output of a running task, marks it
    /// completed, and applies `advance` (creating and returning the successor
    /// task, or setting the iteration's terminal status).
    ///
    /// `locked_at` is the lock stamp returned by the caller's claim. Fails
    /// with `Conflict` if the task is not running anymore or was reclaimed
    /// under a newer lock.
    async fn complete_task(
        &self,
        task_id: Uuid,
        locked_at: DateTime<Utc>,
        output: &TaskOutput,
        advance: &Advance,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>, DomainError>;

    /// Stores an error output and marks the task failed.
    async fn fail_task(
        &self,
        task_id: Uuid,
        output: &TaskOutput,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError>;

    /// Pending, never-claimed tasks of running iterations created before
    /// `created_before`.
    async fn stalled_tasks(&self, created_before: DateTime<Utc>)
    -> Result<Vec<Task>, DomainError>;

    /// Running tasks of running iterations whose lock was taken before
    /// `locked_before`, i.e. whose worker is gone.
    async fn orphaned_tasks(&self, locked_before: DateTime<Utc>)
    -> Result<Vec<Task>, DomainError>;
}
