//! In-memory record store implementing both `SceneCatalog` and `WorkStore`.

use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
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
use uuid::Uuid;

#[derive(Debug, Default)]
struct State {
    projects: Vec<Project>,
    scenes: Vec<Scene>,
    style_bibles: Vec<StyleBible>,
    constraints: Vec<StoryConstraint>,
    elements: Vec<StoryElement>,
    drafts: Vec<Draft>,
    facts: Vec<Fact>,
    check_runs: Vec<CheckRun>,
    iterations: Vec<Iteration>,
    tasks: Vec<Task>,
}

impl State {
    fn iteration_mut(&mut self, id: Uuid) -> Result<&mut Iteration, DomainError> {
        self.iterations
            .iter_mut()
            .find(|it| it.id == id)
            .ok_or_else(|| DomainError::not_found("iteration", id))
    }

    fn task_index(&self, id: Uuid) -> Result<usize, DomainError> {
        self.tasks
            .iter()
            .position(|t| t.id == id)
            .ok_or_else(|| DomainError::not_found("task", id))
    }

    fn iteration_status(&self, id: Uuid) -> Option<IterationStatus> {
        self.iterations
            .iter()
            .find(|it| it.id == id)
            .map(|it| it.status)
    }
}

/// A record store held entirely in memory. Every operation runs under one
/// mutex, so composite writes are trivially atomic.
#[derive(Debug, Default)]
pub struct InMemoryWorkStore {
    state: Mutex<State>,
}

impl InMemoryWorkStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Inserts a project with one scene and returns the scene.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn seed_scene(&self) -> Scene {
        let now = Utc::now();
        let project = Project {
            id: Uuid::new_v4(),
            name: "Seeded project".to_owned(),
            description: None,
            created_at: now,
        };
        let scene = Scene {
            id: Uuid::new_v4(),
            project_id: project.id,
            chapter_no: 1,
            scene_no: 1,
            card: serde_json::json!({ "title": "Seeded scene" }),
            created_at: now,
        };
        let mut state = self.lock();
        state.projects.push(project);
        state.scenes.push(scene.clone());
        scene
    }

    /// Snapshot of every draft, in insertion order.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn all_drafts(&self) -> Vec<Draft> {
        self.lock().drafts.clone()
    }

    /// Snapshot of every iteration.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn all_iterations(&self) -> Vec<Iteration> {
        self.lock().iterations.clone()
    }

    /// Snapshot of every task, in creation order.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn all_tasks(&self) -> Vec<Task> {
        self.lock().tasks.clone()
    }
}

#[async_trait]
impl SceneCatalog for InMemoryWorkStore {
    async fn create_project(&self, project: NewProject) -> Result<Project, DomainError> {
        let project = Project {
            id: Uuid::new_v4(),
            name: project.name,
            description: project.description,
            created_at: Utc::now(),
        };
        self.lock().projects.push(project.clone());
        Ok(project)
    }

    async fn get_project(&self, project_id: Uuid) -> Result<Option<Project>, DomainError> {
        Ok(self.lock().projects.iter().find(|p| p.id == project_id).cloned())
    }

    async fn list_projects(&self) -> Result<Vec<Project>, DomainError> {
        Ok(self.lock().projects.clone())
    }

    async fn create_scene(&self, scene: NewScene) -> Result<Scene, DomainError> {
        let mut state = self.lock();
        if !state.projects.iter().any(|p| p.id == scene.project_id) {
            return Err(DomainError::not_found("project", scene.project_id));
        }
        if state.scenes.iter().any(|s| {
            s.project_id == scene.project_id
                && s.chapter_no == scene.chapter_no
                && s.scene_no == scene.scene_no
        }) {
            return Err(DomainError::Conflict(format!(
                "scene {}.{} already exists",
                scene.chapter_no, scene.scene_no
            )));
        }
        let scene = Scene {
            id: Uuid::new_v4(),
            project_id: scene.project_id,
            chapter_no: scene.chapter_no,
            scene_no: scene.scene_no,
            card: scene.card,
            created_at: Utc::now(),
        };
        state.scenes.push(scene.clone());
        Ok(scene)
    }

    async fn get_scene(&self, scene_id: Uuid) -> Result<Option<Scene>, DomainError> {
        Ok(self.lock().scenes.iter().find(|s| s.id == scene_id).cloned())
    }

    async fn list_scenes(&self, project_id: Uuid) -> Result<Vec<Scene>, DomainError> {
        let mut scenes: Vec<Scene> = self
            .lock()
            .scenes
            .iter()
            .filter(|s| s.project_id == project_id)
            .cloned()
            .collect();
        scenes.sort_by_key(|s| (s.chapter_no, s.scene_no));
        Ok(scenes)
    }

    async fn add_style_bible(
        &self,
        project_id: Uuid,
        content: serde_json::Value,
    ) -> Result<StyleBible, DomainError> {
        let mut state = self.lock();
        if !state.projects.iter().any(|p| p.id == project_id) {
            return Err(DomainError::not_found("project", project_id));
        }
        let version = state
            .style_bibles
            .iter()
            .filter(|b| b.project_id == project_id)
            .map(|b| b.version)
            .max()
            .unwrap_or(0)
            + 1;
        let bible = StyleBible {
            id: Uuid::new_v4(),
            project_id,
            version,
            content,
            created_at: Utc::now(),
        };
        state.style_bibles.push(bible.clone());
        Ok(bible)
    }

    async fn latest_style_bible(
        &self,
        project_id: Uuid,
    ) -> Result<Option<StyleBible>, DomainError> {
        Ok(self
            .lock()
            .style_bibles
            .iter()
            .filter(|b| b.project_id == project_id)
            .max_by_key(|b| b.version)
            .cloned())
    }

    async fn add_constraint(
        &self,
        constraint: NewConstraint,
    ) -> Result<StoryConstraint, DomainError> {
        let mut state = self.lock();
        if !state.projects.iter().any(|p| p.id == constraint.project_id) {
            return Err(DomainError::not_found("project", constraint.project_id));
        }
        let constraint = StoryConstraint {
            id: Uuid::new_v4(),
            project_id: constraint.project_id,
            constraint_type: constraint.constraint_type,
            rule: constraint.rule,
            severity: constraint.severity,
            created_at: Utc::now(),
        };
        state.constraints.push(constraint.clone());
        Ok(constraint)
    }

    async fn constraints_for_project(
        &self,
        project_id: Uuid,
    ) -> Result<Vec<StoryConstraint>, DomainError> {
        Ok(self
            .lock()
            .constraints
            .iter()
            .filter(|c| c.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn create_element(&self, element: NewElement) -> Result<StoryElement, DomainError> {
        let mut state = self.lock();
        if !state.projects.iter().any(|p| p.id == element.project_id) {
            return Err(DomainError::not_found("project", element.project_id));
        }
        let now = Utc::now();
        let element = StoryElement {
            id: Uuid::new_v4(),
            project_id: element.project_id,
            kind: element.kind,
            name: element.name,
            data: element.data,
            created_at: now,
            updated_at: now,
        };
        state.elements.push(element.clone());
        Ok(element)
    }

    async fn get_element(&self, element_id: Uuid) -> Result<Option<StoryElement>, DomainError> {
        Ok(self.lock().elements.iter().find(|e| e.id == element_id).cloned())
    }

    async fn list_elements(
        &self,
        project_id: Uuid,
        kind: ElementKind,
    ) -> Result<Vec<StoryElement>, DomainError> {
        Ok(self
            .lock()
            .elements
            .iter()
            .filter(|e| e.project_id == project_id && e.kind == kind)
            .cloned()
            .collect())
    }

    async fn update_element(
        &self,
        element_id: Uuid,
        patch: ElementPatch,
    ) -> Result<Option<StoryElement>, DomainError> {
        let mut state = self.lock();
        let Some(element) = state.elements.iter_mut().find(|e| e.id == element_id) else {
            return Ok(None);
        };
        if let Some(name) = patch.name {
            element.name = name;
        }
        if let Some(data) = patch.data {
            element.data = data;
        }
        element.updated_at = Utc::now();
        Ok(Some(element.clone()))
    }

    async fn delete_element(&self, element_id: Uuid) -> Result<bool, DomainError> {
        let mut state = self.lock();
        let before = state.elements.len();
        state.elements.retain(|e| e.id != element_id);
        Ok(state.elements.len() < before)
    }
}

#[async_trait]
impl WorkStore for InMemoryWorkStore {
    async fn create_draft(&self, scene_id: Uuid, text: &str) -> Result<Draft, DomainError> {
        let mut state = self.lock();
        if !state.scenes.iter().any(|s| s.id == scene_id) {
            return Err(DomainError::not_found("scene", scene_id));
        }
        let version = state
            .drafts
            .iter()
            .filter(|d| d.scene_id == scene_id)
            .map(|d| d.version)
            .max()
            .unwrap_or(0)
            + 1;
        let draft = Draft {
            id: Uuid::now_v7(),
            scene_id,
            version,
            text: text.to_owned(),
            created_at: Utc::now(),
        };
        state.drafts.push(draft.clone());
        Ok(draft)
    }

    async fn get_draft(&self, draft_id: Uuid) -> Result<Option<Draft>, DomainError> {
        Ok(self.lock().drafts.iter().find(|d| d.id == draft_id).cloned())
    }

    async fn list_drafts(&self, scene_id: Uuid) -> Result<Vec<Draft>, DomainError> {
        let mut drafts: Vec<Draft> = self
            .lock()
            .drafts
            .iter()
            .filter(|d| d.scene_id == scene_id)
            .cloned()
            .collect();
        drafts.sort_by(|a, b| b.version.cmp(&a.version));
        Ok(drafts)
    }

    async fn max_draft_version(&self, scene_id: Uuid) -> Result<Option<i32>, DomainError> {
        Ok(self
            .lock()
            .drafts
            .iter()
            .filter(|d| d.scene_id == scene_id)
            .map(|d| d.version)
            .max())
    }

    async fn record_facts(
        &self,
        draft_id: Uuid,
        facts: &[ExtractedFact],
    ) -> Result<Vec<Fact>, DomainError> {
        let mut state = self.lock();
        if !state.drafts.iter().any(|d| d.id == draft_id) {
            return Err(DomainError::not_found("draft", draft_id));
        }
        let now = Utc::now();
        let stored: Vec<Fact> = facts
            .iter()
            .map(|f| Fact {
                id: Uuid::new_v4(),
                source_draft_id: draft_id,
                fact_type: f.fact_type.clone(),
                subject_type: f.subject_type.clone(),
                subject_id: f.subject_id,
                predicate: f.predicate.clone(),
                object: f.object.clone(),
                confidence: f.confidence,
                created_at: now,
            })
            .collect();
        state.facts.extend(stored.iter().cloned());
        Ok(stored)
    }

    async fn facts_for_draft(&self, draft_id: Uuid) -> Result<Vec<Fact>, DomainError> {
        Ok(self
            .lock()
            .facts
            .iter()
            .filter(|f| f.source_draft_id == draft_id)
            .cloned()
            .collect())
    }

    async fn record_check_run(&self, run: NewCheckRun) -> Result<CheckRun, DomainError> {
        let run = CheckRun {
            id: Uuid::new_v4(),
            iteration_id: run.iteration_id,
            draft_id: run.draft_id,
            check_kind: run.check_kind,
            passed: run.passed,
            findings: run.findings,
            created_at: Utc::now(),
        };
        self.lock().check_runs.push(run.clone());
        Ok(run)
    }

    async fn check_runs_for_iteration(
        &self,
        iteration_id: Uuid,
    ) -> Result<Vec<CheckRun>, DomainError> {
        Ok(self
            .lock()
            .check_runs
            .iter()
            .filter(|r| r.iteration_id == iteration_id)
            .cloned()
            .collect())
    }

    async fn begin_iteration(
        &self,
        scene_id: Uuid,
        first_input: &TaskInput,
        now: DateTime<Utc>,
    ) -> Result<(Iteration, Task), DomainError> {
        let mut state = self.lock();
        if !state.scenes.iter().any(|s| s.id == scene_id) {
            return Err(DomainError::not_found("scene", scene_id));
        }
        let iteration_no = state
            .iterations
            .iter()
            .filter(|it| it.scene_id == scene_id)
            .map(|it| it.iteration_no)
            .max()
            .unwrap_or(0)
            + 1;
        let iteration = Iteration {
            id: Uuid::now_v7(),
            scene_id,
            iteration_no,
            status: IterationStatus::Running,
            created_at: now,
            updated_at: now,
        };
        let task = Task {
            id: Uuid::now_v7(),
            iteration_id: iteration.id,
            step: StepKind::Plan,
            status: TaskStatus::Pending,
            input: first_input.clone(),
            output: None,
            attempts: 0,
            locked_at: None,
            created_at: now,
            updated_at: now,
        };
        state.iterations.push(iteration.clone());
        state.tasks.push(task.clone());
        Ok((iteration, task))
    }

    async fn get_iteration(&self, iteration_id: Uuid) -> Result<Option<Iteration>, DomainError> {
        Ok(self
            .lock()
            .iterations
            .iter()
            .find(|it| it.id == iteration_id)
            .cloned())
    }

    async fn abandon_iteration(
        &self,
        iteration_id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        let mut state = self.lock();
        let iteration = state.iteration_mut(iteration_id)?;
        if iteration.status.is_terminal() {
            return Ok(());
        }
        iteration.status = IterationStatus::Failed;
        iteration.updated_at = now;
        for task in state.tasks.iter_mut().filter(|t| {
            t.iteration_id == iteration_id
                && matches!(t.status, TaskStatus::Pending | TaskStatus::Running)
        }) {
            task.status = TaskStatus::Failed;
            task.output = Some(TaskOutput::failure(reason));
            task.updated_at = now;
        }
        Ok(())
    }

    async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>, DomainError> {
        Ok(self.lock().tasks.iter().find(|t| t.id == task_id).cloned())
    }

    async fn tasks_for_iteration(&self, iteration_id: Uuid) -> Result<Vec<Task>, DomainError> {
        Ok(self
            .lock()
            .tasks
            .iter()
            .filter(|t| t.iteration_id == iteration_id)
            .cloned()
            .collect())
    }

    async fn claim_task(
        &self,
        task_id: Uuid,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<ClaimOutcome, DomainError> {
        let mut state = self.lock();
        let index = state.task_index(task_id)?;
        let iteration_status = state.iteration_status(state.tasks[index].iteration_id);
        let task = &mut state.tasks[index];

        if task.status == TaskStatus::Completed {
            return Ok(ClaimOutcome::AlreadyCompleted(task.clone()));
        }
        if iteration_status != Some(IterationStatus::Running) {
            return Ok(ClaimOutcome::IterationClosed(task.clone()));
        }
        let lock_is_fresh = task.locked_at.is_some_and(|at| at >= stale_before);
        if task.status == TaskStatus::Running && lock_is_fresh {
            return Ok(ClaimOutcome::InFlight(task.clone()));
        }

        task.status = TaskStatus::Running;
        task.locked_at = Some(now);
        task.attempts += 1;
        task.updated_at = now;
        Ok(ClaimOutcome::Claimed(task.clone()))
    }

    async fn complete_task(
        &self,
        task_id: Uuid,
        locked_at: DateTime<Utc>,
        output: &TaskOutput,
        advance: &Advance,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>, DomainError> {
        let mut state = self.lock();
        let index = state.task_index(task_id)?;
        if state.tasks[index].status != TaskStatus::Running {
            return Err(DomainError::Conflict(format!(
                "task {task_id} is {} and cannot complete",
                state.tasks[index].status
            )));
        }
        if state.tasks[index].locked_at != Some(locked_at) {
            return Err(DomainError::Conflict(format!(
                "task {task_id} was reclaimed by another worker"
            )));
        }
        let iteration_id = state.tasks[index].iteration_id;

        let task = &mut state.tasks[index];
        task.status = TaskStatus::Completed;
        task.output = Some(output.clone());
        task.updated_at = now;

        match advance {
            Advance::Next { step, input } => {
                let next = Task {
                    id: Uuid::now_v7(),
                    iteration_id,
                    step: *step,
                    status: TaskStatus::Pending,
                    input: input.clone(),
                    output: None,
                    attempts: 0,
                    locked_at: None,
                    created_at: now,
                    updated_at: now,
                };
                state.tasks.push(next.clone());
                state.iteration_mut(iteration_id)?.updated_at = now;
                Ok(Some(next))
            }
            Advance::Finish(status) => {
                let iteration = state.iteration_mut(iteration_id)?;
                iteration.status = *status;
                iteration.updated_at = now;
                Ok(None)
            }
        }
    }

    async fn fail_task(
        &self,
        task_id: Uuid,
        output: &TaskOutput,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        let mut state = self.lock();
        let index = state.task_index(task_id)?;
        let task = &mut state.tasks[index];
        if task.status == TaskStatus::Running {
            task.status = TaskStatus::Failed;
            task.output = Some(output.clone());
            task.updated_at = now;
        }
        Ok(())
    }

    async fn stalled_tasks(
        &self,
        created_before: DateTime<Utc>,
    ) -> Result<Vec<Task>, DomainError> {
        let state = self.lock();
        Ok(state
            .tasks
            .iter()
            .filter(|t| {
                t.status == TaskStatus::Pending
                    && t.attempts == 0
                    && t.created_at < created_before
                    && state.iteration_status(t.iteration_id) == Some(IterationStatus::Running)
            })
            .cloned()
            .collect())
    }

    async fn orphaned_tasks(
        &self,
        locked_before: DateTime<Utc>,
    ) -> Result<Vec<Task>, DomainError> {
        let state = self.lock();
        Ok(state
            .tasks
            .iter()
            .filter(|t| {
                t.status == TaskStatus::Running
                    && t.locked_at.is_none_or(|at| at < locked_before)
                    && state.iteration_status(t.iteration_id) == Some(IterationStatus::Running)
            })
            .cloned()
            .collect())
    }
}
