//! Step handlers backed by the deterministic generators and the checks.
//!
//! Each handler loads what it needs from the catalog or the work store,
//! runs the pure domain function and writes its own records (drafts, facts,
//! check runs). None of them touches task or iteration state.

use std::sync::Arc;

use async_trait::async_trait;
use novel_engine_core::error::DomainError;
use novel_engine_core::handler::{StepContext, StepHandler};
use novel_engine_core::payload::{
    CheckOutput, CommitOutput, DraftOutput, ExtractOutput, ExtractedFact, PlanOutput,
    ReviseOutput, TaskOutput,
};
use novel_engine_core::records::{Draft, ElementKind, Fact, Scene, StoryElement};
use novel_engine_core::repository::{NewCheckRun, SceneCatalog, WorkStore};
use novel_engine_core::step::StepKind;
use tracing::{debug, info};
use uuid::Uuid;

use crate::domain::checks::{self, StyleGuide};
use crate::domain::generation;

async fn load_scene(catalog: &dyn SceneCatalog, scene_id: Uuid) -> Result<Scene, DomainError> {
    catalog
        .get_scene(scene_id)
        .await?
        .ok_or_else(|| DomainError::not_found("scene", scene_id))
}

async fn load_draft(store: &dyn WorkStore, draft_id: Uuid) -> Result<Draft, DomainError> {
    store
        .get_draft(draft_id)
        .await?
        .ok_or_else(|| DomainError::not_found("draft", draft_id))
}

/// Every step handler, sharing one catalog and one work store.
#[must_use]
pub fn all_handlers(
    catalog: &Arc<dyn SceneCatalog>,
    store: &Arc<dyn WorkStore>,
) -> Vec<Arc<dyn StepHandler>> {
    vec![
        Arc::new(PlanHandler::new(Arc::clone(catalog))),
        Arc::new(DraftHandler::new(Arc::clone(catalog), Arc::clone(store))),
        Arc::new(ExtractHandler::new(Arc::clone(catalog), Arc::clone(store))),
        Arc::new(CheckHandler::new(Arc::clone(catalog), Arc::clone(store))),
        Arc::new(ReviseHandler::new(Arc::clone(store))),
        Arc::new(CommitHandler::new(Arc::clone(store))),
    ]
}

/// PLAN: outlines the scene from its card.
pub struct PlanHandler {
    catalog: Arc<dyn SceneCatalog>,
}

impl PlanHandler {
    #[must_use]
    pub fn new(catalog: Arc<dyn SceneCatalog>) -> Self {
        Self { catalog }
    }
}

#[async_trait]
impl StepHandler for PlanHandler {
    fn step(&self) -> StepKind {
        StepKind::Plan
    }

    async fn handle(&self, ctx: &StepContext) -> Result<TaskOutput, DomainError> {
        let scene = load_scene(self.catalog.as_ref(), ctx.input.scene_id).await?;
        let plan = generation::plan_scene(&scene.card);
        debug!(scene_id = %scene.id, beats = plan.beats.len(), "scene planned");
        Ok(TaskOutput::Plan(PlanOutput {
            plan,
            base_draft_id: ctx.input.draft_id,
        }))
    }
}

/// DRAFT: writes a new draft from the plan, on top of the starting draft
/// when the iteration has one.
pub struct DraftHandler {
    catalog: Arc<dyn SceneCatalog>,
    store: Arc<dyn WorkStore>,
}

impl DraftHandler {
    #[must_use]
    pub fn new(catalog: Arc<dyn SceneCatalog>, store: Arc<dyn WorkStore>) -> Self {
        Self { catalog, store }
    }
}

#[async_trait]
impl StepHandler for DraftHandler {
    fn step(&self) -> StepKind {
        StepKind::Draft
    }

    async fn handle(&self, ctx: &StepContext) -> Result<TaskOutput, DomainError> {
        let input = &ctx.input;
        let plan = input
            .plan
            .as_ref()
            .ok_or_else(|| DomainError::InvalidArgument("task input has no plan".into()))?;
        let scene = load_scene(self.catalog.as_ref(), input.scene_id).await?;
        let base = match input.draft_id {
            Some(draft_id) => Some(load_draft(self.store.as_ref(), draft_id).await?),
            None => None,
        };

        let base_text = base.as_ref().map(|d| d.text.as_str());
        let text = generation::draft_scene(&scene.card, plan, base_text);
        let draft = self.store.create_draft(scene.id, &text).await?;
        info!(
            scene_id = %scene.id,
            draft_id = %draft.id,
            version = draft.version,
            "draft written"
        );
        Ok(TaskOutput::Draft(DraftOutput {
            draft_id: draft.id,
            version: draft.version,
        }))
    }
}

/// EXTRACT: stores facts pulled from the current draft, resolving mentions
/// against the project's characters and locations.
pub struct ExtractHandler {
    catalog: Arc<dyn SceneCatalog>,
    store: Arc<dyn WorkStore>,
}

impl ExtractHandler {
    #[must_use]
    pub fn new(catalog: Arc<dyn SceneCatalog>, store: Arc<dyn WorkStore>) -> Self {
        Self { catalog, store }
    }

    async fn elements(&self, scene_id: Uuid) -> Result<Vec<StoryElement>, DomainError> {
        let scene = load_scene(self.catalog.as_ref(), scene_id).await?;
        let mut elements = self
            .catalog
            .list_elements(scene.project_id, ElementKind::Character)
            .await?;
        elements.extend(
            self.catalog
                .list_elements(scene.project_id, ElementKind::Location)
                .await?,
        );
        Ok(elements)
    }
}

#[async_trait]
impl StepHandler for ExtractHandler {
    fn step(&self) -> StepKind {
        StepKind::Extract
    }

    async fn handle(&self, ctx: &StepContext) -> Result<TaskOutput, DomainError> {
        let draft = load_draft(self.store.as_ref(), ctx.input.require_draft()?).await?;
        let elements = self.elements(draft.scene_id).await?;
        let extracted = generation::extract_facts(&draft.text, &elements);
        let stored = self.store.record_facts(draft.id, &extracted).await?;
        debug!(draft_id = %draft.id, facts = stored.len(), "facts extracted");

        Ok(TaskOutput::Extract(ExtractOutput {
            draft_id: draft.id,
            facts: stored.into_iter().map(extracted_from).collect(),
            summary: generation::summarize(&draft.text),
        }))
    }
}

fn extracted_from(fact: Fact) -> ExtractedFact {
    ExtractedFact {
        id: Some(fact.id),
        fact_type: fact.fact_type,
        subject_type: fact.subject_type,
        subject_id: fact.subject_id,
        predicate: fact.predicate,
        object: fact.object,
        confidence: fact.confidence,
    }
}

/// CHECK: runs the continuity and style checks and records one check run
/// per kind.
pub struct CheckHandler {
    catalog: Arc<dyn SceneCatalog>,
    store: Arc<dyn WorkStore>,
}

impl CheckHandler {
    #[must_use]
    pub fn new(catalog: Arc<dyn SceneCatalog>, store: Arc<dyn WorkStore>) -> Self {
        Self { catalog, store }
    }

    /// Facts recorded for the scene's drafts older than `draft`.
    async fn previous_facts(&self, draft: &Draft) -> Result<Vec<Fact>, DomainError> {
        let mut facts = Vec::new();
        for earlier in self
            .store
            .list_drafts(draft.scene_id)
            .await?
            .into_iter()
            .filter(|d| d.version < draft.version)
        {
            facts.extend(self.store.facts_for_draft(earlier.id).await?);
        }
        Ok(facts)
    }
}

#[async_trait]
impl StepHandler for CheckHandler {
    fn step(&self) -> StepKind {
        StepKind::Check
    }

    async fn handle(&self, ctx: &StepContext) -> Result<TaskOutput, DomainError> {
        let input = &ctx.input;
        let draft = load_draft(self.store.as_ref(), input.require_draft()?).await?;
        let scene = load_scene(self.catalog.as_ref(), input.scene_id).await?;
        let constraints = self.catalog.constraints_for_project(scene.project_id).await?;
        let guide = match self.catalog.latest_style_bible(scene.project_id).await? {
            Some(bible) => StyleGuide::from_bible(&bible.content)?,
            None => StyleGuide::default(),
        };
        let previous = self.previous_facts(&draft).await?;
        let facts = input.facts.as_deref().unwrap_or_default();

        let reports = [
            checks::continuity_check(facts, &constraints, &previous),
            checks::style_check(&draft.text, &guide),
        ];

        let mut all_passed = true;
        let mut findings = Vec::new();
        for report in &reports {
            self.store
                .record_check_run(NewCheckRun {
                    iteration_id: ctx.iteration_id,
                    draft_id: draft.id,
                    check_kind: report.kind.to_owned(),
                    passed: report.passed,
                    findings: report.findings.clone(),
                })
                .await?;
            all_passed &= report.passed;
            findings.extend(report.findings.iter().cloned());
        }
        info!(draft_id = %draft.id, all_passed, findings = findings.len(), "draft checked");

        Ok(TaskOutput::Check(CheckOutput {
            draft_id: draft.id,
            all_passed,
            findings,
            check_count: u32::try_from(reports.len()).unwrap_or(u32::MAX),
        }))
    }
}

/// REVISE: writes a new draft addressing the latest findings.
pub struct ReviseHandler {
    store: Arc<dyn WorkStore>,
}

impl ReviseHandler {
    #[must_use]
    pub fn new(store: Arc<dyn WorkStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl StepHandler for ReviseHandler {
    fn step(&self) -> StepKind {
        StepKind::Revise
    }

    async fn handle(&self, ctx: &StepContext) -> Result<TaskOutput, DomainError> {
        let input = &ctx.input;
        let previous = load_draft(self.store.as_ref(), input.require_draft()?).await?;
        let findings = input.findings.as_deref().unwrap_or_default();

        let text = generation::revise_draft(&previous.text, findings);
        let draft = self.store.create_draft(input.scene_id, &text).await?;
        info!(
            draft_id = %draft.id,
            previous_draft_id = %previous.id,
            version = draft.version,
            attempt = input.current_attempt,
            "draft revised"
        );
        Ok(TaskOutput::Revise(ReviseOutput {
            draft_id: draft.id,
            version: draft.version,
            previous_draft_id: previous.id,
        }))
    }
}

/// COMMIT: accepts the current draft.
pub struct CommitHandler {
    store: Arc<dyn WorkStore>,
}

impl CommitHandler {
    #[must_use]
    pub fn new(store: Arc<dyn WorkStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl StepHandler for CommitHandler {
    fn step(&self) -> StepKind {
        StepKind::Commit
    }

    async fn handle(&self, ctx: &StepContext) -> Result<TaskOutput, DomainError> {
        let draft = load_draft(self.store.as_ref(), ctx.input.require_draft()?).await?;
        if draft.scene_id != ctx.input.scene_id {
            return Err(DomainError::InvalidArgument(format!(
                "draft {} belongs to another scene",
                draft.id
            )));
        }
        info!(
            scene_id = %draft.scene_id,
            draft_id = %draft.id,
            version = draft.version,
            "draft committed"
        );
        Ok(TaskOutput::Commit(CommitOutput {
            draft_id: draft.id,
            committed: true,
        }))
    }
}
