//! Scripted step handlers for driving the pipeline in tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use novel_engine_core::error::DomainError;
use novel_engine_core::handler::{StepContext, StepHandler};
use novel_engine_core::payload::{
    CheckOutput, CommitOutput, DraftOutput, ExtractOutput, PlanOutput, ReviseOutput, ScenePlan,
    TaskOutput,
};
use novel_engine_core::records::{Finding, Severity};
use novel_engine_core::repository::{NewCheckRun, WorkStore};
use novel_engine_core::step::StepKind;

/// A handler for any step kind that produces minimal valid outputs.
///
/// DRAFT and REVISE append real drafts to the store and CHECK records a check
/// run, so tests can count side effects. CHECK verdicts come from a script;
/// once it runs out, `default_verdict` applies.
pub struct ScriptedHandler {
    step: StepKind,
    store: Arc<dyn WorkStore>,
    verdicts: Mutex<VecDeque<bool>>,
    default_verdict: bool,
    failures_left: Mutex<u32>,
    calls: AtomicUsize,
}

impl std::fmt::Debug for ScriptedHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedHandler")
            .field("step", &self.step)
            .field("default_verdict", &self.default_verdict)
            .field("calls", &self.calls())
            .finish_non_exhaustive()
    }
}

impl ScriptedHandler {
    /// Creates a handler whose checks always pass.
    #[must_use]
    pub fn new(step: StepKind, store: Arc<dyn WorkStore>) -> Self {
        Self {
            step,
            store,
            verdicts: Mutex::new(VecDeque::new()),
            default_verdict: true,
            failures_left: Mutex::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    /// One handler per step kind sharing `store`; CHECK uses
    /// `check_verdict` for every evaluation.
    #[must_use]
    pub fn full_set(store: &Arc<dyn WorkStore>, check_verdict: bool) -> Vec<Arc<Self>> {
        StepKind::ALL
            .into_iter()
            .map(|step| {
                let handler = Self::new(step, Arc::clone(store));
                Arc::new(if check_verdict {
                    handler
                } else {
                    handler.failing_checks()
                })
            })
            .collect()
    }

    /// Makes every unscripted CHECK fail.
    #[must_use]
    pub fn failing_checks(mut self) -> Self {
        self.default_verdict = false;
        self
    }

    /// Scripts the next CHECK verdicts, in order.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[must_use]
    pub fn with_verdicts(self, verdicts: impl IntoIterator<Item = bool>) -> Self {
        self.verdicts.lock().unwrap().extend(verdicts);
        self
    }

    /// Makes the first `n` invocations fail before doing anything.
    #[must_use]
    pub fn failing_first(self, n: u32) -> Self {
        *self.failures_left.lock().unwrap() = n;
        self
    }

    /// Number of times `handle` was invoked.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_verdict(&self) -> bool {
        self.verdicts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.default_verdict)
    }

    fn take_failure(&self) -> bool {
        let mut left = self.failures_left.lock().unwrap();
        if *left > 0 {
            *left -= 1;
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl StepHandler for ScriptedHandler {
    fn step(&self) -> StepKind {
        self.step
    }

    async fn handle(&self, ctx: &StepContext) -> Result<TaskOutput, DomainError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.take_failure() {
            return Err(DomainError::Infrastructure("scripted failure".into()));
        }

        let input = &ctx.input;
        match self.step {
            StepKind::Plan => Ok(TaskOutput::Plan(PlanOutput {
                plan: ScenePlan {
                    beats: vec![],
                    tone: "neutral".into(),
                    pacing: "medium".into(),
                    word_target: 1000,
                },
                base_draft_id: input.draft_id,
            })),
            StepKind::Draft => {
                let draft = self
                    .store
                    .create_draft(input.scene_id, "scripted draft")
                    .await?;
                Ok(TaskOutput::Draft(DraftOutput {
                    draft_id: draft.id,
                    version: draft.version,
                }))
            }
            StepKind::Extract => Ok(TaskOutput::Extract(ExtractOutput {
                draft_id: input.require_draft()?,
                facts: vec![],
                summary: "scripted summary".into(),
            })),
            StepKind::Check => {
                let draft_id = input.require_draft()?;
                let passed = self.next_verdict();
                let findings = if passed {
                    vec![]
                } else {
                    vec![Finding::new(
                        Severity::Error,
                        "scripted failure",
                        "try again",
                    )]
                };
                self.store
                    .record_check_run(NewCheckRun {
                        iteration_id: ctx.iteration_id,
                        draft_id,
                        check_kind: "scripted".into(),
                        passed,
                        findings: findings.clone(),
                    })
                    .await?;
                Ok(TaskOutput::Check(CheckOutput {
                    draft_id,
                    all_passed: passed,
                    findings,
                    check_count: 1,
                }))
            }
            StepKind::Revise => {
                let previous = input.require_draft()?;
                let draft = self
                    .store
                    .create_draft(input.scene_id, "scripted revision")
                    .await?;
                Ok(TaskOutput::Revise(ReviseOutput {
                    draft_id: draft.id,
                    version: draft.version,
                    previous_draft_id: previous,
                }))
            }
            StepKind::Commit => Ok(TaskOutput::Commit(CommitOutput {
                draft_id: input.require_draft()?,
                committed: true,
            })),
        }
    }
}
