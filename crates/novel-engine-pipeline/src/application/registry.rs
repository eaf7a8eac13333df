//! Step handler lookup.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use novel_engine_core::handler::StepHandler;
use novel_engine_core::step::StepKind;

/// Maps each step kind to the handler that executes it.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<StepKind, Arc<dyn StepHandler>>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under its own step kind, replacing any previous
    /// handler for that kind.
    #[must_use]
    pub fn with(mut self, handler: Arc<dyn StepHandler>) -> Self {
        self.handlers.insert(handler.step(), handler);
        self
    }

    /// The handler for `step`, if one is registered.
    #[must_use]
    pub fn get(&self, step: StepKind) -> Option<Arc<dyn StepHandler>> {
        self.handlers.get(&step).cloned()
    }

    /// Step kinds with no registered handler.
    #[must_use]
    pub fn missing(&self) -> Vec<StepKind> {
        StepKind::ALL
            .into_iter()
            .filter(|step| !self.handlers.contains_key(step))
            .collect()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut steps: Vec<&str> = self.handlers.keys().map(|step| step.as_str()).collect();
        steps.sort_unstable();
        f.debug_struct("HandlerRegistry")
            .field("steps", &steps)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use novel_engine_core::error::DomainError;
    use novel_engine_core::handler::StepContext;
    use novel_engine_core::payload::TaskOutput;

    use super::*;

    struct Noop(StepKind);

    #[async_trait]
    impl StepHandler for Noop {
        fn step(&self) -> StepKind {
            self.0
        }

        async fn handle(&self, _ctx: &StepContext) -> Result<TaskOutput, DomainError> {
            Ok(TaskOutput::failure("noop"))
        }
    }

    #[test]
    fn test_registry_reports_missing_steps() {
        let registry = HandlerRegistry::new()
            .with(Arc::new(Noop(StepKind::Plan)))
            .with(Arc::new(Noop(StepKind::Commit)));

        assert!(registry.get(StepKind::Plan).is_some());
        assert!(registry.get(StepKind::Check).is_none());
        assert_eq!(
            registry.missing(),
            vec![
                StepKind::Draft,
                StepKind::Extract,
                StepKind::Check,
                StepKind::Revise
            ]
        );
    }
}
