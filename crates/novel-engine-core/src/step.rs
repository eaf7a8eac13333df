//! Step kinds of the iteration state machine.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// The kind of work a task performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepKind {
    /// Outline the scene.
    Plan,
    /// Write the first draft from the plan.
    Draft,
    /// Extract structured facts from the current draft.
    Extract,
    /// Validate the current draft; the only branching step.
    Check,
    /// Produce a new draft addressing check findings.
    Revise,
    /// Accept the current draft. Terminal.
    Commit,
}

impl StepKind {
    /// Every step kind, in nominal pipeline order.
    pub const ALL: [Self; 6] = [
        Self::Plan,
        Self::Draft,
        Self::Extract,
        Self::Check,
        Self::Revise,
        Self::Commit,
    ];

    /// Stable storage name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Plan => "PLAN",
            Self::Draft => "DRAFT",
            Self::Extract => "EXTRACT",
            Self::Check => "CHECK",
            Self::Revise => "REVISE",
            Self::Commit => "COMMIT",
        }
    }

    /// The unconditional successor of this step.
    ///
    /// `Check` branches on its output and `Commit` is terminal, so both
    /// return `None` here; the state machine handles them explicitly.
    #[must_use]
    pub fn successor(self) -> Option<Self> {
        match self {
            Self::Plan => Some(Self::Draft),
            Self::Draft | Self::Revise => Some(Self::Extract),
            Self::Extract => Some(Self::Check),
            Self::Check | Self::Commit => None,
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| DomainError::InvalidArgument(format!("unknown step kind: {s}")))
    }
}
