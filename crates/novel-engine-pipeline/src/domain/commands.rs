//! Commands for the iteration pipeline.

use uuid::Uuid;

/// Command to start a new iteration over a scene.
#[derive(Debug, Clone)]
pub struct StartIteration {
    /// The scene to iterate on.
    pub scene_id: Uuid,
    /// Number of REVISE cycles allowed before the iteration fails.
    pub max_attempts: u32,
    /// Existing draft of the same scene to build on.
    pub starting_draft_id: Option<Uuid>,
}
