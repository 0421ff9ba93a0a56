use std::sync::Arc;

use crate::runtime::WorkflowHandler;
use crate::{Event, TurnResult};

/// Seam between the hosting runtime and the pure replay core: replays one
/// turn and returns the new history, decisions, logs, and optional output.
/// Swappable in tests to observe or fault individual turns.
pub trait ReplayEngine: Send + Sync {
    fn replay(
        &self,
        history: Vec<Event>,
        turn_index: u64,
        handler: Arc<dyn WorkflowHandler>,
        input: String,
    ) -> TurnResult<Result<String, String>>;
}

#[derive(Default)]
pub struct DefaultReplayEngine;

impl DefaultReplayEngine {
    pub fn new() -> Self {
        Self
    }
}

impl ReplayEngine for DefaultReplayEngine {
    fn replay(
        &self,
        history: Vec<Event>,
        turn_index: u64,
        handler: Arc<dyn WorkflowHandler>,
        input: String,
    ) -> TurnResult<Result<String, String>> {
        let workflow = |ctx: crate::WorkflowContext| {
            let h = handler.clone();
            let inp = input.clone();
            async move { h.invoke(ctx, inp).await }
        };
        crate::run_turn_with(history, turn_index, workflow)
    }
}
