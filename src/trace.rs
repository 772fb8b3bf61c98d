//! Structured per-step diagnostics
//!
//! One [`StepTrace`] is produced for every run-to-completion step and
//! handed to observers registered via
//! [`crate::StateMachine::observe`]. The shape is stable: it is the
//! format visualization and debugging tooling consumes.

use crate::types::{TransitionId, VertexId};

/// What a single run-to-completion step did.
#[derive(Clone, Debug, Default)]
pub struct StepTrace {
    /// Sequence number of the dispatched event
    pub event: u64,
    /// Kind of the dispatched event, e.g. `signal:DoorOpen`
    pub kind: String,
    /// States exited, inner to outer
    pub exited: Vec<VertexId>,
    /// Effects executed, in selection order
    pub effects: Vec<TransitionId>,
    /// States entered, outer to inner
    pub entered: Vec<VertexId>,
    /// Composites (and states) whose completion event was emitted
    pub completions: Vec<VertexId>,
    /// Active leaves after the step
    pub active: Vec<VertexId>,
    /// Set when the event matched nothing and was discarded
    pub dropped: bool,
    /// Set when the event was moved to the deferred pool
    pub deferred: bool,
}

/// Observer callback invoked after every step.
pub type Observer = std::sync::Arc<dyn Fn(&StepTrace) + Send + Sync>;
