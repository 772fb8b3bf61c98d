//! Error types for model construction and machine execution

use thiserror::Error;

/// Error type shared by the model builder, the queue, and the interpreter.
///
/// Model errors are raised at freeze time and are fatal: the interpreter
/// refuses to start on an invalid model. Dispatch errors are raised while
/// processing a single event and surface through [`crate::StateMachine::send`].
#[derive(Error, Debug)]
pub enum SfError {
    /// A builder mutation was attempted after the model was frozen
    #[error("model is frozen and can no longer be modified")]
    ModelFrozen,

    /// A state can never be entered by any transition or default entry
    #[error("state '{name}' is unreachable")]
    UnreachableState { name: String },

    /// A region has no initial pseudostate (or more than one)
    #[error("region '{name}' must have exactly one initial pseudostate")]
    MissingInitial { name: String },

    /// A choice pseudostate lacks an unguarded (else) last outgoing transition
    #[error("choice '{name}' has no else branch")]
    IncompleteChoice { name: String },

    /// Two unguarded transitions from the same source share a trigger
    #[error("ambiguous transitions from '{source_state}' on trigger '{trigger}'")]
    AmbiguousTransition { source_state: String, trigger: String },

    /// Generic structural error raised while building a model
    #[error("invalid model: {0}")]
    InvalidModel(String),

    /// A guard attempted to suspend; guards must be pure and synchronous
    #[error("guard on transition '{transition}' attempted to suspend")]
    GuardImpure { transition: String },

    /// A user behavior (entry, exit, effect, or activity) returned an error
    #[error("behavior '{name}' failed: {message}")]
    BehaviorFailed { name: String, message: String },

    /// A failing exit behavior aborted the step; the pre-step
    /// configuration was restored
    #[error("step aborted: {source}")]
    StepAborted {
        #[source]
        source: Box<SfError>,
    },

    /// An operation was attempted in the wrong lifecycle phase
    #[error("illegal in lifecycle state {actual}: {operation}")]
    IllegalState {
        operation: &'static str,
        actual: &'static str,
    },

    /// The machine is stopping and no longer accepts events
    #[error("event queue is closed")]
    QueueClosed,

    /// The clock source failed; the machine is shutting down
    #[error("timer fault: {message}")]
    TimerFault { message: String },
}

impl SfError {
    /// Wrap a behavior failure raised by user code.
    pub fn behavior(name: impl Into<String>, message: impl Into<String>) -> Self {
        SfError::BehaviorFailed {
            name: name.into(),
            message: message.into(),
        }
    }
}

/// Result type for all fallible operations in this crate
pub type SfResult<T> = Result<T, SfError>;
