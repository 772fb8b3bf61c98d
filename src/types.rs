//! Core identifier and vocabulary types shared across the crate

use std::fmt;
use std::time::Duration;

/// Stable index of a vertex in the model arena.
///
/// Vertices are states, regions, final states, and pseudostates; all of
/// them are addressed uniformly so that parent/child links never form
/// reference cycles.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VertexId(pub(crate) u32);

impl VertexId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for VertexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Stable index of a transition in the model arena.
///
/// Transition ids double as declaration order: a lower id was declared
/// earlier, which is the tie-break used during conflict resolution.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransitionId(pub(crate) u32);

impl TransitionId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for TransitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// The kind of a model vertex
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VertexKind {
    /// A state; composite when it owns one or more regions, leaf otherwise
    State,
    /// A concurrent sub-area of a composite state (or of the root)
    Region,
    /// Completion marker of its containing region
    Final,
    /// Transient vertex, never part of a stable configuration
    Pseudo(PseudostateKind),
}

/// Discriminates the transient vertex kinds
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PseudostateKind {
    /// Default entry point of a region
    Initial,
    /// Dynamic conditional branch; guards evaluated at traversal time
    Choice,
    /// Static chain point; guards evaluated with the originating transition
    Junction,
    /// Splits one incoming transition into several orthogonal targets
    Fork,
    /// Merges transitions from several orthogonal sources
    Join,
    /// Halts the whole machine without running exit behaviors
    Terminate,
    /// Remembers the last active direct child of its region
    ShallowHistory,
    /// Remembers the last active leaf configuration of its region
    DeepHistory,
}

/// How a transition relates to the state hierarchy
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum TransitionKind {
    /// Exits the source subtree and re-enters the target subtree
    #[default]
    External,
    /// Effect only; no exit or entry is performed
    Internal,
    /// Exits and enters only within the composite containing both endpoints
    Local,
}

/// What arms a transition
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Trigger {
    /// Fires on a signal event with a matching kind name
    Signal(String),
    /// Fires on a change event with a matching kind name
    Change(String),
    /// Fires when the source state has been active for the given duration
    After(Duration),
    /// Triggerless: fires on the source's completion event
    Completion,
    /// Fires on any signal or change event
    Any,
}

impl Trigger {
    /// Shorthand for a signal trigger.
    pub fn signal(name: impl Into<String>) -> Self {
        Trigger::Signal(name.into())
    }

    pub(crate) fn describe(&self) -> String {
        match self {
            Trigger::Signal(name) => format!("signal:{name}"),
            Trigger::Change(name) => format!("change:{name}"),
            Trigger::After(d) => format!("after:{d:?}"),
            Trigger::Completion => "completion".to_string(),
            Trigger::Any => "any".to_string(),
        }
    }
}

/// Lifecycle of a [`crate::StateMachine`] instance
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lifecycle {
    /// Built but never started
    Unstarted,
    /// Entering the initial configuration
    Starting,
    /// Accepting and dispatching events
    Running,
    /// Unwinding the active configuration
    Stopping,
    /// Fully unwound; terminal
    Stopped,
}

impl Lifecycle {
    pub(crate) fn name(self) -> &'static str {
        match self {
            Lifecycle::Unstarted => "Unstarted",
            Lifecycle::Starting => "Starting",
            Lifecycle::Running => "Running",
            Lifecycle::Stopping => "Stopping",
            Lifecycle::Stopped => "Stopped",
        }
    }
}

/// Outcome of dispatching a single event, reported to the `send` caller
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    /// At least one transition fired
    Completed,
    /// No transition was enabled and an active state deferred the event
    Deferred,
    /// No transition was enabled and nothing deferred the event
    Dropped,
}
