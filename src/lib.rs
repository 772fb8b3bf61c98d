//! Hierarchical, concurrent state machine interpreter in the style of
//! UML state charts.
//!
//! `stateforward` interprets a frozen model graph of composite states,
//! orthogonal regions, pseudostates (initial, choice, junction, fork,
//! join, history, terminate), and guarded transitions: it dispatches
//! events, selects the maximal consistent transition set, executes
//! exit/effect/entry behaviors in strict order, and settles when no
//! further progress is possible.
//!
//! The engine is deliberately split:
//! - The [`ModelBuilder`] produces an immutable [`ModelGraph`] — an
//!   arena of vertices addressed by stable ids, validated at freeze
//!   time. Whatever declarative surface an application layers on top,
//!   the interpreter only ever sees this graph.
//! - The [`StateMachine`] interprets the graph: a single spawned task
//!   owns the configuration (which leaf states are active), the
//!   deferred-event pool, the timer service, and the running
//!   do-activities. Producers only ever touch the event queue.
//!
//! ## Run-to-completion
//!
//! One event is fully processed — including every cascaded completion
//! event — before the next external event is looked at. Within a step,
//! behaviors may suspend at their own await points, but selection,
//! exit-set computation, and configuration mutation never interleave
//! with another step. Completion events always jump ahead of external
//! events in the queue, which is what makes completion chains advance
//! atomically from the outside world's point of view.
//!
//! ## Quick start
//!
//! A light switch with an entry behavior:
//!
//! ```rust
//! use stateforward::{handlers, Event, ModelBuilder, StateMachine, StepOutcome};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> stateforward::SfResult<()> {
//!     let mut b = ModelBuilder::new("light_switch");
//!     let region = b.region(b.root(), "main")?;
//!     let off = b.state(region, "off")?;
//!     let on = b.state(region, "on")?;
//!     b.initial(region, off)?;
//!     b.transition(off, on).on_signal("On").add()?;
//!     b.transition(on, off).on_signal("Off").add()?;
//!     b.entry(
//!         on,
//!         handlers::behavior(|_event, _machine| async move {
//!             println!("light is on");
//!             Ok(())
//!         }),
//!     )?;
//!     let graph = b.freeze()?;
//!
//!     let machine = StateMachine::new(graph);
//!     machine.start().await?;
//!
//!     let outcome = machine.send(Event::signal("On")).await?;
//!     assert_eq!(outcome, StepOutcome::Completed);
//!     assert!(machine.is_active(on));
//!
//!     // No transition out of `on` matches `On`; the event is dropped.
//!     let outcome = machine.send(Event::signal("On")).await?;
//!     assert_eq!(outcome, StepOutcome::Dropped);
//!
//!     machine.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Orthogonal regions
//!
//! A composite state may own several regions; each keeps exactly one
//! state active, and transitions in different regions of one composite
//! never conflict — they all fire in the same step. Conflicts across
//! the hierarchy resolve inner-first: the transition with the deeper
//! source wins, with declaration order as the tie-break.
//!
//! ## Deferral, timers, completion
//!
//! - A state may declare event kinds it *defers*: while it is active,
//!   those events wait in a side pool and rejoin the queue (in original
//!   order, ahead of newer events) when the state exits.
//! - `after(duration)` transitions are armed when their source state is
//!   entered and cancelled when it exits; scheduling is monotonic.
//! - Completion events are emitted by the interpreter — never by user
//!   code — when a state's entry behavior (or do-activity) finishes, or
//!   when every region of a composite reaches its final state.

// Module declarations
pub mod builder;
pub mod error;
pub mod event;
pub mod handlers;
pub mod machine;
pub mod model;
pub mod timer;
pub mod trace;
pub mod types;

mod config;
mod queue;
mod selector;

// Re-export main types for convenience
pub use builder::{ModelBuilder, TransitionBuilder};
pub use error::{SfError, SfResult};
pub use event::{Event, EventKind};
pub use handlers::{ActivityHandler, BehaviorHandler, Dispatcher, GuardHandler};
pub use machine::StateMachine;
pub use model::{ModelGraph, Transition};
pub use timer::{Clock, ClockFault, MonotonicClock};
pub use trace::StepTrace;
pub use types::{
    Lifecycle, PseudostateKind, StepOutcome, TransitionId, TransitionKind, Trigger, VertexId,
    VertexKind,
};
