//! Event values dispatched through the machine

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::types::VertexId;

/// Discriminates how an event was produced and how transitions match it.
#[derive(Clone, Debug)]
pub enum EventKind {
    /// Application-produced signal, matched by kind name
    Signal(String),
    /// Application-produced change notification, matched by kind name
    Change(String),
    /// Interpreter-produced completion of a state or composite
    Completion(VertexId),
    /// Timer-produced wake for an `after(duration)` transition
    TimeElapsed {
        /// State whose timer fired
        source: VertexId,
        /// The `after` duration that elapsed
        duration: Duration,
    },
}

impl EventKind {
    /// Kind name used for deferral matching; completion and time events
    /// have no name and can never be deferred.
    pub(crate) fn defer_name(&self) -> Option<&str> {
        match self {
            EventKind::Signal(name) | EventKind::Change(name) => Some(name),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Signal(name) => write!(f, "signal:{name}"),
            EventKind::Change(name) => write!(f, "change:{name}"),
            EventKind::Completion(source) => write!(f, "completion:{source}"),
            EventKind::TimeElapsed { source, duration } => {
                write!(f, "after:{source}:{duration:?}")
            }
        }
    }
}

/// An event value.
///
/// The payload is opaque to the interpreter; guards and behaviors
/// downcast it with [`Event::payload_as`]. The sequence number is
/// assigned by the queue at enqueue time and identifies the event in
/// step traces.
#[derive(Clone)]
pub struct Event {
    pub(crate) kind: EventKind,
    pub(crate) payload: Option<Arc<dyn Any + Send + Sync>>,
    pub(crate) seq: u64,
}

impl Event {
    /// Create a signal event without payload.
    pub fn signal(name: impl Into<String>) -> Self {
        Event {
            kind: EventKind::Signal(name.into()),
            payload: None,
            seq: 0,
        }
    }

    /// Create a signal event carrying an opaque payload.
    pub fn signal_with<P: Any + Send + Sync>(name: impl Into<String>, payload: P) -> Self {
        Event {
            kind: EventKind::Signal(name.into()),
            payload: Some(Arc::new(payload)),
            seq: 0,
        }
    }

    /// Create a change event.
    pub fn change(name: impl Into<String>) -> Self {
        Event {
            kind: EventKind::Change(name.into()),
            payload: None,
            seq: 0,
        }
    }

    pub(crate) fn completion(source: VertexId) -> Self {
        Event {
            kind: EventKind::Completion(source),
            payload: None,
            seq: 0,
        }
    }

    pub(crate) fn time_elapsed(source: VertexId, duration: Duration) -> Self {
        Event {
            kind: EventKind::TimeElapsed { source, duration },
            payload: None,
            seq: 0,
        }
    }

    /// The kind discriminator of this event.
    pub fn kind(&self) -> &EventKind {
        &self.kind
    }

    /// Sequence number assigned at enqueue time; 0 before enqueue.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Downcast the payload to a concrete type.
    pub fn payload_as<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.payload.as_deref().and_then(|p| p.downcast_ref())
    }

    pub(crate) fn is_completion(&self) -> bool {
        matches!(self.kind, EventKind::Completion(_))
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("kind", &self.kind)
            .field("seq", &self.seq)
            .field("has_payload", &self.payload.is_some())
            .finish()
    }
}
