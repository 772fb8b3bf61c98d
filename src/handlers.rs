//! Handler type aliases for user-supplied behaviors and guards

use std::future::Future;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use tokio::sync::watch;

use crate::error::SfResult;
use crate::event::Event;
use crate::model::ModelGraph;
use crate::queue::QueueShared;
use crate::types::VertexId;

/// A boxed future that is Send
pub type BoxFuture<'a, T> = std::pin::Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Type alias for async entry/exit/effect behaviors
///
/// The handler is invoked with the triggering event and a [`Dispatcher`]
/// for nested dispatch. Entry and exit behaviors are expected to be
/// short and run to completion within a step.
pub type BehaviorHandler = Arc<
    dyn for<'a> Fn(&'a Event, &'a Dispatcher) -> BoxFuture<'a, SfResult<()>> + Send + Sync,
>;

/// Type alias for do-activities
///
/// Activities take owned arguments because they are spawned as tasks
/// that run alongside the stable configuration; they are cancelled when
/// their owning state is exited.
pub type ActivityHandler =
    Arc<dyn Fn(Event, Dispatcher) -> BoxFuture<'static, SfResult<()>> + Send + Sync>;

/// Type alias for guard constraints
///
/// Guards must be pure and synchronous: the returned future is polled
/// exactly once, and a guard that suspends fails the dispatch with
/// [`crate::SfError::GuardImpure`].
pub type GuardHandler =
    Arc<dyn for<'a> Fn(&'a Event) -> BoxFuture<'a, bool> + Send + Sync>;

/// Wrap a plain predicate as a [`GuardHandler`].
pub fn guard<F>(predicate: F) -> GuardHandler
where
    F: Fn(&Event) -> bool + Send + Sync + 'static,
{
    Arc::new(move |event| {
        let verdict = predicate(event);
        Box::pin(std::future::ready(verdict))
    })
}

/// Wrap an async closure as a [`BehaviorHandler`].
///
/// The closure receives clones of the event and dispatcher so the
/// returned future does not borrow from the step.
pub fn behavior<F, Fut>(f: F) -> BehaviorHandler
where
    F: Fn(Event, Dispatcher) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = SfResult<()>> + Send + 'static,
{
    Arc::new(move |event, dispatcher| Box::pin(f(event.clone(), dispatcher.clone())))
}

/// Wrap an async closure as an [`ActivityHandler`].
pub fn activity<F, Fut>(f: F) -> ActivityHandler
where
    F: Fn(Event, Dispatcher) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = SfResult<()>> + Send + 'static,
{
    Arc::new(move |event, dispatcher| Box::pin(f(event, dispatcher)))
}

/// Evaluate a guard by polling its future exactly once.
///
/// Returns `None` when the guard suspended, which the caller reports as
/// `GuardImpure`.
pub(crate) fn evaluate_guard(guard: &GuardHandler, event: &Event) -> Option<bool> {
    let mut future = guard(event);
    let mut cx = Context::from_waker(Waker::noop());
    match future.as_mut().poll(&mut cx) {
        Poll::Ready(verdict) => Some(verdict),
        Poll::Pending => None,
    }
}

/// Handle passed to behaviors for nested dispatch and configuration queries.
///
/// `dispatch` enqueues without awaiting the dispatch outcome: a behavior
/// runs inside a step, and awaiting its own event's processing would
/// deadlock the interpreter.
#[derive(Clone)]
pub struct Dispatcher {
    pub(crate) graph: Arc<ModelGraph>,
    pub(crate) queue: Arc<QueueShared>,
    pub(crate) snapshot: watch::Receiver<Vec<VertexId>>,
}

impl Dispatcher {
    /// Enqueue an event from inside a behavior (fire and forget).
    pub fn dispatch(&self, event: Event) -> SfResult<()> {
        self.queue.push_event(event, None).map(|_| ())
    }

    /// Snapshot of the active leaves as of the last completed step.
    pub fn active_leaves(&self) -> Vec<VertexId> {
        self.snapshot.borrow().clone()
    }

    /// Whether `vertex` (leaf or ancestor of a leaf) was active as of
    /// the last completed step.
    pub fn is_active(&self, vertex: VertexId) -> bool {
        self.snapshot
            .borrow()
            .iter()
            .any(|&leaf| leaf == vertex || self.graph.is_descendant(leaf, vertex))
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_guard_is_pure() {
        let g = guard(|event| event.payload_as::<u32>() == Some(&3));
        assert_eq!(evaluate_guard(&g, &Event::signal_with("E", 3u32)), Some(true));
        assert_eq!(evaluate_guard(&g, &Event::signal("E")), Some(false));
    }

    #[test]
    fn suspending_guard_is_detected() {
        let g: GuardHandler = Arc::new(|_event| Box::pin(std::future::pending::<bool>()));
        assert_eq!(evaluate_guard(&g, &Event::signal("E")), None);
    }
}
