//! Event queue: main FIFO, deferred side pool, completion priority
//!
//! The queue is the single point of cross-task contention: producers
//! (application code, timer tasks, behaviors) append under a mutex, the
//! interpreter is the only consumer. Completion events always precede
//! external events within a settle pass, and control items (stop, timer
//! fault) jump the line entirely.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::{oneshot, watch, Notify};

use crate::error::{SfError, SfResult};
use crate::event::Event;
use crate::types::{StepOutcome, VertexId};

/// An event travelling through the queue together with the channel used
/// to report its dispatch outcome to the `send` caller.
pub(crate) struct Envelope {
    pub event: Event,
    pub reply: Option<oneshot::Sender<SfResult<StepOutcome>>>,
}

impl Envelope {
    pub(crate) fn reply(&mut self, outcome: SfResult<StepOutcome>) {
        if let Some(tx) = self.reply.take() {
            let _ = tx.send(outcome);
        }
    }
}

/// Items the interpreter serializes through the queue.
pub(crate) enum QueueItem {
    Event(Envelope),
    Stop(oneshot::Sender<()>),
    Fault(SfError),
}

struct QueueInner {
    fifo: VecDeque<QueueItem>,
    deferred: Vec<(VertexId, Envelope)>,
    next_seq: u64,
    closed: bool,
}

/// Shared queue state: multi-producer, single consumer.
pub(crate) struct QueueShared {
    inner: Mutex<QueueInner>,
    notify: Notify,
    settled: watch::Sender<bool>,
}

impl QueueShared {
    pub(crate) fn new() -> (std::sync::Arc<Self>, watch::Receiver<bool>) {
        let (settled, settled_rx) = watch::channel(true);
        let shared = std::sync::Arc::new(QueueShared {
            inner: Mutex::new(QueueInner {
                fifo: VecDeque::new(),
                deferred: Vec::new(),
                next_seq: 1,
                closed: false,
            }),
            notify: Notify::new(),
            settled,
        });
        (shared, settled_rx)
    }

    /// Append an event to the main FIFO; returns its sequence number.
    pub(crate) fn push_event(
        &self,
        mut event: Event,
        reply: Option<oneshot::Sender<SfResult<StepOutcome>>>,
    ) -> SfResult<u64> {
        let mut inner = self.inner.lock().expect("queue poisoned");
        if inner.closed {
            return Err(SfError::QueueClosed);
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        event.seq = seq;
        inner.fifo.push_back(QueueItem::Event(Envelope { event, reply }));
        drop(inner);
        self.wake();
        Ok(seq)
    }

    /// Append a completion event for `source` behind any completion
    /// events already queued but ahead of every external event.
    pub(crate) fn push_completion(&self, source: VertexId) {
        let mut inner = self.inner.lock().expect("queue poisoned");
        if inner.closed {
            return;
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let mut event = Event::completion(source);
        event.seq = seq;
        let at = Self::priority_prefix_len(&inner.fifo);
        inner.fifo.insert(
            at,
            QueueItem::Event(Envelope { event, reply: None }),
        );
        drop(inner);
        self.wake();
    }

    /// Append a time-elapsed event produced by a timer task.
    pub(crate) fn push_time_event(&self, event: Event) {
        let _ = self.push_event(event, None);
    }

    /// Raise a fault; processed ahead of all queued events.
    pub(crate) fn push_fault(&self, error: SfError) {
        let mut inner = self.inner.lock().expect("queue poisoned");
        inner.fifo.push_front(QueueItem::Fault(error));
        drop(inner);
        self.wake();
    }

    /// Request a stop; processed ahead of all queued events.
    pub(crate) fn push_stop(&self, ack: oneshot::Sender<()>) {
        let mut inner = self.inner.lock().expect("queue poisoned");
        inner.fifo.push_front(QueueItem::Stop(ack));
        drop(inner);
        self.wake();
    }

    /// Move an event to the deferred pool of the state that deferred it.
    pub(crate) fn defer(&self, owner: VertexId, envelope: Envelope) {
        let mut inner = self.inner.lock().expect("queue poisoned");
        inner.deferred.push((owner, envelope));
    }

    /// Release the deferred events owned by the exited states back into
    /// the main FIFO: flattened to original enqueue order, behind the
    /// completion prefix, ahead of pending external events.
    pub(crate) fn release_deferred(&self, owners: &[VertexId]) {
        let mut inner = self.inner.lock().expect("queue poisoned");
        let mut released = Vec::new();
        let mut kept = Vec::new();
        for (owner, envelope) in inner.deferred.drain(..) {
            if owners.contains(&owner) {
                released.push(envelope);
            } else {
                kept.push((owner, envelope));
            }
        }
        inner.deferred = kept;
        if released.is_empty() {
            return;
        }
        released.sort_by_key(|envelope| envelope.event.seq);
        let mut at = Self::priority_prefix_len(&inner.fifo);
        for envelope in released {
            inner.fifo.insert(at, QueueItem::Event(envelope));
            at += 1;
        }
        drop(inner);
        self.wake();
    }

    /// Length of the prefix that must stay ahead of newly inserted
    /// events: control items and completion events.
    fn priority_prefix_len(fifo: &VecDeque<QueueItem>) -> usize {
        fifo.iter()
            .take_while(|item| match item {
                QueueItem::Stop(_) | QueueItem::Fault(_) => true,
                QueueItem::Event(envelope) => envelope.event.is_completion(),
            })
            .count()
    }

    /// Pop the next item, or `None` when the queue is empty.
    pub(crate) fn pop(&self) -> Option<QueueItem> {
        self.inner.lock().expect("queue poisoned").fifo.pop_front()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.inner.lock().expect("queue poisoned").fifo.is_empty()
    }

    /// Wait for the next item; used by the interpreter only.
    pub(crate) async fn next(&self) -> QueueItem {
        loop {
            let notified = self.notify.notified();
            if let Some(item) = self.pop() {
                return item;
            }
            notified.await;
        }
    }

    /// Close the queue and drain everything still pending; callers of
    /// `send` with in-flight events receive `QueueClosed`.
    pub(crate) fn close(&self) -> Vec<QueueItem> {
        let mut inner = self.inner.lock().expect("queue poisoned");
        inner.closed = true;
        let mut drained: Vec<QueueItem> = inner.fifo.drain(..).collect();
        drained.extend(
            inner
                .deferred
                .drain(..)
                .map(|(_, envelope)| QueueItem::Event(envelope)),
        );
        drained
    }

    pub(crate) fn mark_unsettled(&self) {
        self.settled.send_replace(false);
    }

    /// Flip the settled flag, unless a producer slipped an item in
    /// since the consumer's emptiness check.
    pub(crate) fn mark_settled(&self) {
        let inner = self.inner.lock().expect("queue poisoned");
        if inner.fifo.is_empty() {
            self.settled.send_replace(true);
        }
    }

    fn wake(&self) {
        self.settled.send_replace(false);
        self.notify.notify_one();
    }
}

impl std::fmt::Debug for QueueShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().expect("queue poisoned");
        f.debug_struct("QueueShared")
            .field("pending", &inner.fifo.len())
            .field("deferred", &inner.deferred.len())
            .field("closed", &inner.closed)
            .finish()
    }
}
