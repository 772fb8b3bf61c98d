//! StateMachine: lifecycle management, the interpreter task, and the
//! run-to-completion step
//!
//! One machine owns one interpreter task. The task is the single
//! consumer of the event queue and the exclusive owner of the
//! configuration, the timer service, and the running do-activities;
//! producers only ever touch the queue. Within a step, behaviors may
//! suspend, but selection, exit-set computation, and configuration
//! mutation never interleave with another step.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::{ConfigSnapshot, Configuration};
use crate::error::{SfError, SfResult};
use crate::event::Event;
use crate::handlers::{BoxFuture, Dispatcher};
use crate::model::{BehaviorSlot, ModelGraph};
use crate::queue::{Envelope, QueueItem, QueueShared};
use crate::selector::{self, after_durations, check_guard};
use crate::timer::{Clock, MonotonicClock, TimerService};
use crate::trace::{Observer, StepTrace};
use crate::types::{
    Lifecycle, PseudostateKind, StepOutcome, TransitionId, Trigger, VertexId, VertexKind,
};

/// A runnable state machine over a frozen model graph.
///
/// The machine is a handle: the interpreter itself runs as a spawned
/// task once [`StateMachine::start`] is called. Handles are cheap to
/// share behind an `Arc`.
pub struct StateMachine {
    graph: Arc<ModelGraph>,
    queue: Arc<QueueShared>,
    settled: watch::Receiver<bool>,
    lifecycle: Arc<watch::Sender<Lifecycle>>,
    lifecycle_rx: watch::Receiver<Lifecycle>,
    snapshot_tx: Arc<watch::Sender<Vec<VertexId>>>,
    snapshot_rx: watch::Receiver<Vec<VertexId>>,
    observers: Arc<Mutex<Vec<Observer>>>,
    clock: Arc<dyn Clock>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StateMachine {
    /// Create a machine over a frozen model with the default monotonic
    /// clock.
    pub fn new(graph: Arc<ModelGraph>) -> Self {
        Self::with_clock(graph, Arc::new(MonotonicClock))
    }

    /// Create a machine with a custom clock source.
    pub fn with_clock(graph: Arc<ModelGraph>, clock: Arc<dyn Clock>) -> Self {
        let (queue, settled) = QueueShared::new();
        let (lifecycle, lifecycle_rx) = watch::channel(Lifecycle::Unstarted);
        let (snapshot_tx, snapshot_rx) = watch::channel(Vec::new());
        StateMachine {
            graph,
            queue,
            settled,
            lifecycle: Arc::new(lifecycle),
            lifecycle_rx,
            snapshot_tx: Arc::new(snapshot_tx),
            snapshot_rx,
            observers: Arc::new(Mutex::new(Vec::new())),
            clock,
            task: Mutex::new(None),
        }
    }

    /// The frozen model this machine interprets.
    pub fn graph(&self) -> &Arc<ModelGraph> {
        &self.graph
    }

    /// Current lifecycle phase.
    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle_rx.borrow()
    }

    fn expect_lifecycle(&self, operation: &'static str, allowed: &[Lifecycle]) -> SfResult<()> {
        let actual = self.lifecycle();
        if allowed.contains(&actual) {
            Ok(())
        } else {
            Err(SfError::IllegalState {
                operation,
                actual: actual.name(),
            })
        }
    }

    /// Enter the root's initial configuration and settle.
    ///
    /// Legal only from `Unstarted`. Returns once the machine is settled
    /// and accepting events; a behavior failure during initial entry
    /// surfaces here and leaves the machine `Stopped`.
    pub async fn start(&self) -> SfResult<()> {
        self.expect_lifecycle("start", &[Lifecycle::Unstarted])?;
        self.lifecycle.send_replace(Lifecycle::Starting);
        self.queue.mark_unsettled();

        let dispatcher = Dispatcher {
            graph: Arc::clone(&self.graph),
            queue: Arc::clone(&self.queue),
            snapshot: self.snapshot_rx.clone(),
        };
        let interp = Interp {
            graph: Arc::clone(&self.graph),
            config: Configuration::new(),
            queue: Arc::clone(&self.queue),
            timers: TimerService::new(Arc::clone(&self.clock), Arc::clone(&self.queue)),
            activities: HashMap::new(),
            dispatcher,
            observers: Arc::clone(&self.observers),
            snapshot: Arc::clone(&self.snapshot_tx),
            lifecycle: Arc::clone(&self.lifecycle),
            terminated: false,
        };

        let (started_tx, started_rx) = oneshot::channel();
        let handle = tokio::spawn(interp.run(started_tx));
        *self.task.lock().expect("task slot poisoned") = Some(handle);
        started_rx.await.map_err(|_| SfError::QueueClosed)?
    }

    /// Enqueue an event and await its dispatch outcome.
    ///
    /// Legal from `Starting` and `Running`. The returned future resolves
    /// when the event's run-to-completion step finishes; behavior
    /// failures during that step surface here.
    pub async fn send(&self, event: Event) -> SfResult<StepOutcome> {
        self.expect_lifecycle("send", &[Lifecycle::Starting, Lifecycle::Running])?;
        let (tx, rx) = oneshot::channel();
        self.queue.push_event(event, Some(tx))?;
        rx.await.map_err(|_| SfError::QueueClosed)?
    }

    /// Stop the machine: cancel behaviors and timers, discard queued
    /// events, and exit the active states outer-to-inner.
    pub async fn stop(&self) -> SfResult<()> {
        self.expect_lifecycle("stop", &[Lifecycle::Starting, Lifecycle::Running])?;
        let (tx, rx) = oneshot::channel();
        self.queue.push_stop(tx);
        rx.await.map_err(|_| SfError::QueueClosed)
    }

    /// Resolve once the queue is empty and no step is in flight.
    /// Calling it again without an intervening `send` observes no
    /// additional step.
    pub async fn await_settled(&self) {
        let mut settled = self.settled.clone();
        loop {
            if *settled.borrow() {
                return;
            }
            if settled.changed().await.is_err() {
                return;
            }
        }
    }

    /// Snapshot of the active leaves as of the last completed step.
    pub fn state(&self) -> Vec<VertexId> {
        self.snapshot_rx.borrow().clone()
    }

    /// Whether `vertex` (leaf or ancestor of one) is active.
    pub fn is_active(&self, vertex: VertexId) -> bool {
        self.snapshot_rx
            .borrow()
            .iter()
            .any(|&leaf| leaf == vertex || self.graph.is_descendant(leaf, vertex))
    }

    /// Subscribe to step-completion notifications.
    pub fn observe<F>(&self, callback: F)
    where
        F: Fn(&StepTrace) + Send + Sync + 'static,
    {
        self.observers
            .lock()
            .expect("observers poisoned")
            .push(Arc::new(callback));
    }
}

impl std::fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMachine")
            .field("model", &self.graph.name())
            .field("lifecycle", &self.lifecycle())
            .finish()
    }
}

impl Drop for StateMachine {
    fn drop(&mut self) {
        // Dropping the handle orphans the interpreter; reap its task.
        if let Ok(mut slot) = self.task.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }
}

/// How a dispatched event was resolved inside the interpreter.
enum StepResult {
    Fired,
    Dropped,
    Defer(VertexId),
}

/// The interpreter task state: exclusive owner of the configuration,
/// timers, and do-activities.
struct Interp {
    graph: Arc<ModelGraph>,
    config: Configuration,
    queue: Arc<QueueShared>,
    timers: TimerService,
    activities: HashMap<VertexId, JoinHandle<()>>,
    dispatcher: Dispatcher,
    observers: Arc<Mutex<Vec<Observer>>>,
    snapshot: Arc<watch::Sender<Vec<VertexId>>>,
    lifecycle: Arc<watch::Sender<Lifecycle>>,
    terminated: bool,
}

impl Interp {
    async fn run(mut self, started: oneshot::Sender<SfResult<()>>) {
        debug!(model = self.graph.name(), "entering initial configuration");
        if let Err(error) = self.enter_root().await {
            warn!(model = self.graph.name(), %error, "initial entry failed");
            self.teardown(false).await;
            let _ = started.send(Err(error));
            return;
        }
        self.publish_snapshot();

        let mut started = Some(started);
        loop {
            if self.terminated {
                // Terminate pseudostate: halt without exit behaviors.
                self.teardown(false).await;
                if let Some(ack) = started.take() {
                    let _ = ack.send(Ok(()));
                }
                return;
            }
            if self.queue.is_empty() {
                self.publish_snapshot();
                self.queue.mark_settled();
                if let Some(ack) = started.take() {
                    self.lifecycle.send_replace(Lifecycle::Running);
                    debug!(model = self.graph.name(), "settled and running");
                    let _ = ack.send(Ok(()));
                }
            }
            let item = self.queue.next().await;
            match item {
                QueueItem::Stop(ack) => {
                    self.teardown(true).await;
                    if let Some(started) = started.take() {
                        let _ = started.send(Ok(()));
                    }
                    let _ = ack.send(());
                    return;
                }
                QueueItem::Fault(error) => {
                    warn!(model = self.graph.name(), %error, "fault; stopping");
                    self.teardown(true).await;
                    if let Some(started) = started.take() {
                        let _ = started.send(Err(error));
                    }
                    return;
                }
                QueueItem::Event(envelope) => self.dispatch(envelope).await,
            }
        }
    }

    async fn dispatch(&mut self, mut envelope: Envelope) {
        let event = envelope.event.clone();
        let result = self.step(&event).await;
        match result {
            Ok(StepResult::Fired) => envelope.reply(Ok(StepOutcome::Completed)),
            Ok(StepResult::Dropped) => envelope.reply(Ok(StepOutcome::Dropped)),
            Ok(StepResult::Defer(owner)) => {
                envelope.reply(Ok(StepOutcome::Deferred));
                self.queue.defer(owner, envelope);
            }
            Err(error) => {
                warn!(model = self.graph.name(), %error, "step failed");
                envelope.reply(Err(error));
            }
        }
    }

    /// One run-to-completion step for a single event.
    async fn step(&mut self, event: &Event) -> SfResult<StepResult> {
        debug!(event = %event.kind(), seq = event.seq(), "dispatching");
        let selected = selector::select(&self.graph, &self.config, event)?;

        let mut trace = StepTrace {
            event: event.seq(),
            kind: event.kind().to_string(),
            ..StepTrace::default()
        };

        if selected.is_empty() {
            if let Some(name) = event.kind().defer_name() {
                if let Some(owner) = self.config.innermost_deferring(&self.graph, name) {
                    debug!(
                        event = %event.kind(),
                        owner = self.graph.qualified_name(owner),
                        "deferring"
                    );
                    trace.deferred = true;
                    trace.active = self.config.active_leaves(&self.graph);
                    self.notify(&trace);
                    return Ok(StepResult::Defer(owner));
                }
            }
            debug!(event = %event.kind(), "no enabled transition; dropping");
            trace.dropped = true;
            trace.active = self.config.active_leaves(&self.graph);
            self.notify(&trace);
            return Ok(StepResult::Dropped);
        }

        let snapshot = self.config.snapshot();

        // Union of the per-compound exit sets, inner to outer.
        let mut exit_union: Vec<VertexId> = Vec::new();
        for compound in &selected {
            exit_union.extend(compound.exit_set.iter().copied());
        }
        exit_union.sort_by(|&a, &b| {
            self.graph
                .depth(b)
                .cmp(&self.graph.depth(a))
                .then(a.cmp(&b))
        });
        exit_union.dedup();

        // Cancel in-flight do-activities and await their acknowledgement.
        for &vertex in &exit_union {
            self.cancel_activity(vertex).await;
        }

        // Record history before anything is removed.
        let mut history_regions: HashSet<VertexId> = HashSet::new();
        for &vertex in &exit_union {
            if let Some(parent) = self.graph.parent(vertex) {
                history_regions.insert(parent);
            }
        }
        for region in history_regions {
            self.config.record_history(&self.graph, region);
        }

        // Exit behaviors, inner to outer.
        for &vertex in &exit_union {
            if let Err(error) = self
                .run_slot_behavior(vertex, BehaviorSlot::Exit, event)
                .await
            {
                self.config.restore(snapshot);
                return Err(SfError::StepAborted {
                    source: Box::new(error),
                });
            }
            self.timers.cancel(vertex);
            self.config.remove(&self.graph, vertex);
            trace.exited.push(vertex);
        }

        // Effects, in selection order; fork/join segments run once each.
        for compound in &selected {
            for &segment in &compound.segments {
                if let Some(effect) = &self.graph.transition(segment).effect {
                    let result = effect(event, &self.dispatcher).await;
                    if let Err(error) = result {
                        self.config.restore(snapshot);
                        return Err(self.wrap_behavior_error(
                            compound.source,
                            "effect",
                            error,
                        ));
                    }
                }
                trace.effects.push(segment);
            }
        }

        // Entries, outer to inner; composites entered without an
        // explicit target default through their initial pseudostates.
        let mut entered: Vec<VertexId> = Vec::new();
        for compound in &selected {
            let Some(scope) = compound.scope else {
                continue;
            };
            if let Err(error) = self
                .enter_targets(scope, &compound.targets, event, &mut entered)
                .await
            {
                self.rollback_entry(snapshot, &entered).await;
                return Err(error);
            }
        }
        trace.entered = entered.clone();

        // Deferred events owned by exited states rejoin the queue.
        self.queue.release_deferred(&exit_union);

        self.emit_completions(&entered, &mut trace);

        trace.active = self.config.active_leaves(&self.graph);
        self.publish_snapshot();
        self.notify(&trace);
        Ok(StepResult::Fired)
    }

    /// Enter the compound's targets below `scope`.
    async fn enter_targets(
        &mut self,
        scope: VertexId,
        targets: &[VertexId],
        event: &Event,
        entered: &mut Vec<VertexId>,
    ) -> SfResult<()> {
        let mut path: HashSet<VertexId> = HashSet::new();
        for &target in targets {
            path.insert(target);
            let mut cursor = self.graph.parent(target);
            while let Some(v) = cursor {
                if v == scope {
                    break;
                }
                path.insert(v);
                cursor = self.graph.parent(v);
            }
        }

        match self.graph.kind(scope) {
            VertexKind::Region => {
                if let Some(child) = self.explicit_child(scope, &path) {
                    self.enter_vertex(child, &path, event, entered).await?;
                }
            }
            _ => {
                let regions: Vec<VertexId> = self.graph.regions(scope).to_vec();
                for region in regions {
                    if let Some(child) = self.explicit_child(region, &path) {
                        self.enter_vertex(child, &path, event, entered).await?;
                    } else if !self.region_occupied(region) {
                        self.default_enter_region(region, event, entered).await?;
                    }
                }
            }
        }
        Ok(())
    }

    fn explicit_child(&self, region: VertexId, path: &HashSet<VertexId>) -> Option<VertexId> {
        self.graph
            .children(region)
            .iter()
            .copied()
            .find(|c| path.contains(c))
    }

    fn region_occupied(&self, region: VertexId) -> bool {
        self.graph
            .children(region)
            .iter()
            .any(|&c| self.config.is_active(c))
    }

    /// Enter one vertex and recurse into its regions. Boxed because the
    /// recursion depth follows the model tree.
    fn enter_vertex<'a>(
        &'a mut self,
        vertex: VertexId,
        path: &'a HashSet<VertexId>,
        event: &'a Event,
        entered: &'a mut Vec<VertexId>,
    ) -> BoxFuture<'a, SfResult<()>> {
        Box::pin(async move {
            match self.graph.kind(vertex) {
                VertexKind::State => {
                    if let Some(parent) = self.graph.parent(vertex) {
                        self.config.add(parent);
                    }
                    self.config.add(vertex);
                    entered.push(vertex);
                    debug!(state = self.graph.qualified_name(vertex), "entering");
                    self.run_slot_behavior(vertex, BehaviorSlot::Entry, event).await?;
                    self.start_activity(vertex, event);
                    let durations = after_durations(&self.graph, vertex);
                    self.timers.schedule(vertex, &durations);
                    let regions: Vec<VertexId> = self.graph.regions(vertex).to_vec();
                    for region in regions {
                        if let Some(child) = self.explicit_child(region, path) {
                            self.enter_vertex(child, path, event, entered).await?;
                        } else {
                            self.default_enter_region(region, event, entered).await?;
                        }
                    }
                    Ok(())
                }
                VertexKind::Final => {
                    if let Some(region) = self.graph.parent(vertex) {
                        self.config.add(region);
                        self.config.mark_region_completed(region);
                    }
                    self.config.add(vertex);
                    entered.push(vertex);
                    debug!(state = self.graph.qualified_name(vertex), "entering final");
                    Ok(())
                }
                VertexKind::Pseudo(kind) => {
                    self.enter_pseudostate(vertex, kind, event, entered).await
                }
                VertexKind::Region => Ok(()),
            }
        })
    }

    fn enter_pseudostate<'a>(
        &'a mut self,
        vertex: VertexId,
        kind: PseudostateKind,
        event: &'a Event,
        entered: &'a mut Vec<VertexId>,
    ) -> BoxFuture<'a, SfResult<()>> {
        Box::pin(async move {
            debug!(
                pseudostate = self.graph.qualified_name(vertex),
                ?kind,
                "traversing"
            );
            match kind {
                PseudostateKind::Initial => {
                    let t = self.graph.transitions_out(vertex)[0];
                    self.run_segment(t, event).await?;
                    let target = self.graph.transition(t).target;
                    self.enter_dynamic(target, event, entered).await
                }
                PseudostateKind::Choice | PseudostateKind::Junction => {
                    let branches: Vec<TransitionId> = self.graph.transitions_out(vertex).to_vec();
                    for t in branches {
                        let branch = self.graph.transition(t);
                        let target = branch.target;
                        if check_guard(&self.graph, branch, event)? {
                            self.run_segment(t, event).await?;
                            return self.enter_dynamic(target, event, entered).await;
                        }
                    }
                    // Freeze-time validation guarantees an else branch
                    // for choices; a dead-end junction is a model bug.
                    Err(SfError::IncompleteChoice {
                        name: self.graph.qualified_name(vertex).to_string(),
                    })
                }
                PseudostateKind::Fork => {
                    let prongs: Vec<TransitionId> = self.graph.transitions_out(vertex).to_vec();
                    for t in prongs {
                        self.run_segment(t, event).await?;
                        let target = self.graph.transition(t).target;
                        self.enter_dynamic(target, event, entered).await?;
                    }
                    Ok(())
                }
                PseudostateKind::Terminate => {
                    debug!(model = self.graph.name(), "terminate pseudostate reached");
                    self.terminated = true;
                    Ok(())
                }
                PseudostateKind::ShallowHistory => {
                    let region = self.graph.parent(vertex).expect("history has a region");
                    if let Some(record) = self.config.shallow_record(region) {
                        let mut local = HashSet::new();
                        local.insert(record);
                        self.enter_vertex(record, &local, event, entered).await
                    } else {
                        self.enter_history_default(vertex, region, event, entered).await
                    }
                }
                PseudostateKind::DeepHistory => {
                    let region = self.graph.parent(vertex).expect("history has a region");
                    if let Some(record) = self.config.deep_record(region) {
                        let leaves: Vec<VertexId> = record.to_vec();
                        let mut local: HashSet<VertexId> = HashSet::new();
                        for &leaf in &leaves {
                            local.insert(leaf);
                            let mut cursor = self.graph.parent(leaf);
                            while let Some(v) = cursor {
                                if v == region {
                                    break;
                                }
                                local.insert(v);
                                cursor = self.graph.parent(v);
                            }
                        }
                        let tops: Vec<VertexId> = self
                            .graph
                            .children(region)
                            .iter()
                            .copied()
                            .filter(|c| local.contains(c))
                            .collect();
                        for child in tops {
                            self.enter_vertex(child, &local, event, entered).await?;
                        }
                        Ok(())
                    } else {
                        self.enter_history_default(vertex, region, event, entered).await
                    }
                }
                PseudostateKind::Join => {
                    // Joins are resolved during selection; nothing to do.
                    Ok(())
                }
            }
        })
    }

    /// Entry via a history vertex with no record: follow its default
    /// transition, or fall back to the region's initial.
    async fn enter_history_default(
        &mut self,
        history: VertexId,
        region: VertexId,
        event: &Event,
        entered: &mut Vec<VertexId>,
    ) -> SfResult<()> {
        let default = self.graph.transitions_out(history).first().copied();
        if let Some(t) = default {
            self.run_segment(t, event).await?;
            let target = self.graph.transition(t).target;
            self.enter_dynamic(target, event, entered).await
        } else {
            self.default_enter_region(region, event, entered).await
        }
    }

    /// Default-enter a region through its initial pseudostate.
    fn default_enter_region<'a>(
        &'a mut self,
        region: VertexId,
        event: &'a Event,
        entered: &'a mut Vec<VertexId>,
    ) -> BoxFuture<'a, SfResult<()>> {
        Box::pin(async move {
            self.config.add(region);
            let Some(initial) = self.graph.initial_of(region) else {
                return Ok(());
            };
            self.enter_pseudostate(initial, PseudostateKind::Initial, event, entered)
                .await
        })
    }

    /// Enter a target whose chain starts somewhere below an already
    /// active vertex (choice continuations, initial targets, history
    /// fallbacks).
    fn enter_dynamic<'a>(
        &'a mut self,
        target: VertexId,
        event: &'a Event,
        entered: &'a mut Vec<VertexId>,
    ) -> BoxFuture<'a, SfResult<()>> {
        Box::pin(async move {
            // Pseudostate targets need no chain; they are traversed in
            // place.
            if let VertexKind::Pseudo(kind) = self.graph.kind(target) {
                return self.enter_pseudostate(target, kind, event, entered).await;
            }

            let mut path: HashSet<VertexId> = HashSet::new();
            path.insert(target);
            let mut top = target;
            let mut cursor = self.graph.parent(target);
            while let Some(v) = cursor {
                if self.config.is_active(v) {
                    break;
                }
                if self.graph.kind(v) != VertexKind::Region {
                    top = v;
                }
                path.insert(v);
                cursor = self.graph.parent(v);
            }
            self.enter_vertex(top, &path, event, entered).await
        })
    }

    /// Run a transition segment's effect.
    async fn run_segment(&mut self, transition: TransitionId, event: &Event) -> SfResult<()> {
        let t = self.graph.transition(transition);
        if let Some(effect) = &t.effect {
            let source = t.source;
            effect(event, &self.dispatcher)
                .await
                .map_err(|error| self.wrap_behavior_error(source, "effect", error))?;
        }
        Ok(())
    }

    /// Run a state's entry or exit behavior if present.
    async fn run_slot_behavior(
        &mut self,
        vertex: VertexId,
        slot: BehaviorSlot,
        event: &Event,
    ) -> SfResult<()> {
        let handler = match slot {
            BehaviorSlot::Entry => self.graph.entry_behavior(vertex),
            BehaviorSlot::Exit => self.graph.exit_behavior(vertex),
        };
        let Some(handler) = handler.cloned() else {
            return Ok(());
        };
        let label = match slot {
            BehaviorSlot::Entry => "entry",
            BehaviorSlot::Exit => "exit",
        };
        handler(event, &self.dispatcher)
            .await
            .map_err(|error| self.wrap_behavior_error(vertex, label, error))
    }

    fn wrap_behavior_error(&self, vertex: VertexId, slot: &str, error: SfError) -> SfError {
        match error {
            already @ SfError::BehaviorFailed { .. } => already,
            other => SfError::BehaviorFailed {
                name: format!("{}.{slot}", self.graph.qualified_name(vertex)),
                message: other.to_string(),
            },
        }
    }

    fn start_activity(&mut self, state: VertexId, event: &Event) {
        let Some(handler) = self.graph.activity(state) else {
            return;
        };
        let future = handler(event.clone(), self.dispatcher.clone());
        let queue = Arc::clone(&self.queue);
        let emits_completion = self
            .graph
            .transitions_out(state)
            .iter()
            .any(|&t| matches!(self.graph.transition(t).trigger, Trigger::Completion));
        let name = self.graph.qualified_name(state).to_string();
        let handle = tokio::spawn(async move {
            match future.await {
                Ok(()) => {
                    debug!(state = %name, "do-activity finished");
                    if emits_completion {
                        queue.push_completion(state);
                    }
                }
                Err(error) => warn!(state = %name, %error, "do-activity failed"),
            }
        });
        self.activities.insert(state, handle);
    }

    async fn cancel_activity(&mut self, state: VertexId) {
        if let Some(handle) = self.activities.remove(&state) {
            debug!(state = self.graph.qualified_name(state), "cancelling do-activity");
            handle.abort();
            // Await the cancellation acknowledgement; side effects up to
            // the cancellation point are committed.
            let _ = handle.await;
        }
    }

    /// Undo a partially executed entry phase.
    async fn rollback_entry(&mut self, snapshot: ConfigSnapshot, entered: &[VertexId]) {
        for &vertex in entered {
            self.cancel_activity(vertex).await;
            self.timers.cancel(vertex);
        }
        self.config.restore(snapshot);
    }

    /// Emit completion events for freshly completed states, innermost
    /// first, at most once per stay.
    fn emit_completions(&mut self, entered: &[VertexId], trace: &mut StepTrace) {
        let mut by_depth: Vec<VertexId> = entered.to_vec();
        by_depth.sort_by_key(|&v| std::cmp::Reverse(self.graph.depth(v)));
        for &vertex in &by_depth {
            match self.graph.kind(vertex) {
                VertexKind::State
                    if self.graph.is_leaf_state(vertex)
                        && self.graph.activity(vertex).is_none() =>
                {
                    let has_completion_transition = self
                        .graph
                        .transitions_out(vertex)
                        .iter()
                        .any(|&t| {
                            matches!(self.graph.transition(t).trigger, Trigger::Completion)
                        });
                    if has_completion_transition
                        && self.config.mark_completion_emitted(vertex)
                    {
                        debug!(
                            state = self.graph.qualified_name(vertex),
                            "emitting completion"
                        );
                        self.queue.push_completion(vertex);
                        trace.completions.push(vertex);
                    }
                }
                VertexKind::Final => {
                    let region = self.graph.parent(vertex).expect("final has a region");
                    let composite = self.graph.parent(region).expect("region has a state");
                    if self.config.all_regions_completed(&self.graph, composite)
                        && self.config.mark_completion_emitted(composite)
                    {
                        debug!(
                            composite = self.graph.qualified_name(composite),
                            "all regions completed"
                        );
                        self.queue.push_completion(composite);
                        trace.completions.push(composite);
                    }
                }
                _ => {}
            }
        }
    }

    async fn enter_root(&mut self) -> SfResult<()> {
        let root = self.graph.root();
        self.config.add(root);
        let event = Event::signal("__start__");
        let mut entered = Vec::new();
        let mut trace = StepTrace {
            kind: "start".to_string(),
            ..StepTrace::default()
        };
        let regions: Vec<VertexId> = self.graph.regions(root).to_vec();
        for region in regions {
            self.default_enter_region(region, &event, &mut entered).await?;
        }
        trace.entered = entered.clone();
        self.emit_completions(&entered, &mut trace);
        trace.active = self.config.active_leaves(&self.graph);
        self.notify(&trace);
        Ok(())
    }

    /// Wind the machine down. When `run_exits` is set, exit behaviors
    /// run outer-to-inner to unwind cleanly; the terminate pseudostate
    /// path skips them.
    async fn teardown(&mut self, run_exits: bool) {
        self.lifecycle.send_replace(Lifecycle::Stopping);
        debug!(model = self.graph.name(), "stopping");

        let active_states: Vec<VertexId> = {
            let mut states: Vec<VertexId> = self
                .config
                .active_leaves(&self.graph)
                .iter()
                .flat_map(|&leaf| {
                    let mut chain = self.graph.ancestors(leaf);
                    chain.push(leaf);
                    chain
                })
                .filter(|&v| {
                    matches!(self.graph.kind(v), VertexKind::State | VertexKind::Final)
                        && v != self.graph.root()
                })
                .collect();
            states.sort_by_key(|&v| (self.graph.depth(v), v));
            states.dedup();
            states
        };

        for &state in &active_states {
            self.cancel_activity(state).await;
        }
        self.timers.cancel_all();

        for item in self.queue.close() {
            if let QueueItem::Event(mut envelope) = item {
                envelope.reply(Err(SfError::QueueClosed));
            }
        }

        if run_exits {
            let event = Event::signal("__stop__");
            for &state in &active_states {
                if let Err(error) = self
                    .run_slot_behavior(state, BehaviorSlot::Exit, &event)
                    .await
                {
                    warn!(
                        state = self.graph.qualified_name(state),
                        %error,
                        "exit behavior failed during stop"
                    );
                }
            }
        }

        self.config.clear();
        self.snapshot.send_replace(Vec::new());
        self.lifecycle.send_replace(Lifecycle::Stopped);
        self.queue.mark_settled();
        debug!(model = self.graph.name(), "stopped");
    }

    fn publish_snapshot(&self) {
        self.snapshot
            .send_replace(self.config.active_leaves(&self.graph));
    }

    fn notify(&self, trace: &StepTrace) {
        let observers = self.observers.lock().expect("observers poisoned");
        for observer in observers.iter() {
            observer(trace);
        }
    }
}

impl std::fmt::Debug for Interp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interp")
            .field("model", &self.graph.name())
            .field("activities", &self.activities.len())
            .finish()
    }
}
