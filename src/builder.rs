//! Programmatic builder producing a frozen [`ModelGraph`]
//!
//! The builder is the crate's side of the model-definition contract:
//! whatever declarative surface sits on top, the interpreter only ever
//! sees the frozen graph this module produces. `freeze` runs the
//! structural validation pass; afterwards every mutation fails with
//! [`SfError::ModelFrozen`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{SfError, SfResult};
use crate::event::Event;
use crate::handlers::{self, ActivityHandler, BehaviorHandler, GuardHandler};
use crate::model::{BehaviorSlot, BehaviorTable, ModelGraph, Transition, Vertex};
use crate::types::{PseudostateKind, TransitionId, TransitionKind, Trigger, VertexId, VertexKind};

/// Builder for a state-machine model.
///
/// ```rust
/// use stateforward::{handlers, ModelBuilder};
///
/// let mut b = ModelBuilder::new("light_switch");
/// let region = b.region(b.root(), "main").unwrap();
/// let off = b.state(region, "off").unwrap();
/// let on = b.state(region, "on").unwrap();
/// b.initial(region, off).unwrap();
/// b.transition(off, on).on_signal("On").add().unwrap();
/// b.transition(on, off).on_signal("Off").add().unwrap();
/// let graph = b.freeze().unwrap();
/// assert_eq!(graph.qualified_name(on), "main.on");
/// ```
pub struct ModelBuilder {
    name: String,
    root: VertexId,
    vertices: Vec<Vertex>,
    transitions: Vec<Transition>,
    behaviors: BehaviorTable,
    frozen: bool,
}

impl ModelBuilder {
    /// Start a model named `name`; the root composite state is created
    /// implicitly.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let root = Vertex {
            id: VertexId(0),
            name: name.clone(),
            kind: VertexKind::State,
            parent: None,
            children: Vec::new(),
            outgoing: Vec::new(),
            incoming: Vec::new(),
            deferred: Vec::new(),
        };
        ModelBuilder {
            name,
            root: VertexId(0),
            vertices: vec![root],
            transitions: Vec::new(),
            behaviors: BehaviorTable::default(),
            frozen: false,
        }
    }

    /// The implicit root composite state.
    pub fn root(&self) -> VertexId {
        self.root
    }

    fn guard_frozen(&self) -> SfResult<()> {
        if self.frozen {
            Err(SfError::ModelFrozen)
        } else {
            Ok(())
        }
    }

    fn add_vertex(
        &mut self,
        parent: VertexId,
        name: impl Into<String>,
        kind: VertexKind,
    ) -> VertexId {
        let id = VertexId(self.vertices.len() as u32);
        self.vertices.push(Vertex {
            id,
            name: name.into(),
            kind,
            parent: Some(parent),
            children: Vec::new(),
            outgoing: Vec::new(),
            incoming: Vec::new(),
            deferred: Vec::new(),
        });
        self.vertices[parent.index()].children.push(id);
        id
    }

    fn expect_kind(&self, id: VertexId, kind: VertexKind, what: &str) -> SfResult<()> {
        if self.vertices[id.index()].kind == kind {
            Ok(())
        } else {
            Err(SfError::InvalidModel(format!(
                "'{}' is not a {what}",
                self.vertices[id.index()].name
            )))
        }
    }

    /// Add a region under a (composite) state.
    pub fn region(&mut self, state: VertexId, name: impl Into<String>) -> SfResult<VertexId> {
        self.guard_frozen()?;
        self.expect_kind(state, VertexKind::State, "state")?;
        Ok(self.add_vertex(state, name, VertexKind::Region))
    }

    /// Add a state to a region. The state becomes composite once it is
    /// given a region of its own.
    pub fn state(&mut self, region: VertexId, name: impl Into<String>) -> SfResult<VertexId> {
        self.guard_frozen()?;
        self.expect_kind(region, VertexKind::Region, "region")?;
        Ok(self.add_vertex(region, name, VertexKind::State))
    }

    /// Add a final state to a region.
    pub fn final_state(&mut self, region: VertexId, name: impl Into<String>) -> SfResult<VertexId> {
        self.guard_frozen()?;
        self.expect_kind(region, VertexKind::Region, "region")?;
        Ok(self.add_vertex(region, name, VertexKind::Final))
    }

    /// Add a pseudostate of the given kind to a region.
    pub fn pseudostate(
        &mut self,
        region: VertexId,
        kind: PseudostateKind,
        name: impl Into<String>,
    ) -> SfResult<VertexId> {
        self.guard_frozen()?;
        self.expect_kind(region, VertexKind::Region, "region")?;
        Ok(self.add_vertex(region, name, VertexKind::Pseudo(kind)))
    }

    /// Add the region's initial pseudostate pointing at `target`.
    pub fn initial(&mut self, region: VertexId, target: VertexId) -> SfResult<VertexId> {
        self.initial_with_effect(region, target, None)
    }

    /// Add the region's initial pseudostate with an effect on its
    /// default transition.
    pub fn initial_with_effect(
        &mut self,
        region: VertexId,
        target: VertexId,
        effect: Option<BehaviorHandler>,
    ) -> SfResult<VertexId> {
        let initial = self.pseudostate(region, PseudostateKind::Initial, "initial")?;
        let mut t = self.transition(initial, target);
        if let Some(effect) = effect {
            t = t.effect(effect);
        }
        t.add()?;
        Ok(initial)
    }

    /// Register an entry behavior for a state.
    pub fn entry(&mut self, state: VertexId, handler: BehaviorHandler) -> SfResult<()> {
        self.guard_frozen()?;
        self.expect_kind(state, VertexKind::State, "state")?;
        self.behaviors
            .behaviors
            .insert((state, BehaviorSlot::Entry), handler);
        Ok(())
    }

    /// Register an exit behavior for a state.
    pub fn exit(&mut self, state: VertexId, handler: BehaviorHandler) -> SfResult<()> {
        self.guard_frozen()?;
        self.expect_kind(state, VertexKind::State, "state")?;
        self.behaviors
            .behaviors
            .insert((state, BehaviorSlot::Exit), handler);
        Ok(())
    }

    /// Register a do-activity for a state; it is started on entry and
    /// cancelled on exit.
    pub fn activity(&mut self, state: VertexId, handler: ActivityHandler) -> SfResult<()> {
        self.guard_frozen()?;
        self.expect_kind(state, VertexKind::State, "state")?;
        self.behaviors.activities.insert(state, handler);
        Ok(())
    }

    /// Declare event kinds a state defers while active.
    pub fn defer(
        &mut self,
        state: VertexId,
        kinds: impl IntoIterator<Item = impl Into<String>>,
    ) -> SfResult<()> {
        self.guard_frozen()?;
        self.expect_kind(state, VertexKind::State, "state")?;
        self.vertices[state.index()]
            .deferred
            .extend(kinds.into_iter().map(Into::into));
        Ok(())
    }

    /// Start defining a transition from `source` to `target`.
    ///
    /// Without an explicit trigger the transition is
    /// completion-triggered.
    pub fn transition(&mut self, source: VertexId, target: VertexId) -> TransitionBuilder<'_> {
        TransitionBuilder {
            builder: self,
            source,
            target,
            kind: TransitionKind::External,
            trigger: None,
            guard: None,
            effect: None,
        }
    }

    /// Start defining an internal transition on `state` (effect only,
    /// no exit or entry).
    pub fn internal(&mut self, state: VertexId) -> TransitionBuilder<'_> {
        TransitionBuilder {
            builder: self,
            source: state,
            target: state,
            kind: TransitionKind::Internal,
            trigger: None,
            guard: None,
            effect: None,
        }
    }

    /// Shorthand for a time-triggered transition.
    pub fn after(
        &mut self,
        source: VertexId,
        delay: Duration,
        target: VertexId,
    ) -> SfResult<TransitionId> {
        self.transition(source, target).after(delay).add()
    }

    fn push_transition(
        &mut self,
        source: VertexId,
        target: VertexId,
        kind: TransitionKind,
        trigger: Trigger,
        guard: Option<GuardHandler>,
        effect: Option<BehaviorHandler>,
    ) -> SfResult<TransitionId> {
        self.guard_frozen()?;
        if source == self.root || target == self.root {
            return Err(SfError::InvalidModel(
                "the root state cannot be a transition endpoint".into(),
            ));
        }
        let id = TransitionId(self.transitions.len() as u32);
        self.transitions.push(Transition {
            id,
            source,
            target,
            kind,
            trigger,
            guard,
            effect,
        });
        self.vertices[source.index()].outgoing.push(id);
        self.vertices[target.index()].incoming.push(id);
        Ok(id)
    }

    /// Validate the model and freeze it into an immutable graph.
    pub fn freeze(&mut self) -> SfResult<Arc<ModelGraph>> {
        self.guard_frozen()?;
        self.frozen = true;
        self.validate()?;

        let mut qualified = vec![String::new(); self.vertices.len()];
        qualified[self.root.index()] = self.name.clone();
        for v in &self.vertices {
            if v.id == self.root {
                continue;
            }
            let mut path = Vec::new();
            let mut cursor = Some(v.id);
            while let Some(id) = cursor {
                if id == self.root {
                    break;
                }
                path.push(self.vertices[id.index()].name.clone());
                cursor = self.vertices[id.index()].parent;
            }
            path.reverse();
            qualified[v.id.index()] = path.join(".");
        }

        Ok(Arc::new(ModelGraph {
            name: std::mem::take(&mut self.name),
            root: self.root,
            vertices: std::mem::take(&mut self.vertices),
            transitions: std::mem::take(&mut self.transitions),
            behaviors: std::mem::take(&mut self.behaviors),
            qualified,
        }))
    }

    fn validate(&self) -> SfResult<()> {
        // Root must be composite.
        let root = &self.vertices[self.root.index()];
        if root.children.is_empty() {
            return Err(SfError::MissingInitial {
                name: root.name.clone(),
            });
        }

        for v in &self.vertices {
            match v.kind {
                VertexKind::Region => {
                    let initials: Vec<_> = v
                        .children
                        .iter()
                        .filter(|&&c| {
                            self.vertices[c.index()].kind
                                == VertexKind::Pseudo(PseudostateKind::Initial)
                        })
                        .collect();
                    if initials.len() != 1 {
                        return Err(SfError::MissingInitial {
                            name: v.name.clone(),
                        });
                    }
                    let initial = &self.vertices[initials[0].index()];
                    if initial.outgoing.len() != 1
                        || self.transitions[initial.outgoing[0].index()].guard.is_some()
                    {
                        return Err(SfError::MissingInitial {
                            name: v.name.clone(),
                        });
                    }
                }
                VertexKind::Pseudo(PseudostateKind::Choice) => {
                    let last_unguarded = v
                        .outgoing
                        .last()
                        .map(|t| self.transitions[t.index()].guard.is_none())
                        .unwrap_or(false);
                    if !last_unguarded {
                        return Err(SfError::IncompleteChoice {
                            name: v.name.clone(),
                        });
                    }
                }
                VertexKind::Pseudo(PseudostateKind::Join) => {
                    if v.incoming.len() < 2 || v.outgoing.len() != 1 {
                        return Err(SfError::InvalidModel(format!(
                            "join '{}' needs >=2 incoming and exactly one outgoing transition",
                            v.name
                        )));
                    }
                }
                VertexKind::Pseudo(PseudostateKind::Fork) => {
                    if v.outgoing.len() < 2 {
                        return Err(SfError::InvalidModel(format!(
                            "fork '{}' needs >=2 outgoing transitions",
                            v.name
                        )));
                    }
                }
                _ => {}
            }

            // Unguarded transitions from one source must not share a
            // trigger. Transitions into a choice or junction are
            // effectively guarded by the branches behind them.
            let mut seen: HashMap<String, ()> = HashMap::new();
            for &t in &v.outgoing {
                let transition = &self.transitions[t.index()];
                if transition.guard.is_some() {
                    continue;
                }
                let branches = matches!(
                    self.vertices[transition.target.index()].kind,
                    VertexKind::Pseudo(PseudostateKind::Choice)
                        | VertexKind::Pseudo(PseudostateKind::Junction)
                );
                if branches {
                    continue;
                }
                let key = transition.trigger.describe();
                if seen.insert(key, ()).is_some()
                    && v.kind != VertexKind::Pseudo(PseudostateKind::Fork)
                {
                    return Err(SfError::AmbiguousTransition {
                        source_state: v.name.clone(),
                        trigger: transition.trigger.describe(),
                    });
                }
            }
        }

        self.validate_reachability()
    }

    fn validate_reachability(&self) -> SfResult<()> {
        let mut reachable: HashSet<VertexId> = HashSet::new();
        let mut worklist = VecDeque::from([self.root]);
        while let Some(v) = worklist.pop_front() {
            if !reachable.insert(v) {
                continue;
            }
            let vertex = &self.vertices[v.index()];
            match vertex.kind {
                VertexKind::State => worklist.extend(vertex.children.iter().copied()),
                VertexKind::Region => {
                    if let Some(&initial) = vertex.children.iter().find(|&&c| {
                        self.vertices[c.index()].kind
                            == VertexKind::Pseudo(PseudostateKind::Initial)
                    }) {
                        worklist.push_back(initial);
                    }
                }
                _ => {}
            }
            for &t in &vertex.outgoing {
                let target = self.transitions[t.index()].target;
                worklist.push_back(target);
                // Entering a target enters its whole ancestor chain.
                let mut cursor = self.vertices[target.index()].parent;
                while let Some(ancestor) = cursor {
                    worklist.push_back(ancestor);
                    cursor = self.vertices[ancestor.index()].parent;
                }
            }
        }

        for v in &self.vertices {
            let checked = matches!(
                v.kind,
                VertexKind::State
                    | VertexKind::Final
                    | VertexKind::Pseudo(PseudostateKind::Choice)
                    | VertexKind::Pseudo(PseudostateKind::Junction)
                    | VertexKind::Pseudo(PseudostateKind::Fork)
                    | VertexKind::Pseudo(PseudostateKind::Join)
                    | VertexKind::Pseudo(PseudostateKind::Terminate)
            );
            if checked && !reachable.contains(&v.id) {
                return Err(SfError::UnreachableState {
                    name: v.name.clone(),
                });
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for ModelBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelBuilder")
            .field("name", &self.name)
            .field("vertices", &self.vertices.len())
            .field("transitions", &self.transitions.len())
            .field("frozen", &self.frozen)
            .finish()
    }
}

/// Fluent definition of a single transition.
pub struct TransitionBuilder<'b> {
    builder: &'b mut ModelBuilder,
    source: VertexId,
    target: VertexId,
    kind: TransitionKind,
    trigger: Option<Trigger>,
    guard: Option<GuardHandler>,
    effect: Option<BehaviorHandler>,
}

impl<'b> TransitionBuilder<'b> {
    /// Trigger on a signal event kind.
    pub fn on_signal(mut self, name: impl Into<String>) -> Self {
        self.trigger = Some(Trigger::Signal(name.into()));
        self
    }

    /// Trigger on a change event kind.
    pub fn on_change(mut self, name: impl Into<String>) -> Self {
        self.trigger = Some(Trigger::Change(name.into()));
        self
    }

    /// Trigger on any signal or change event.
    pub fn on_any(mut self) -> Self {
        self.trigger = Some(Trigger::Any);
        self
    }

    /// Trigger once the source has been active for `delay`.
    pub fn after(mut self, delay: Duration) -> Self {
        self.trigger = Some(Trigger::After(delay));
        self
    }

    /// Attach a guard handler.
    pub fn guard(mut self, guard: GuardHandler) -> Self {
        self.guard = Some(guard);
        self
    }

    /// Attach a plain predicate as guard.
    pub fn guard_fn<F>(self, predicate: F) -> Self
    where
        F: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        self.guard(handlers::guard(predicate))
    }

    /// Attach an effect behavior.
    pub fn effect(mut self, effect: BehaviorHandler) -> Self {
        self.effect = Some(effect);
        self
    }

    /// Mark the transition as local (exit/entry stay inside the
    /// composite containing both endpoints).
    pub fn local(mut self) -> Self {
        self.kind = TransitionKind::Local;
        self
    }

    /// Finish and register the transition.
    pub fn add(self) -> SfResult<TransitionId> {
        let trigger = self.trigger.unwrap_or(Trigger::Completion);
        self.builder.push_transition(
            self.source,
            self.target,
            self.kind,
            trigger,
            self.guard,
            self.effect,
        )
    }
}

impl std::fmt::Debug for TransitionBuilder<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransitionBuilder")
            .field("source", &self.source)
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}
