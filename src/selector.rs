//! Transition selection: the maximal consistent set of enabled
//! transitions for one event against the current configuration
//!
//! Selection walks each active leaf's ancestor chain inner-first, keeps
//! the deepest enabled transition per chain, expands static pseudostate
//! chains (junction, fork, join), and resolves conflicts by exit-set
//! intersection with the deeper source winning. Choice and history
//! targets stay unresolved until the entry phase.

use std::collections::HashSet;
use std::time::Duration;

use tracing::debug;

use crate::config::Configuration;
use crate::error::{SfError, SfResult};
use crate::event::{Event, EventKind};
use crate::handlers::evaluate_guard;
use crate::model::{ModelGraph, Transition};
use crate::types::{PseudostateKind, TransitionId, TransitionKind, Trigger, VertexId, VertexKind};

/// A selected compound transition: one triggering transition plus any
/// statically expanded pseudostate segments.
#[derive(Debug)]
pub(crate) struct Compound {
    /// The transition that matched the event
    pub primary: TransitionId,
    /// Source of the primary transition, used for conflict depth
    pub source: VertexId,
    /// Transitions whose effects run, in order
    pub segments: Vec<TransitionId>,
    /// Exit set, inner to outer
    pub exit_set: Vec<VertexId>,
    /// Immediate entry targets (choice/history resolved at entry time)
    pub targets: Vec<VertexId>,
    /// Vertex below which entry paths are computed; `None` for internal
    pub scope: Option<VertexId>,
}

/// Whether `transition`'s trigger matches `event`.
pub(crate) fn trigger_matches(transition: &Transition, event: &Event) -> bool {
    match (&transition.trigger, event.kind()) {
        (Trigger::Signal(want), EventKind::Signal(got)) => want == got,
        (Trigger::Change(want), EventKind::Change(got)) => want == got,
        (Trigger::Any, EventKind::Signal(_)) | (Trigger::Any, EventKind::Change(_)) => true,
        (Trigger::Completion, EventKind::Completion(source)) => *source == transition.source,
        (
            Trigger::After(want),
            EventKind::TimeElapsed { source, duration },
        ) => *source == transition.source && duration == want,
        _ => false,
    }
}

/// Evaluate a transition's guard; `Ok(true)` when absent.
pub(crate) fn check_guard(
    graph: &ModelGraph,
    transition: &Transition,
    event: &Event,
) -> SfResult<bool> {
    match &transition.guard {
        None => Ok(true),
        Some(guard) => evaluate_guard(guard, event).ok_or_else(|| SfError::GuardImpure {
            transition: format!(
                "{} -> {}",
                graph.qualified_name(transition.source),
                graph.qualified_name(transition.target)
            ),
        }),
    }
}

/// Produce the transition set for `event` against `config`.
pub(crate) fn select(
    graph: &ModelGraph,
    config: &Configuration,
    event: &Event,
) -> SfResult<Vec<Compound>> {
    let mut candidates: Vec<Compound> = Vec::new();
    let mut seen_primary: HashSet<TransitionId> = HashSet::new();

    for leaf in config.active_leaves(graph) {
        let mut cursor = Some(leaf);
        while let Some(vertex) = cursor {
            let is_state = matches!(graph.kind(vertex), VertexKind::State | VertexKind::Final);
            if is_state && config.is_active(vertex) {
                if let Some(compound) = enable_at(graph, config, event, vertex)? {
                    if seen_primary.insert(compound.primary) {
                        debug!(
                            source = graph.qualified_name(compound.source),
                            transition = %compound.primary,
                            "transition enabled"
                        );
                        candidates.push(compound);
                    }
                    break;
                }
            }
            cursor = graph.parent(vertex);
        }
    }

    // Deeper sources win conflicts; ties break by declaration order.
    candidates.sort_by(|a, b| {
        graph
            .depth(b.source)
            .cmp(&graph.depth(a.source))
            .then(a.primary.cmp(&b.primary))
    });

    let mut selected = Vec::new();
    let mut exited: HashSet<VertexId> = HashSet::new();
    for compound in candidates {
        if compound.exit_set.iter().any(|v| exited.contains(v)) {
            debug!(transition = %compound.primary, "transition lost conflict");
            continue;
        }
        exited.extend(compound.exit_set.iter().copied());
        selected.push(compound);
    }
    Ok(selected)
}

/// First enabled transition out of `vertex`, expanded into a compound.
fn enable_at(
    graph: &ModelGraph,
    config: &Configuration,
    event: &Event,
    vertex: VertexId,
) -> SfResult<Option<Compound>> {
    for &t in graph.transitions_out(vertex) {
        let transition = graph.transition(t);
        if !trigger_matches(transition, event) {
            continue;
        }
        if !check_guard(graph, transition, event)? {
            continue;
        }
        if let Some(compound) = expand(graph, config, event, t)? {
            return Ok(Some(compound));
        }
    }
    Ok(None)
}

/// Expand a matched transition through junction/fork/join chains.
/// Returns `None` when a static chain is not traversable (junction with
/// no passing branch, join with inactive sources).
fn expand(
    graph: &ModelGraph,
    config: &Configuration,
    event: &Event,
    primary: TransitionId,
) -> SfResult<Option<Compound>> {
    let first = graph.transition(primary);
    let source = first.source;
    let mut segments = vec![primary];
    let mut exit_sources = vec![source];
    let mut targets = Vec::new();
    let mut cursor = first.target;
    let mut visited: HashSet<VertexId> = HashSet::new();

    loop {
        if !visited.insert(cursor) {
            // A cyclic junction chain never reaches a real state.
            return Ok(None);
        }
        match graph.kind(cursor) {
            VertexKind::Pseudo(PseudostateKind::Junction) => {
                let mut advanced = false;
                for &t in graph.transitions_out(cursor) {
                    let branch = graph.transition(t);
                    if check_guard(graph, branch, event)? {
                        segments.push(t);
                        cursor = branch.target;
                        advanced = true;
                        break;
                    }
                }
                if !advanced {
                    return Ok(None);
                }
            }
            VertexKind::Pseudo(PseudostateKind::Fork) => {
                for &t in graph.transitions_out(cursor) {
                    segments.push(t);
                    targets.push(graph.transition(t).target);
                }
                break;
            }
            VertexKind::Pseudo(PseudostateKind::Join) => {
                for &t in graph.transitions_in(cursor) {
                    let incoming = graph.transition(t);
                    if !config.is_active(incoming.source) {
                        return Ok(None);
                    }
                    let armed = matches!(incoming.trigger, Trigger::Completion)
                        || trigger_matches(incoming, event);
                    if !armed || !check_guard(graph, incoming, event)? {
                        return Ok(None);
                    }
                }
                for &t in graph.transitions_in(cursor) {
                    if t != primary {
                        segments.push(t);
                        exit_sources.push(graph.transition(t).source);
                    }
                }
                let out = graph.transitions_out(cursor)[0];
                segments.push(out);
                cursor = graph.transition(out).target;
            }
            _ => {
                targets.push(cursor);
                break;
            }
        }
    }

    if first.kind == TransitionKind::Internal {
        return Ok(Some(Compound {
            primary,
            source,
            segments,
            exit_set: Vec::new(),
            targets: Vec::new(),
            scope: None,
        }));
    }

    // Domain: LCA over every exit-side source and statically reachable
    // endpoint (all possible choice branches included).
    let mut endpoints = exit_sources.clone();
    let mut seen = HashSet::new();
    for &target in &targets {
        collect_static_endpoints(graph, target, &mut endpoints, &mut seen);
    }
    let mut domain = endpoints[0];
    for &e in &endpoints[1..] {
        domain = graph.lca(domain, e);
    }

    // External transitions exit the domain state itself; local ones
    // keep it active.
    if first.kind == TransitionKind::External && graph.kind(domain) == VertexKind::State {
        if let Some(parent) = graph.parent(domain) {
            domain = parent;
        }
    }

    let exit_roots = match graph.kind(domain) {
        VertexKind::Region => active_child_of(graph, config, domain)
            .into_iter()
            .collect(),
        VertexKind::State if first.kind == TransitionKind::Local => {
            // Containing composite: exit every active subtree below it.
            graph
                .regions(domain)
                .iter()
                .filter_map(|&region| active_child_of(graph, config, region))
                .collect()
        }
        VertexKind::State => {
            // External across sibling regions of `domain` (the root,
            // typically): exit only the source-side subtrees.
            let mut roots = Vec::new();
            for &s in &exit_sources {
                if let Some(region) = graph.child_toward(domain, s) {
                    if let Some(root) = active_child_of(graph, config, region) {
                        if !roots.contains(&root) {
                            roots.push(root);
                        }
                    }
                }
            }
            roots
        }
        _ => Vec::new(),
    };

    let mut exit_set = Vec::new();
    for &root in &exit_roots {
        collect_active_subtree(graph, config, root, &mut exit_set);
    }
    exit_set.sort_by(|&a, &b| {
        graph
            .depth(b)
            .cmp(&graph.depth(a))
            .then(a.cmp(&b))
    });
    exit_set.dedup();

    Ok(Some(Compound {
        primary,
        source,
        segments,
        exit_set,
        targets,
        scope: Some(domain),
    }))
}

/// All real vertices a target can statically resolve to, following
/// choice/junction/fork/history chains.
fn collect_static_endpoints(
    graph: &ModelGraph,
    vertex: VertexId,
    out: &mut Vec<VertexId>,
    seen: &mut HashSet<VertexId>,
) {
    if !seen.insert(vertex) {
        return;
    }
    match graph.kind(vertex) {
        VertexKind::Pseudo(PseudostateKind::Choice)
        | VertexKind::Pseudo(PseudostateKind::Junction)
        | VertexKind::Pseudo(PseudostateKind::Fork) => {
            for &t in graph.transitions_out(vertex) {
                collect_static_endpoints(graph, graph.transition(t).target, out, seen);
            }
        }
        VertexKind::Pseudo(PseudostateKind::ShallowHistory)
        | VertexKind::Pseudo(PseudostateKind::DeepHistory) => {
            // The history vertex pins its region; the record is inside it.
            out.push(vertex);
            for &t in graph.transitions_out(vertex) {
                collect_static_endpoints(graph, graph.transition(t).target, out, seen);
            }
        }
        _ => out.push(vertex),
    }
}

/// The active direct child (state or final) of a region, if any.
fn active_child_of(
    graph: &ModelGraph,
    config: &Configuration,
    region: VertexId,
) -> Option<VertexId> {
    graph
        .children(region)
        .iter()
        .copied()
        .find(|&c| {
            config.is_active(c)
                && matches!(graph.kind(c), VertexKind::State | VertexKind::Final)
        })
}

/// Collect the active states and finals of `root`'s subtree, inclusive.
fn collect_active_subtree(
    graph: &ModelGraph,
    config: &Configuration,
    root: VertexId,
    out: &mut Vec<VertexId>,
) {
    if !config.is_active(root) {
        return;
    }
    out.push(root);
    for &region in graph.regions(root) {
        for &child in graph.children(region) {
            if matches!(graph.kind(child), VertexKind::State | VertexKind::Final) {
                collect_active_subtree(graph, config, child, out);
            }
        }
    }
}

/// The `after` durations declared on transitions leaving `state`, in
/// declaration order; used by the timer service on entry.
pub(crate) fn after_durations(graph: &ModelGraph, state: VertexId) -> Vec<Duration> {
    graph
        .transitions_out(state)
        .iter()
        .filter_map(|&t| match graph.transition(t).trigger {
            Trigger::After(duration) => Some(duration),
            _ => None,
        })
        .collect()
}
