//! Configuration: the set of currently active vertices
//!
//! Owned exclusively by the interpreter and mutated only between the
//! synchronous phases of a step. Regions and composite ancestors are
//! tracked explicitly so activity queries stay O(1); the leaf view is
//! derived on demand in declaration order.

use std::collections::{HashMap, HashSet};

use crate::model::ModelGraph;
use crate::types::{PseudostateKind, VertexId, VertexKind};

/// Snapshot taken at the start of a step, restored if the step aborts.
#[derive(Clone, Debug, Default)]
pub(crate) struct ConfigSnapshot {
    active: HashSet<VertexId>,
    completed_regions: HashSet<VertexId>,
    completion_emitted: HashSet<VertexId>,
}

/// The mutable active-state bookkeeping of one machine instance.
#[derive(Debug, Default)]
pub(crate) struct Configuration {
    active: HashSet<VertexId>,
    completed_regions: HashSet<VertexId>,
    /// States whose completion event was already emitted during the
    /// current stay; cleared on exit.
    completion_emitted: HashSet<VertexId>,
    /// Region -> last active direct child, recorded on exit.
    shallow_history: HashMap<VertexId, VertexId>,
    /// Region -> last active leaf set, recorded on exit.
    deep_history: HashMap<VertexId, Vec<VertexId>>,
}

impl Configuration {
    pub(crate) fn new() -> Self {
        Configuration::default()
    }

    pub(crate) fn snapshot(&self) -> ConfigSnapshot {
        ConfigSnapshot {
            active: self.active.clone(),
            completed_regions: self.completed_regions.clone(),
            completion_emitted: self.completion_emitted.clone(),
        }
    }

    /// Restore the pre-step configuration. History records are kept:
    /// they describe exits that actually ran and are committed.
    pub(crate) fn restore(&mut self, snapshot: ConfigSnapshot) {
        self.active = snapshot.active;
        self.completed_regions = snapshot.completed_regions;
        self.completion_emitted = snapshot.completion_emitted;
    }

    pub(crate) fn add(&mut self, vertex: VertexId) {
        self.active.insert(vertex);
    }

    pub(crate) fn remove(&mut self, graph: &ModelGraph, vertex: VertexId) {
        self.active.remove(&vertex);
        self.completion_emitted.remove(&vertex);
        match graph.kind(vertex) {
            VertexKind::Final => {
                if let Some(region) = graph.parent(vertex) {
                    self.completed_regions.remove(&region);
                }
            }
            VertexKind::State => {
                // Drop the composite's regions along with it.
                for &region in graph.regions(vertex) {
                    self.active.remove(&region);
                    self.completed_regions.remove(&region);
                }
            }
            _ => {}
        }
    }

    pub(crate) fn is_active(&self, vertex: VertexId) -> bool {
        self.active.contains(&vertex)
    }

    pub(crate) fn clear(&mut self) {
        self.active.clear();
        self.completed_regions.clear();
        self.completion_emitted.clear();
    }

    /// Active leaves (leaf states and final states) in declaration
    /// order, derived by walking the tree from the root.
    pub(crate) fn active_leaves(&self, graph: &ModelGraph) -> Vec<VertexId> {
        let mut leaves = Vec::new();
        if self.active.contains(&graph.root()) {
            self.collect_leaves(graph, graph.root(), &mut leaves);
        }
        leaves
    }

    fn collect_leaves(&self, graph: &ModelGraph, state: VertexId, out: &mut Vec<VertexId>) {
        let regions = graph.regions(state);
        if regions.is_empty() {
            out.push(state);
            return;
        }
        let mut any_child = false;
        for &region in regions {
            for &child in graph.children(region) {
                if !self.active.contains(&child) {
                    continue;
                }
                any_child = true;
                match graph.kind(child) {
                    VertexKind::State => self.collect_leaves(graph, child, out),
                    VertexKind::Final => out.push(child),
                    _ => {}
                }
            }
        }
        if !any_child {
            out.push(state);
        }
    }

    /// The deepest active state whose deferral declaration matches the
    /// given event kind name.
    pub(crate) fn innermost_deferring(
        &self,
        graph: &ModelGraph,
        kind_name: &str,
    ) -> Option<VertexId> {
        self.active
            .iter()
            .filter(|&&v| {
                graph.kind(v) == VertexKind::State
                    && graph.deferred_kinds(v).iter().any(|k| k == kind_name)
            })
            .max_by_key(|&&v| (graph.depth(v), std::cmp::Reverse(v)))
            .copied()
    }

    pub(crate) fn mark_region_completed(&mut self, region: VertexId) {
        self.completed_regions.insert(region);
    }

    pub(crate) fn is_region_completed(&self, region: VertexId) -> bool {
        self.completed_regions.contains(&region)
    }

    /// Whether every region of `composite` has reached its final state.
    pub(crate) fn all_regions_completed(&self, graph: &ModelGraph, composite: VertexId) -> bool {
        let regions = graph.regions(composite);
        !regions.is_empty()
            && regions
                .iter()
                .all(|region| self.completed_regions.contains(region))
    }

    /// Mark that `state`'s completion event was emitted; returns false
    /// when one was already emitted during this stay.
    pub(crate) fn mark_completion_emitted(&mut self, state: VertexId) -> bool {
        self.completion_emitted.insert(state)
    }

    /// Record history for `region` before its contents are exited.
    /// A no-op unless the region owns a history pseudostate.
    pub(crate) fn record_history(&mut self, graph: &ModelGraph, region: VertexId) {
        let Some((_, kind)) = graph.history_of(region) else {
            return;
        };
        let active_child = graph
            .children(region)
            .iter()
            .copied()
            .find(|&c| self.active.contains(&c) && graph.kind(c) == VertexKind::State);
        let Some(child) = active_child else {
            return;
        };
        match kind {
            PseudostateKind::ShallowHistory => {
                self.shallow_history.insert(region, child);
            }
            PseudostateKind::DeepHistory => {
                let mut leaves = Vec::new();
                self.collect_leaves(graph, child, &mut leaves);
                self.deep_history.insert(region, leaves);
            }
            _ => unreachable!("history_of returns history kinds only"),
        }
    }

    pub(crate) fn shallow_record(&self, region: VertexId) -> Option<VertexId> {
        self.shallow_history.get(&region).copied()
    }

    pub(crate) fn deep_record(&self, region: VertexId) -> Option<&[VertexId]> {
        self.deep_history.get(&region).map(|v| v.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ModelBuilder;

    #[test]
    fn leaves_follow_declaration_order() {
        let mut b = ModelBuilder::new("m");
        let region = b.region(b.root(), "r").unwrap();
        let composite = b.state(region, "c").unwrap();
        let r1 = b.region(composite, "r1").unwrap();
        let r2 = b.region(composite, "r2").unwrap();
        let a = b.state(r1, "a").unwrap();
        let z = b.state(r2, "z").unwrap();
        b.initial(region, composite).unwrap();
        b.initial(r1, a).unwrap();
        b.initial(r2, z).unwrap();
        let graph = b.freeze().unwrap();

        let mut config = Configuration::new();
        for v in [graph.root(), region, composite, r1, r2, a, z] {
            config.add(v);
        }
        assert_eq!(config.active_leaves(&graph), vec![a, z]);

        config.remove(&graph, a);
        assert_eq!(config.active_leaves(&graph), vec![z]);
    }

    #[test]
    fn innermost_deferral_wins() {
        let mut b = ModelBuilder::new("m");
        let region = b.region(b.root(), "r").unwrap();
        let outer = b.state(region, "outer").unwrap();
        let ir = b.region(outer, "ir").unwrap();
        let inner = b.state(ir, "inner").unwrap();
        b.initial(region, outer).unwrap();
        b.initial(ir, inner).unwrap();
        b.defer(outer, ["E"]).unwrap();
        b.defer(inner, ["E"]).unwrap();
        let graph = b.freeze().unwrap();

        let mut config = Configuration::new();
        for v in [graph.root(), region, outer, ir, inner] {
            config.add(v);
        }
        assert_eq!(config.innermost_deferring(&graph, "E"), Some(inner));
        assert_eq!(config.innermost_deferring(&graph, "F"), None);
    }
}
