//! Frozen model graph: the immutable tree of states, regions,
//! pseudostates, and transitions
//!
//! The graph is an arena addressed by [`VertexId`] / [`TransitionId`];
//! parent links are ids, so the tree carries no reference cycles. All
//! structural queries are O(depth) or better. A graph is produced by
//! [`crate::ModelBuilder::freeze`] and never mutated afterwards.

use std::collections::HashMap;
use std::fmt;

use crate::handlers::{ActivityHandler, BehaviorHandler, GuardHandler};
use crate::types::{PseudostateKind, TransitionId, TransitionKind, Trigger, VertexId, VertexKind};

/// A single vertex of the model tree.
#[derive(Debug)]
pub struct Vertex {
    pub(crate) id: VertexId,
    pub(crate) name: String,
    pub(crate) kind: VertexKind,
    pub(crate) parent: Option<VertexId>,
    /// Children in declaration order: regions for a composite state,
    /// subvertices for a region.
    pub(crate) children: Vec<VertexId>,
    /// Outgoing transitions in declaration order.
    pub(crate) outgoing: Vec<TransitionId>,
    pub(crate) incoming: Vec<TransitionId>,
    /// Event kind names this state defers while active.
    pub(crate) deferred: Vec<String>,
}

/// A transition between two vertices.
pub struct Transition {
    pub(crate) id: TransitionId,
    pub(crate) source: VertexId,
    pub(crate) target: VertexId,
    pub(crate) kind: TransitionKind,
    pub(crate) trigger: Trigger,
    pub(crate) guard: Option<GuardHandler>,
    pub(crate) effect: Option<BehaviorHandler>,
}

impl Transition {
    /// Source vertex id.
    pub fn source(&self) -> VertexId {
        self.source
    }

    /// Target vertex id.
    pub fn target(&self) -> VertexId {
        self.target
    }

    /// Trigger discriminator.
    pub fn trigger(&self) -> &Trigger {
        &self.trigger
    }

    /// Hierarchy relation of this transition.
    pub fn kind(&self) -> TransitionKind {
        self.kind
    }
}

impl fmt::Debug for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transition")
            .field("id", &self.id)
            .field("source", &self.source)
            .field("target", &self.target)
            .field("kind", &self.kind)
            .field("trigger", &self.trigger)
            .field("guarded", &self.guard.is_some())
            .finish()
    }
}

/// Behavior slots a state can populate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum BehaviorSlot {
    Entry,
    Exit,
}

/// Lookup table from (state, lifecycle slot) to behavior handle.
/// Missing entries are no-ops.
#[derive(Default)]
pub(crate) struct BehaviorTable {
    pub(crate) behaviors: HashMap<(VertexId, BehaviorSlot), BehaviorHandler>,
    pub(crate) activities: HashMap<VertexId, ActivityHandler>,
}

impl fmt::Debug for BehaviorTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BehaviorTable")
            .field("behaviors", &self.behaviors.len())
            .field("activities", &self.activities.len())
            .finish()
    }
}

/// The frozen model graph shared read-only by every component.
pub struct ModelGraph {
    pub(crate) name: String,
    pub(crate) root: VertexId,
    pub(crate) vertices: Vec<Vertex>,
    pub(crate) transitions: Vec<Transition>,
    pub(crate) behaviors: BehaviorTable,
    /// Dot-joined path below the root, e.g. `power.on.light.off`.
    pub(crate) qualified: Vec<String>,
}

impl ModelGraph {
    /// Name the model was built under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The root composite state.
    pub fn root(&self) -> VertexId {
        self.root
    }

    pub(crate) fn vertex(&self, id: VertexId) -> &Vertex {
        &self.vertices[id.index()]
    }

    /// The transition behind an id.
    pub fn transition(&self, id: TransitionId) -> &Transition {
        &self.transitions[id.index()]
    }

    /// Kind of a vertex.
    pub fn kind(&self, id: VertexId) -> VertexKind {
        self.vertex(id).kind
    }

    /// Declared (unqualified) name of a vertex.
    pub fn vertex_name(&self, id: VertexId) -> &str {
        &self.vertex(id).name
    }

    /// Dot-joined path below the root, e.g. `power.on.light.off`.
    pub fn qualified_name(&self, id: VertexId) -> &str {
        &self.qualified[id.index()]
    }

    /// Parent vertex, `None` for the root.
    pub fn parent(&self, id: VertexId) -> Option<VertexId> {
        self.vertex(id).parent
    }

    /// Children in declaration order.
    pub fn children(&self, id: VertexId) -> &[VertexId] {
        &self.vertex(id).children
    }

    /// Regions of a composite state (its direct children); empty for a
    /// leaf state.
    pub fn regions(&self, id: VertexId) -> &[VertexId] {
        match self.vertex(id).kind {
            VertexKind::State => &self.vertex(id).children,
            _ => &[],
        }
    }

    /// Whether a state owns at least one region.
    pub fn is_composite(&self, id: VertexId) -> bool {
        self.vertex(id).kind == VertexKind::State && !self.vertex(id).children.is_empty()
    }

    /// Whether a vertex is a state with no regions.
    pub fn is_leaf_state(&self, id: VertexId) -> bool {
        self.vertex(id).kind == VertexKind::State && self.vertex(id).children.is_empty()
    }

    /// Outgoing transitions in declaration order.
    pub fn transitions_out(&self, id: VertexId) -> &[TransitionId] {
        &self.vertex(id).outgoing
    }

    pub(crate) fn transitions_in(&self, id: VertexId) -> &[TransitionId] {
        &self.vertex(id).incoming
    }

    /// Ancestor chain of `id`, root first, excluding `id` itself.
    pub fn ancestors(&self, id: VertexId) -> Vec<VertexId> {
        let mut chain = Vec::new();
        let mut cursor = self.vertex(id).parent;
        while let Some(v) = cursor {
            chain.push(v);
            cursor = self.vertex(v).parent;
        }
        chain.reverse();
        chain
    }

    /// Number of edges between `id` and the root.
    pub fn depth(&self, id: VertexId) -> usize {
        let mut depth = 0;
        let mut cursor = self.vertex(id).parent;
        while let Some(v) = cursor {
            depth += 1;
            cursor = self.vertex(v).parent;
        }
        depth
    }

    /// Whether `descendant` lies strictly below `ancestor`.
    pub fn is_descendant(&self, descendant: VertexId, ancestor: VertexId) -> bool {
        let mut cursor = self.vertex(descendant).parent;
        while let Some(v) = cursor {
            if v == ancestor {
                return true;
            }
            cursor = self.vertex(v).parent;
        }
        false
    }

    /// Lowest common ancestor of `a` and `b` (may be `a` or `b` itself).
    pub fn lca(&self, a: VertexId, b: VertexId) -> VertexId {
        if a == b {
            return a;
        }
        if self.is_descendant(b, a) {
            return a;
        }
        if self.is_descendant(a, b) {
            return b;
        }
        let mut chain_a = self.ancestors(a);
        chain_a.push(a);
        let mut chain_b = self.ancestors(b);
        chain_b.push(b);
        let mut lca = self.root;
        for (x, y) in chain_a.iter().zip(chain_b.iter()) {
            if x != y {
                break;
            }
            lca = *x;
        }
        lca
    }

    /// The ancestor-or-self of `of` whose parent is `below`.
    pub(crate) fn child_toward(&self, below: VertexId, of: VertexId) -> Option<VertexId> {
        if self.vertex(of).parent == Some(below) {
            return Some(of);
        }
        let mut cursor = of;
        while let Some(parent) = self.vertex(cursor).parent {
            if parent == below {
                return Some(cursor);
            }
            cursor = parent;
        }
        None
    }

    /// The initial pseudostate of a region.
    pub(crate) fn initial_of(&self, region: VertexId) -> Option<VertexId> {
        self.vertex(region)
            .children
            .iter()
            .copied()
            .find(|&c| self.vertex(c).kind == VertexKind::Pseudo(PseudostateKind::Initial))
    }

    /// The history pseudostate of a region, if any.
    pub(crate) fn history_of(&self, region: VertexId) -> Option<(VertexId, PseudostateKind)> {
        self.vertex(region).children.iter().copied().find_map(|c| {
            match self.vertex(c).kind {
                VertexKind::Pseudo(kind @ PseudostateKind::ShallowHistory)
                | VertexKind::Pseudo(kind @ PseudostateKind::DeepHistory) => Some((c, kind)),
                _ => None,
            }
        })
    }

    /// Event kind names deferred by a state while it is active.
    pub(crate) fn deferred_kinds(&self, id: VertexId) -> &[String] {
        &self.vertex(id).deferred
    }

    pub(crate) fn entry_behavior(&self, id: VertexId) -> Option<&BehaviorHandler> {
        self.behaviors.behaviors.get(&(id, BehaviorSlot::Entry))
    }

    pub(crate) fn exit_behavior(&self, id: VertexId) -> Option<&BehaviorHandler> {
        self.behaviors.behaviors.get(&(id, BehaviorSlot::Exit))
    }

    pub(crate) fn activity(&self, id: VertexId) -> Option<&ActivityHandler> {
        self.behaviors.activities.get(&id)
    }

    /// Look up a vertex by its qualified dot-path name.
    pub fn find(&self, qualified: &str) -> Option<VertexId> {
        self.qualified
            .iter()
            .position(|q| q == qualified)
            .map(|i| VertexId(i as u32))
    }
}

impl fmt::Debug for ModelGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelGraph")
            .field("name", &self.name)
            .field("vertices", &self.vertices.len())
            .field("transitions", &self.transitions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::builder::ModelBuilder;

    #[test]
    fn structural_queries() {
        let mut b = ModelBuilder::new("m");
        let region = b.region(b.root(), "r").unwrap();
        let outer = b.state(region, "outer").unwrap();
        let inner_region = b.region(outer, "ir").unwrap();
        let a = b.state(inner_region, "a").unwrap();
        let c = b.state(inner_region, "c").unwrap();
        b.initial(region, outer).unwrap();
        b.initial(inner_region, a).unwrap();
        b.transition(a, c).on_signal("Go").add().unwrap();
        let graph = b.freeze().unwrap();

        assert_eq!(graph.parent(a), Some(inner_region));
        assert_eq!(graph.lca(a, c), inner_region);
        assert_eq!(graph.lca(a, outer), outer);
        assert!(graph.is_descendant(a, outer));
        assert!(!graph.is_descendant(outer, a));
        assert_eq!(graph.depth(a), graph.depth(c));
        assert_eq!(graph.qualified_name(a), "r.outer.ir.a");
        assert_eq!(graph.find("r.outer.ir.a"), Some(a));
        assert_eq!(graph.child_toward(region, a), Some(outer));
        assert!(graph.is_composite(outer));
        assert!(graph.is_leaf_state(a));
    }
}
