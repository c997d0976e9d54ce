//! Arena-based hypotheses graph with dense property maps
//!
//! Nodes and arcs are index handles into arenas; all attributes live in
//! dense vectors indexed by those handles. Solution labels are append-only
//! per-iteration lists so multiple (perturbed) solutions coexist on the
//! same graph.

use serde::Serialize;
use smallvec::SmallVec;

use crate::errors::TrackingError;
use crate::traxels::TraxelKey;

/// Handle of a node in a [`HypothesesGraph`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct NodeId(pub u32);

/// Handle of an arc in a [`HypothesesGraph`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ArcId(pub u32);

impl NodeId {
    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl ArcId {
    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Per-node incident arcs; fan-out is small in practice
type ArcList = SmallVec<[ArcId; 4]>;

#[derive(Debug, Clone)]
struct NodeData {
    traxels: SmallVec<[TraxelKey; 1]>,
    timestep: u32,
    incoming: ArcList,
    outgoing: ArcList,
    pruned: bool,
}

#[derive(Debug, Clone)]
struct ArcData {
    source: NodeId,
    target: NodeId,
    pruned: bool,
}

/// The temporal candidate graph.
///
/// Built once by a hypotheses builder, augmented with decision-variable
/// bindings by the model builder, and mutated only by the solution writer
/// (labels) and the merger resolver (sub-node splitting).
#[derive(Debug, Clone, Default)]
pub struct HypothesesGraph {
    nodes: Vec<NodeData>,
    arcs: Vec<ArcData>,

    // property maps, dense over node/arc indices
    node_active_count: Vec<Vec<u32>>,
    node_division_active: Vec<Vec<bool>>,
    node_relative_uncertainty: Vec<f64>,
    arc_distance: Vec<f64>,
    arc_active_count: Vec<Vec<u32>>,

    /// Set on derived tracklet views; re-compression is rejected
    pub(crate) is_tracklet_view: bool,
}

impl HypothesesGraph {
    /// Create an empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node for a single traxel
    pub fn add_node(&mut self, traxel: TraxelKey) -> NodeId {
        self.add_chain_node(SmallVec::from_elem(traxel, 1), traxel.timestep)
    }

    /// Add a node representing a chain of traxels (tracklet views)
    pub(crate) fn add_chain_node(
        &mut self,
        traxels: SmallVec<[TraxelKey; 1]>,
        timestep: u32,
    ) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(NodeData {
            traxels,
            timestep,
            incoming: ArcList::new(),
            outgoing: ArcList::new(),
            pruned: false,
        });
        self.node_active_count.push(Vec::new());
        self.node_division_active.push(Vec::new());
        self.node_relative_uncertainty.push(0.0);
        id
    }

    /// Add a candidate transition arc.
    ///
    /// Arcs must point forward in time; base graphs additionally require
    /// consecutive timesteps (tracklet views span compressed chains).
    pub fn add_arc(&mut self, source: NodeId, target: NodeId) -> Result<ArcId, TrackingError> {
        let ts = self.timestep(source);
        let tt = self.timestep(target);
        if tt <= ts {
            return Err(TrackingError::config(format!(
                "arc must advance in time: {} -> {}",
                ts, tt
            )));
        }
        if !self.is_tracklet_view && tt != ts + 1 {
            return Err(TrackingError::config(format!(
                "arc must connect consecutive timesteps: {} -> {}",
                ts, tt
            )));
        }
        let id = ArcId(self.arcs.len() as u32);
        self.arcs.push(ArcData {
            source,
            target,
            pruned: false,
        });
        self.nodes[source.index()].outgoing.push(id);
        self.nodes[target.index()].incoming.push(id);
        self.arc_distance.push(0.0);
        self.arc_active_count.push(Vec::new());
        Ok(id)
    }

    // ------------------------------------------------------------------
    // topology accessors
    // ------------------------------------------------------------------

    /// Number of nodes (including pruned)
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of arcs (including pruned)
    pub fn arc_count(&self) -> usize {
        self.arcs.len()
    }

    /// Iterate all unpruned nodes
    pub fn nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| !n.pruned)
            .map(|(i, _)| NodeId(i as u32))
    }

    /// Iterate all unpruned arcs
    pub fn arcs(&self) -> impl Iterator<Item = ArcId> + '_ {
        self.arcs
            .iter()
            .enumerate()
            .filter(|(_, a)| !a.pruned)
            .map(|(i, _)| ArcId(i as u32))
    }

    /// Unpruned nodes at one timestep
    pub fn nodes_at(&self, timestep: u32) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes().filter(move |n| self.timestep(*n) == timestep)
    }

    /// All timesteps with at least one unpruned node, ascending
    pub fn timesteps(&self) -> Vec<u32> {
        let mut ts: Vec<u32> = self.nodes().map(|n| self.timestep(n)).collect();
        ts.sort_unstable();
        ts.dedup();
        ts
    }

    /// Timestep of a node (for tracklet nodes: timestep of the first
    /// chain member)
    #[inline]
    pub fn timestep(&self, node: NodeId) -> u32 {
        self.nodes[node.index()].timestep
    }

    /// Traxels represented by a node, in chain order
    #[inline]
    pub fn node_traxels(&self, node: NodeId) -> &[TraxelKey] {
        &self.nodes[node.index()].traxels
    }

    /// First traxel of a node's chain
    #[inline]
    pub fn first_traxel(&self, node: NodeId) -> TraxelKey {
        self.nodes[node.index()].traxels[0]
    }

    /// Last traxel of a node's chain
    #[inline]
    pub fn last_traxel(&self, node: NodeId) -> TraxelKey {
        *self.nodes[node.index()]
            .traxels
            .last()
            .expect("node without traxels")
    }

    /// Incoming arcs of a node
    pub fn in_arcs(&self, node: NodeId) -> impl Iterator<Item = ArcId> + '_ {
        self.nodes[node.index()]
            .incoming
            .iter()
            .copied()
            .filter(|a| !self.arcs[a.index()].pruned)
    }

    /// Outgoing arcs of a node
    pub fn out_arcs(&self, node: NodeId) -> impl Iterator<Item = ArcId> + '_ {
        self.nodes[node.index()]
            .outgoing
            .iter()
            .copied()
            .filter(|a| !self.arcs[a.index()].pruned)
    }

    /// Number of unpruned incoming arcs
    pub fn in_degree(&self, node: NodeId) -> usize {
        self.in_arcs(node).count()
    }

    /// Number of unpruned outgoing arcs
    pub fn out_degree(&self, node: NodeId) -> usize {
        self.out_arcs(node).count()
    }

    /// Source node of an arc
    #[inline]
    pub fn source(&self, arc: ArcId) -> NodeId {
        self.arcs[arc.index()].source
    }

    /// Target node of an arc
    #[inline]
    pub fn target(&self, arc: ArcId) -> NodeId {
        self.arcs[arc.index()].target
    }

    // ------------------------------------------------------------------
    // property maps
    // ------------------------------------------------------------------

    /// Geometric distance attached to an arc
    #[inline]
    pub fn arc_distance(&self, arc: ArcId) -> f64 {
        self.arc_distance[arc.index()]
    }

    /// Set the geometric distance of an arc
    pub fn set_arc_distance(&mut self, arc: ArcId, distance: f64) {
        self.arc_distance[arc.index()] = distance;
    }

    /// Number of solution iterations recorded so far
    pub fn iterations(&self) -> usize {
        self.node_active_count.first().map_or(0, |v| v.len())
    }

    /// Append one iteration's labels for a node
    pub fn push_node_labels(&mut self, node: NodeId, active_count: u32, division: bool) {
        self.node_active_count[node.index()].push(active_count);
        self.node_division_active[node.index()].push(division);
    }

    /// Append one iteration's activity for an arc
    pub fn push_arc_label(&mut self, arc: ArcId, active_count: u32) {
        self.arc_active_count[arc.index()].push(active_count);
    }

    /// Active object count of a node in one solution iteration
    pub fn active_count(&self, node: NodeId, iteration: usize) -> u32 {
        self.node_active_count[node.index()]
            .get(iteration)
            .copied()
            .unwrap_or(0)
    }

    /// Division flag of a node in one solution iteration
    pub fn division_active(&self, node: NodeId, iteration: usize) -> bool {
        self.node_division_active[node.index()]
            .get(iteration)
            .copied()
            .unwrap_or(false)
    }

    /// Activity (units of flow) of an arc in one solution iteration
    pub fn arc_active(&self, arc: ArcId, iteration: usize) -> u32 {
        self.arc_active_count[arc.index()]
            .get(iteration)
            .copied()
            .unwrap_or(0)
    }

    /// Per-iteration active counts of a node
    pub fn active_counts(&self, node: NodeId) -> &[u32] {
        &self.node_active_count[node.index()]
    }

    /// Relative uncertainty of a node (fraction of iterations active)
    pub fn relative_uncertainty(&self, node: NodeId) -> f64 {
        self.node_relative_uncertainty[node.index()]
    }

    /// Set the relative uncertainty of a node
    pub fn set_relative_uncertainty(&mut self, node: NodeId, value: f64) {
        self.node_relative_uncertainty[node.index()] = value;
    }

    /// Drop all recorded solution labels, keeping the topology
    pub fn clear_labels(&mut self) {
        for v in self.node_active_count.iter_mut() {
            v.clear();
        }
        for v in self.node_division_active.iter_mut() {
            v.clear();
        }
        for v in self.arc_active_count.iter_mut() {
            v.clear();
        }
    }

    // ------------------------------------------------------------------
    // pruning
    // ------------------------------------------------------------------

    /// Prune all nodes and arcs inactive in the given iteration.
    ///
    /// Returns (pruned nodes, pruned arcs). Pruned elements are skipped by
    /// all iterators but keep their indices, so labels stay valid.
    pub fn prune_inactive(&mut self, iteration: usize) -> (usize, usize) {
        let mut nodes = 0;
        let mut arcs = 0;
        for i in 0..self.nodes.len() {
            if !self.nodes[i].pruned && self.active_count(NodeId(i as u32), iteration) == 0 {
                self.nodes[i].pruned = true;
                nodes += 1;
            }
        }
        for i in 0..self.arcs.len() {
            if self.arcs[i].pruned {
                continue;
            }
            let a = ArcId(i as u32);
            if self.arc_active(a, iteration) == 0
                || self.nodes[self.source(a).index()].pruned
                || self.nodes[self.target(a).index()].pruned
            {
                self.arcs[i].pruned = true;
                arcs += 1;
            }
        }
        (nodes, arcs)
    }

    /// Mark a single node (and its incident arcs) as pruned
    pub fn prune_node(&mut self, node: NodeId) {
        self.nodes[node.index()].pruned = true;
        let incident: Vec<ArcId> = self
            .nodes[node.index()]
            .incoming
            .iter()
            .chain(self.nodes[node.index()].outgoing.iter())
            .copied()
            .collect();
        for arc in incident {
            self.arcs[arc.index()].pruned = true;
        }
    }

    /// Whether a node has been pruned
    pub fn is_pruned(&self, node: NodeId) -> bool {
        self.nodes[node.index()].pruned
    }
}
