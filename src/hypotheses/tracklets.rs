//! Tracklet compression
//!
//! Chains of traxels linked by unambiguous 1:1 transitions are compressed
//! into single nodes of a derived graph. The derived graph has its own
//! node/arc identity and carries back-reference maps onto the base graph,
//! so solutions are expanded back without aliasing.

use std::collections::BTreeMap;

use log::debug;
use smallvec::SmallVec;

use crate::errors::TrackingError;
use crate::hypotheses::graph::{ArcId, HypothesesGraph, NodeId};

/// A derived, compressed view of a base hypotheses graph.
#[derive(Debug, Clone)]
pub struct TrackletGraph {
    /// The compressed graph (its `is_tracklet_view` flag is set)
    pub graph: HypothesesGraph,
    /// Base-graph node ids per tracklet node, in chain order
    members: Vec<Vec<NodeId>>,
    /// Base-graph arc ids internal to each tracklet chain, in chain order
    internal_arcs: Vec<Vec<ArcId>>,
    /// Distances of the internal arcs, in chain order
    internal_distances: Vec<Vec<f64>>,
    /// Base arc represented by each tracklet arc
    base_arc: Vec<ArcId>,
}

impl TrackletGraph {
    /// Base-graph nodes represented by a tracklet node, in chain order
    pub fn members(&self, node: NodeId) -> &[NodeId] {
        &self.members[node.index()]
    }

    /// Base-graph arcs inside a tracklet chain
    pub fn internal_arcs(&self, node: NodeId) -> &[ArcId] {
        &self.internal_arcs[node.index()]
    }

    /// Distances of the arcs inside a tracklet chain
    pub fn internal_distances(&self, node: NodeId) -> &[f64] {
        &self.internal_distances[node.index()]
    }

    /// Base-graph arc represented by a tracklet arc
    pub fn base_arc(&self, arc: ArcId) -> ArcId {
        self.base_arc[arc.index()]
    }
}

/// Compress unambiguous 1:1 chains of the base graph into tracklets.
///
/// An arc is unambiguous when it is its source's only outgoing and its
/// target's only incoming arc. Maximal runs of such arcs become one
/// tracklet node.
///
/// Fails if the input is itself a tracklet view (re-compression is
/// ambiguous).
pub fn generate_tracklet_graph(base: &HypothesesGraph) -> Result<TrackletGraph, TrackingError> {
    if base.is_tracklet_view {
        return Err(TrackingError::config(
            "tracklet compression requested on an already compressed graph",
        ));
    }

    // an arc is chain-internal iff it is the unique out of its source and
    // the unique in of its target
    let chain_arc = |arc: ArcId| -> bool {
        base.out_degree(base.source(arc)) == 1 && base.in_degree(base.target(arc)) == 1
    };

    // chain heads: nodes whose incoming side does not continue a chain
    let is_head = |node: NodeId| -> bool {
        let mut ins = base.in_arcs(node);
        match ins.next() {
            None => true,
            Some(first) => ins.next().is_some() || !chain_arc(first),
        }
    };

    let mut graph = HypothesesGraph::new();
    graph.is_tracklet_view = true;

    let mut members: Vec<Vec<NodeId>> = Vec::new();
    let mut internal_arcs: Vec<Vec<ArcId>> = Vec::new();
    let mut internal_distances: Vec<Vec<f64>> = Vec::new();
    let mut tracklet_of: BTreeMap<NodeId, NodeId> = BTreeMap::new();

    for head in base.nodes().filter(|n| is_head(*n)) {
        let mut chain = vec![head];
        let mut chain_arcs = Vec::new();
        let mut distances = Vec::new();

        let mut current = head;
        loop {
            let mut outs = base.out_arcs(current);
            let arc = match outs.next() {
                Some(a) if outs.next().is_none() && chain_arc(a) => a,
                _ => break,
            };
            current = base.target(arc);
            distances.push(base.arc_distance(arc));
            chain_arcs.push(arc);
            chain.push(current);
        }

        let traxels: SmallVec<_> = chain.iter().flat_map(|n| base.node_traxels(*n)).copied().collect();
        let tracklet = graph.add_chain_node(traxels, base.timestep(head));
        for n in &chain {
            tracklet_of.insert(*n, tracklet);
        }
        members.push(chain);
        internal_arcs.push(chain_arcs);
        internal_distances.push(distances);
    }

    // arcs between distinct tracklets
    let mut base_arc = Vec::new();
    for arc in base.arcs() {
        let src = tracklet_of[&base.source(arc)];
        let dst = tracklet_of[&base.target(arc)];
        if src == dst {
            continue;
        }
        let t_arc = graph.add_arc(src, dst)?;
        graph.set_arc_distance(t_arc, base.arc_distance(arc));
        base_arc.push(arc);
    }

    debug!(
        "tracklet graph: {} nodes over {} base nodes, {} arcs",
        graph.node_count(),
        base.node_count(),
        graph.arc_count()
    );

    Ok(TrackletGraph {
        graph,
        members,
        internal_arcs,
        internal_distances,
        base_arc,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traxels::TraxelKey;

    /// a -- b -- c -- d with one branch c -> e; a..c compress into one
    /// tracklet, d and e stay single
    fn branched_graph() -> HypothesesGraph {
        let mut g = HypothesesGraph::new();
        let a = g.add_node(TraxelKey::new(0, 1));
        let b = g.add_node(TraxelKey::new(1, 1));
        let c = g.add_node(TraxelKey::new(2, 1));
        let d = g.add_node(TraxelKey::new(3, 1));
        let e = g.add_node(TraxelKey::new(3, 2));
        let ab = g.add_arc(a, b).unwrap();
        let bc = g.add_arc(b, c).unwrap();
        g.add_arc(c, d).unwrap();
        g.add_arc(c, e).unwrap();
        g.set_arc_distance(ab, 1.0);
        g.set_arc_distance(bc, 2.0);
        g
    }

    #[test]
    fn test_chains_compress() {
        let base = branched_graph();
        let tracklets = generate_tracklet_graph(&base).unwrap();

        assert_eq!(tracklets.graph.node_count(), 3);
        assert_eq!(tracklets.graph.arc_count(), 2);

        let chain = tracklets
            .graph
            .nodes()
            .find(|n| tracklets.members(*n).len() == 3)
            .expect("compressed chain");
        assert_eq!(tracklets.internal_distances(chain), &[1.0, 2.0]);
        assert_eq!(tracklets.internal_arcs(chain).len(), 2);
        assert_eq!(tracklets.graph.node_traxels(chain).len(), 3);
        assert_eq!(tracklets.graph.timestep(chain), 0);
        // chain fans out to the two singleton tracklets
        assert_eq!(tracklets.graph.out_degree(chain), 2);
    }

    #[test]
    fn test_recompression_rejected() {
        let base = branched_graph();
        let tracklets = generate_tracklet_graph(&base).unwrap();
        assert!(generate_tracklet_graph(&tracklets.graph).is_err());
    }

    #[test]
    fn test_back_references_cover_all_base_nodes() {
        let base = branched_graph();
        let tracklets = generate_tracklet_graph(&base).unwrap();
        let covered: usize = tracklets
            .graph
            .nodes()
            .map(|n| tracklets.members(n).len())
            .sum();
        assert_eq!(covered, base.node_count());
    }
}
