//! Merger resolver
//!
//! Splits nodes whose concluded count exceeds one into their constituent
//! objects: the blob's coordinate samples are clustered into count
//! components, each component becomes a new sub-node with a minted traxel
//! id, and links across the affected frames are re-derived by
//! minimum-cost assignment under the same transition cost used by the
//! main solve.
//!
//! A node whose coordinates do not separate stays labeled as an
//! unresolved merger; resolution failures are local and never abort the
//! run.

use std::collections::BTreeMap;

use log::{info, warn};
use nalgebra::DVector;
use ndarray::Array2;
use rand::RngCore;

use crate::errors::TrackingError;
use crate::events::{sort_events, Event, EventKind, EventVectorVector};
use crate::hypotheses::graph::{ArcId, HypothesesGraph, NodeId};
use crate::mergers::assignment::min_cost_assignment;
use crate::mergers::clustering::ClusterStrategy;
use crate::traxels::{Traxel, TraxelKey, TraxelStore};

/// Coordinate samples per detection, supplied by the external feature
/// collaborator (e.g. segment pixel coordinates).
pub type TimestepIdCoordinateMap = BTreeMap<TraxelKey, Vec<DVector<f64>>>;

/// One successfully split merger
#[derive(Debug, Clone)]
pub struct ResolvedMerger {
    /// The original merger detection
    pub original: TraxelKey,
    /// Minted sub-object traxel ids
    pub new_ids: Vec<u32>,
}

/// Outcome of a resolution pass
#[derive(Debug)]
pub struct ResolutionOutput {
    /// ResolvedTo and MultiFrameMove events, per timestep
    pub events: EventVectorVector,
    /// Mergers that were split
    pub resolved: Vec<ResolvedMerger>,
    /// Mergers left unresolved, with the failure that kept them
    pub unresolved: Vec<(TraxelKey, TrackingError)>,
}

/// Splits concluded mergers and re-links the affected frames.
pub struct MergerResolver<'a> {
    strategy: &'a dyn ClusterStrategy,
    /// transition(distance) -> energy, shared with the main solve
    transition: &'a (dyn Fn(f64) -> f64 + Send + Sync),
}

impl<'a> MergerResolver<'a> {
    /// Create a resolver with the given clustering strategy and the
    /// main solve's transition cost function
    pub fn new(
        strategy: &'a dyn ClusterStrategy,
        transition: &'a (dyn Fn(f64) -> f64 + Send + Sync),
    ) -> Self {
        Self {
            strategy,
            transition,
        }
    }

    /// Resolve all mergers of one concluded solution iteration.
    ///
    /// The graph is mutated: resolved merger nodes are pruned and
    /// replaced by sub-nodes wired to the neighboring frames. The traxel
    /// store receives the minted sub-object traxels.
    pub fn resolve(
        &self,
        graph: &mut HypothesesGraph,
        store: &mut TraxelStore,
        coordinates: &TimestepIdCoordinateMap,
        iteration: usize,
        rng: &mut dyn RngCore,
    ) -> ResolutionOutput {
        let mut resolved = Vec::new();
        let mut unresolved = Vec::new();
        let mut new_arcs: Vec<ArcId> = Vec::new();
        let mut next_id = store.max_id() + 1;

        // ascending timestep order so earlier resolutions feed later ones
        let mut mergers: Vec<NodeId> = graph
            .nodes()
            .filter(|n| graph.active_count(*n, iteration) > 1)
            .collect();
        mergers.sort_by_key(|n| (graph.timestep(*n), graph.first_traxel(*n).id));
        info!("resolving {} merger nodes", mergers.len());

        for node in mergers {
            let key = graph.first_traxel(node);
            let count = graph.active_count(node, iteration) as usize;

            match self.split_node(
                graph,
                store,
                coordinates,
                node,
                key,
                count,
                iteration,
                &mut next_id,
                &mut new_arcs,
                rng,
            ) {
                Ok(merger) => resolved.push(merger),
                Err(error) => {
                    warn!("merger at {:?} left unresolved: {}", key, error);
                    unresolved.push((
                        key,
                        TrackingError::Resolution {
                            traxel_id: key.id,
                            timestep: key.timestep,
                            description: error.to_string(),
                        },
                    ));
                }
            }
        }

        // events for links that survived the whole pass
        let timesteps = graph.timesteps();
        let (earliest, latest) = match (timesteps.first(), timesteps.last()) {
            (Some(a), Some(b)) => (*a, *b),
            _ => {
                return ResolutionOutput {
                    events: Vec::new(),
                    resolved,
                    unresolved,
                }
            }
        };
        let mut events: EventVectorVector = vec![Vec::new(); (latest - earliest + 1) as usize];
        let slot = |t: u32| (t - earliest) as usize;

        for merger in &resolved {
            let t = merger.original.timestep;
            let mut ids = vec![merger.original.id];
            ids.extend(&merger.new_ids);
            events[slot(t)].push(Event::new(EventKind::ResolvedTo, t, ids, 0.0));
        }
        for &arc in &new_arcs {
            let src = graph.source(arc);
            let dst = graph.target(arc);
            if graph.is_pruned(src) || graph.is_pruned(dst) {
                continue;
            }
            let to = graph.first_traxel(dst);
            events[slot(to.timestep)].push(Event::new(
                EventKind::MultiFrameMove,
                to.timestep,
                vec![graph.last_traxel(src).id, to.id],
                (self.transition)(graph.arc_distance(arc)),
            ));
        }
        for per_timestep in events.iter_mut() {
            sort_events(per_timestep);
        }

        ResolutionOutput {
            events,
            resolved,
            unresolved,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn split_node(
        &self,
        graph: &mut HypothesesGraph,
        store: &mut TraxelStore,
        coordinates: &TimestepIdCoordinateMap,
        node: NodeId,
        key: TraxelKey,
        count: usize,
        iteration: usize,
        next_id: &mut u32,
        new_arcs: &mut Vec<ArcId>,
        rng: &mut dyn RngCore,
    ) -> Result<ResolvedMerger, TrackingError> {
        let points = coordinates.get(&key).ok_or_else(|| {
            TrackingError::config(format!("no coordinate samples for {:?}", key))
        })?;
        let clustering = self.strategy.cluster(points, count, rng)?;

        // neighbor units before the merger node is pruned
        let in_units: Vec<NodeId> = graph
            .in_arcs(node)
            .filter(|a| graph.arc_active(*a, iteration) > 0)
            .flat_map(|a| {
                let src = graph.source(a);
                std::iter::repeat(src).take(graph.arc_active(a, iteration) as usize)
            })
            .collect();
        let out_units: Vec<NodeId> = graph
            .out_arcs(node)
            .filter(|a| graph.arc_active(*a, iteration) > 0)
            .flat_map(|a| {
                let dst = graph.target(a);
                std::iter::repeat(dst).take(graph.arc_active(a, iteration) as usize)
            })
            .collect();

        // mint sub-objects
        let mut subs = Vec::with_capacity(count);
        let mut new_ids = Vec::with_capacity(count);
        for center in &clustering.centers {
            let id = *next_id;
            *next_id += 1;
            let traxel = Traxel::new(id, key.timestep)
                .with_feature("com", center.iter().copied().collect())
                .with_feature("detProb", vec![0.01, 0.99])
                .with_feature("divProb", vec![0.0]);
            store.add(traxel);
            let sub = graph.add_node(TraxelKey::new(key.timestep, id));
            for _ in 0..iteration {
                graph.push_node_labels(sub, 0, false);
            }
            graph.push_node_labels(sub, 1, false);
            subs.push(sub);
            new_ids.push(id);
        }

        graph.prune_node(node);

        // re-link both frame boundaries by minimum-cost assignment under
        // the shared transition energy
        self.link_units(graph, store, &in_units, &subs, iteration, new_arcs)?;
        self.link_units(graph, store, &subs, &out_units, iteration, new_arcs)?;

        Ok(ResolvedMerger {
            original: key,
            new_ids,
        })
    }

    /// Assign each left unit to at most one right unit and wire the
    /// chosen arcs into the graph.
    fn link_units(
        &self,
        graph: &mut HypothesesGraph,
        store: &TraxelStore,
        left: &[NodeId],
        right: &[NodeId],
        iteration: usize,
        new_arcs: &mut Vec<ArcId>,
    ) -> Result<(), TrackingError> {
        if left.is_empty() || right.is_empty() {
            return Ok(());
        }

        let mut costs = Array2::zeros((left.len(), right.len()));
        for (i, &l) in left.iter().enumerate() {
            let from = com_of(graph, store, l, true)?;
            for (j, &r) in right.iter().enumerate() {
                let to = com_of(graph, store, r, false)?;
                costs[(i, j)] = (self.transition)((&to - &from).norm());
            }
        }

        let assignment = min_cost_assignment(&costs);
        for (i, assigned) in assignment.row_to_col.iter().enumerate() {
            let Some(j) = assigned else { continue };
            let (src, dst) = (left[i], right[*j]);
            // duplicate slots of the same neighbor may produce the same
            // pair twice; a single arc carries it
            if graph.out_arcs(src).any(|a| graph.target(a) == dst) {
                continue;
            }
            let from = com_of(graph, store, src, true)?;
            let to = com_of(graph, store, dst, false)?;
            let arc = graph.add_arc(src, dst)?;
            graph.set_arc_distance(arc, (&to - &from).norm());
            for _ in 0..iteration {
                graph.push_arc_label(arc, 0);
            }
            graph.push_arc_label(arc, 1);
            new_arcs.push(arc);
        }
        Ok(())
    }
}

/// Center of mass of a node's first or last traxel
fn com_of(
    graph: &HypothesesGraph,
    store: &TraxelStore,
    node: NodeId,
    last: bool,
) -> Result<DVector<f64>, TrackingError> {
    let key = if last {
        graph.last_traxel(node)
    } else {
        graph.first_traxel(node)
    };
    store
        .get(key)
        .ok_or_else(|| {
            TrackingError::config(format!("graph references unknown traxel {:?}", key))
        })?
        .com()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mergers::clustering::KMeans;
    use rand::SeedableRng;

    /// t=0: two separate objects; t=1: one merged blob (count 2);
    /// t=2: two separate objects again.
    fn merger_fixture() -> (HypothesesGraph, TraxelStore, TimestepIdCoordinateMap) {
        let mut store = TraxelStore::new();
        let mut graph = HypothesesGraph::new();

        let positions = [
            (0u32, 1u32, 0.0, 0.0),
            (0, 2, 0.0, 4.0),
            (1, 3, 1.0, 2.0), // the merger blob
            (2, 4, 2.0, 0.0),
            (2, 5, 2.0, 4.0),
        ];
        let mut nodes = BTreeMap::new();
        for &(t, id, x, y) in &positions {
            store.add(
                Traxel::new(id, t)
                    .with_feature("com", vec![x, y])
                    .with_feature("detProb", vec![0.1, 0.8, 0.1])
                    .with_feature("divProb", vec![0.0]),
            );
            nodes.insert((t, id), graph.add_node(TraxelKey::new(t, id)));
        }

        let arcs = [
            ((0, 1), (1, 3)),
            ((0, 2), (1, 3)),
            ((1, 3), (2, 4)),
            ((1, 3), (2, 5)),
        ];
        let mut arc_ids = Vec::new();
        for (from, to) in arcs {
            let a = graph.add_arc(nodes[&from], nodes[&to]).unwrap();
            arc_ids.push(a);
        }

        // MAP labels: everything active, merger carries 2
        for (&(t, id), &n) in &nodes {
            let count = if (t, id) == (1, 3) { 2 } else { 1 };
            graph.push_node_labels(n, count, false);
        }
        for a in arc_ids {
            graph.push_arc_label(a, 1);
        }

        // blob coordinates: two clearly separated sample groups
        let mut coordinates = TimestepIdCoordinateMap::new();
        let mut samples = Vec::new();
        for i in 0..4 {
            samples.push(DVector::from_vec(vec![1.0, 0.1 * i as f64]));
            samples.push(DVector::from_vec(vec![1.0, 4.0 - 0.1 * i as f64]));
        }
        coordinates.insert(TraxelKey::new(1, 3), samples);

        (graph, store, coordinates)
    }

    #[test]
    fn test_merger_splits_into_two_linked_subnodes() {
        let (mut graph, mut store, coordinates) = merger_fixture();
        let strategy = KMeans::default();
        let transition = |d: f64| 2.0 * d;
        let resolver = MergerResolver::new(&strategy, &transition);
        let mut rng = rand::rngs::StdRng::seed_from_u64(3);

        let output = resolver.resolve(&mut graph, &mut store, &coordinates, 0, &mut rng);

        assert_eq!(output.resolved.len(), 1);
        assert!(output.unresolved.is_empty());
        let merger = &output.resolved[0];
        assert_eq!(merger.new_ids.len(), 2);

        // two sub-nodes exist at t=1, each with one incoming and one
        // outgoing re-derived arc
        let subs: Vec<NodeId> = graph
            .nodes_at(1)
            .filter(|n| graph.active_count(*n, 0) == 1)
            .collect();
        assert_eq!(subs.len(), 2);
        for &sub in &subs {
            assert_eq!(graph.in_degree(sub), 1);
            assert_eq!(graph.out_degree(sub), 1);
        }
        // the two sub-nodes link to distinct successors
        let targets: Vec<NodeId> = subs
            .iter()
            .flat_map(|&s| graph.out_arcs(s).map(|a| graph.target(a)))
            .collect();
        assert_ne!(targets[0], targets[1]);

        // events distinguish the resolution from ordinary moves
        let all: Vec<&Event> = output.events.iter().flatten().collect();
        assert!(all.iter().any(|e| e.kind == EventKind::ResolvedTo
            && e.traxel_ids[0] == 3
            && e.traxel_ids.len() == 3));
        assert_eq!(
            all.iter()
                .filter(|e| e.kind == EventKind::MultiFrameMove)
                .count(),
            4
        );
    }

    #[test]
    fn test_degenerate_merger_stays_unresolved() {
        let (mut graph, mut store, mut coordinates) = merger_fixture();
        // collapse the blob's samples onto a single point
        coordinates.insert(
            TraxelKey::new(1, 3),
            vec![DVector::from_vec(vec![1.0, 2.0]); 8],
        );
        let strategy = KMeans::default();
        let transition = |d: f64| 2.0 * d;
        let resolver = MergerResolver::new(&strategy, &transition);
        let mut rng = rand::rngs::StdRng::seed_from_u64(3);

        let output = resolver.resolve(&mut graph, &mut store, &coordinates, 0, &mut rng);

        assert!(output.resolved.is_empty());
        assert_eq!(output.unresolved.len(), 1);
        assert!(matches!(
            output.unresolved[0].1,
            TrackingError::Resolution { traxel_id: 3, .. }
        ));
        // the merger node is still present and still labeled count 2
        let merger_node = graph
            .nodes_at(1)
            .find(|n| graph.first_traxel(*n).id == 3)
            .expect("merger node kept");
        assert_eq!(graph.active_count(merger_node, 0), 2);
    }
}
