//! Solution writer
//!
//! Maps a backend labeling back onto the hypotheses graph as one appended
//! solution iteration, expanding tracklet chains through their
//! back-reference maps, and derives the structured event stream by
//! comparing node/arc activity across consecutive frames.

use std::collections::BTreeMap;

use log::debug;

use crate::errors::TrackingError;
use crate::events::{sort_events, Event, EventKind, EventVectorVector};
use crate::hypotheses::graph::{ArcId, HypothesesGraph, NodeId};
use crate::hypotheses::tracklets::TrackletGraph;
use crate::model::problem::{Labeling, ProblemInstance};

/// Writes labelings onto the base graph and derives events.
pub struct SolutionWriter<'a> {
    instance: &'a ProblemInstance,
    tracklets: Option<&'a TrackletGraph>,
    /// base node -> node of the solved (view) graph
    view_node: BTreeMap<NodeId, NodeId>,
    /// base arc -> arc of the solved (view) graph, cross-tracklet arcs only
    view_arc: BTreeMap<ArcId, ArcId>,
}

impl<'a> SolutionWriter<'a> {
    /// Create a writer for the given instance; pass the tracklet view the
    /// instance was built over, if any.
    pub fn new(instance: &'a ProblemInstance, tracklets: Option<&'a TrackletGraph>) -> Self {
        let mut view_node = BTreeMap::new();
        let mut view_arc = BTreeMap::new();
        if let Some(t) = tracklets {
            for tn in t.graph.nodes() {
                for &base in t.members(tn) {
                    view_node.insert(base, tn);
                }
            }
            for ta in t.graph.arcs() {
                view_arc.insert(t.base_arc(ta), ta);
            }
        }
        Self {
            instance,
            tracklets,
            view_node,
            view_arc,
        }
    }

    fn state(&self, labeling: &Labeling, var: Option<usize>) -> usize {
        var.map_or(0, |v| labeling.states[v])
    }

    fn cost(&self, labeling: &Labeling, var: Option<usize>) -> f64 {
        var.map_or(0.0, |v| {
            self.instance.variable(v).costs[labeling.states[v]]
        })
    }

    /// Append the labeling as one solution iteration on the base graph.
    ///
    /// Returns the iteration index written. The graph is only mutated
    /// here and by the merger resolver, never during a solve.
    pub fn conclude(
        &self,
        graph: &mut HypothesesGraph,
        labeling: &Labeling,
    ) -> Result<usize, TrackingError> {
        let iteration = graph.iterations();

        match self.tracklets {
            None => {
                let nodes: Vec<NodeId> = graph.nodes().collect();
                for node in nodes {
                    let count = self.state(labeling, self.instance.node_count_var(node));
                    let division = self.state(labeling, self.instance.division_var(node)) > 0;
                    graph.push_node_labels(node, count as u32, division);
                }
                let arcs: Vec<ArcId> = graph.arcs().collect();
                for arc in arcs {
                    let active = self.state(labeling, self.instance.arc_var(arc));
                    graph.push_arc_label(arc, active as u32);
                }
            }
            Some(tracklets) => {
                for tn in tracklets.graph.nodes() {
                    let count = self.state(labeling, self.instance.node_count_var(tn));
                    let division = self.state(labeling, self.instance.division_var(tn)) > 0;
                    let members = tracklets.members(tn);
                    for (i, &base) in members.iter().enumerate() {
                        // a chain divides at its last member
                        let div_here = division && i + 1 == members.len();
                        graph.push_node_labels(base, count as u32, div_here);
                    }
                    // a chain's internal arcs carry the full count
                    for &internal in tracklets.internal_arcs(tn) {
                        graph.push_arc_label(internal, count as u32);
                    }
                }
                for ta in tracklets.graph.arcs() {
                    let active = self.state(labeling, self.instance.arc_var(ta));
                    graph.push_arc_label(tracklets.base_arc(ta), active as u32);
                }
            }
        }

        debug!(
            "labeling written as iteration {} (energy {:.4})",
            iteration, labeling.energy
        );
        Ok(iteration)
    }

    /// Count/division/arc variables seen from a base element
    fn base_count_var(&self, node: NodeId) -> Option<usize> {
        let view = self.view_node.get(&node).copied().unwrap_or(node);
        self.instance.node_count_var(view)
    }

    fn base_division_var(&self, node: NodeId) -> Option<usize> {
        let view = self.view_node.get(&node).copied().unwrap_or(node);
        self.instance.division_var(view)
    }

    fn base_appearance_var(&self, node: NodeId) -> Option<usize> {
        let view = self.view_node.get(&node).copied().unwrap_or(node);
        self.instance.appearance_var(view)
    }

    fn base_disappearance_var(&self, node: NodeId) -> Option<usize> {
        let view = self.view_node.get(&node).copied().unwrap_or(node);
        self.instance.disappearance_var(view)
    }

    fn base_arc_var(&self, arc: ArcId) -> Option<usize> {
        match self.tracklets {
            None => self.instance.arc_var(arc),
            Some(_) => self
                .view_arc
                .get(&arc)
                .and_then(|va| self.instance.arc_var(*va)),
        }
    }

    /// Derive the structured event stream of one written iteration.
    ///
    /// Events are expressed in base-graph traxel ids:
    /// - an active node with no active incoming arc is an Appearance,
    /// - an active node with no active outgoing arc is a Disappearance,
    /// - an active arc is a Move, unless its source divides,
    /// - a node with its division flag set and two active outgoing arcs
    ///   is a Division,
    /// - a node with count > 1 is a Merger candidate for the resolver.
    pub fn derive_events(
        &self,
        graph: &HypothesesGraph,
        labeling: &Labeling,
        iteration: usize,
    ) -> EventVectorVector {
        let timesteps = graph.timesteps();
        let (earliest, latest) = match (timesteps.first(), timesteps.last()) {
            (Some(a), Some(b)) => (*a, *b),
            _ => return Vec::new(),
        };
        let mut events: EventVectorVector =
            vec![Vec::new(); (latest - earliest + 1) as usize];
        let slot = |t: u32| (t - earliest) as usize;

        for node in graph.nodes() {
            let count = graph.active_count(node, iteration);
            if count == 0 {
                continue;
            }
            let t = graph.timestep(node);
            let id = graph.first_traxel(node).id;

            let has_active_in = graph.in_arcs(node).any(|a| graph.arc_active(a, iteration) > 0);
            let has_active_out = graph
                .out_arcs(node)
                .any(|a| graph.arc_active(a, iteration) > 0);

            if !has_active_in {
                events[slot(t)].push(Event::new(
                    EventKind::Appearance,
                    t,
                    vec![id],
                    self.cost(labeling, self.base_appearance_var(node)),
                ));
            }
            if !has_active_out {
                let last = graph.last_traxel(node);
                events[slot(last.timestep)].push(Event::new(
                    EventKind::Disappearance,
                    last.timestep,
                    vec![last.id],
                    self.cost(labeling, self.base_disappearance_var(node)),
                ));
            }
            if count > 1 {
                events[slot(t)].push(Event::new(
                    EventKind::Merger,
                    t,
                    vec![id, count],
                    self.cost(labeling, self.base_count_var(node)),
                ));
            }

            if graph.division_active(node, iteration) {
                let mut children: Vec<u32> = graph
                    .out_arcs(node)
                    .filter(|a| graph.arc_active(*a, iteration) > 0)
                    .map(|a| graph.first_traxel(graph.target(a)).id)
                    .collect();
                children.sort_unstable();
                let last = graph.last_traxel(node);
                let mut ids = vec![last.id];
                ids.extend(children);
                events[slot(last.timestep)].push(Event::new(
                    EventKind::Division,
                    last.timestep,
                    ids,
                    self.cost(labeling, self.base_division_var(node)),
                ));
            }
        }

        for arc in graph.arcs() {
            if graph.arc_active(arc, iteration) == 0 {
                continue;
            }
            let src = graph.source(arc);
            if graph.division_active(src, iteration) {
                continue; // reported as part of the Division event
            }
            let from = graph.last_traxel(src);
            let to = graph.first_traxel(graph.target(arc));
            events[slot(to.timestep)].push(Event::new(
                EventKind::Move,
                to.timestep,
                vec![from.id, to.id],
                self.cost(labeling, self.base_arc_var(arc)),
            ));
        }

        for per_timestep in events.iter_mut() {
            sort_events(per_timestep);
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::energy::{CostFunctions, DetectionPrior};
    use crate::field_of_view::FieldOfView;
    use crate::hypotheses::builder::{BuilderOptions, SingleTimestepBuilder};
    use crate::inference::{ExactBackend, InferenceBackend, SolverOptions};
    use crate::model::builder::{ModelBuilder, ModelParameter};
    use crate::traxels::{Traxel, TraxelStore};

    fn linear_store() -> TraxelStore {
        let mut store = TraxelStore::new();
        for t in 0..3 {
            store.add(
                Traxel::new(1, t)
                    .with_feature("com", vec![t as f64, 0.0, 0.0])
                    .with_feature("detProb", vec![0.05, 0.95])
                    .with_feature("divProb", vec![0.0]),
            );
        }
        store
    }

    #[test]
    fn test_conclude_and_events_on_linear_track() {
        let store = linear_store();
        let mut graph = SingleTimestepBuilder::new(&store, BuilderOptions::default())
            .build()
            .unwrap();
        let costs = CostFunctions::standard(
            &DetectionPrior::Classifier,
            1,
            10.0,
            10.0,
            10.0,
            5.0,
            100.0,
            100.0,
            0.0,
            FieldOfView::default(),
        );
        let param = ModelParameter {
            max_number_objects: 1,
            with_divisions: false,
            ..Default::default()
        };
        let instance = ModelBuilder::new(&graph, &store, &costs, &param)
            .build()
            .unwrap();

        let mut backend = ExactBackend::new(SolverOptions::default());
        backend.build(&instance).unwrap();
        let labeling = backend.infer(&instance).unwrap();

        let writer = SolutionWriter::new(&instance, None);
        let iteration = writer.conclude(&mut graph, &labeling).unwrap();
        assert_eq!(iteration, 0);
        assert_eq!(graph.iterations(), 1);

        let events = writer.derive_events(&graph, &labeling, iteration);
        assert_eq!(events.len(), 3);
        // one appearance at t=0, moves at t=1 and t=2, one disappearance
        assert!(events[0]
            .iter()
            .any(|e| e.kind == EventKind::Appearance && e.traxel_ids == vec![1]));
        assert!(events[1].iter().any(|e| e.kind == EventKind::Move));
        assert!(events[2].iter().any(|e| e.kind == EventKind::Move));
        assert!(events[2]
            .iter()
            .any(|e| e.kind == EventKind::Disappearance));
        assert!(!events
            .iter()
            .flatten()
            .any(|e| e.kind == EventKind::Merger));
    }

    #[test]
    fn test_tracklet_conclude_expands_chains() {
        let store = linear_store();
        let mut graph = SingleTimestepBuilder::new(&store, BuilderOptions::default())
            .build()
            .unwrap();
        let tracklets = crate::hypotheses::tracklets::generate_tracklet_graph(&graph).unwrap();
        // the whole linear track compresses into a single tracklet
        assert_eq!(tracklets.graph.node_count(), 1);

        let costs = CostFunctions::standard(
            &DetectionPrior::Classifier,
            1,
            10.0,
            10.0,
            10.0,
            5.0,
            100.0,
            100.0,
            0.0,
            FieldOfView::default(),
        );
        let param = ModelParameter {
            max_number_objects: 1,
            with_divisions: false,
            ..Default::default()
        };
        let instance = ModelBuilder::new(&graph, &store, &costs, &param)
            .with_tracklets(&tracklets)
            .build()
            .unwrap();

        let mut backend = ExactBackend::new(SolverOptions::default());
        backend.build(&instance).unwrap();
        let labeling = backend.infer(&instance).unwrap();

        let writer = SolutionWriter::new(&instance, Some(&tracklets));
        let iteration = writer.conclude(&mut graph, &labeling).unwrap();

        // every base node carries the tracklet's count
        for node in graph.nodes() {
            assert_eq!(graph.active_count(node, iteration), 1);
        }
        for arc in graph.arcs() {
            assert_eq!(graph.arc_active(arc, iteration), 1);
        }

        let events = writer.derive_events(&graph, &labeling, iteration);
        let moves = events
            .iter()
            .flatten()
            .filter(|e| e.kind == EventKind::Move)
            .count();
        assert_eq!(moves, 2);
    }
}
