//! Nearest-neighbor hypotheses builder
//!
//! Connects each traxel to its nearest neighbors in the following timestep
//! within a maximal distance. An optional backward pass ensures every node
//! that has a spatially close predecessor also receives an incoming
//! candidate, and nodes with a high division probability get extra
//! outgoing candidates so both daughters are reachable.

use std::collections::BTreeMap;

use log::debug;

use crate::errors::TrackingError;
use crate::hypotheses::graph::{HypothesesGraph, NodeId};
use crate::traxels::{TraxelKey, TraxelStore};

/// Options of the neighborhood-search builder
#[derive(Debug, Clone)]
pub struct BuilderOptions {
    /// Candidate arcs per node in the forward pass
    pub max_nearest_neighbors: usize,
    /// Maximal center-of-mass distance for a candidate arc
    pub max_distance: f64,
    /// Run a backward pass adding candidates for otherwise unreachable nodes
    pub forward_backward: bool,
    /// Add extra forward candidates for likely dividers
    pub consider_divisions: bool,
    /// Minimal "divProb" for a node to count as a likely divider
    pub division_threshold: f64,
    /// Use drift-corrected centers of mass when present
    pub with_optical_correction: bool,
}

impl Default for BuilderOptions {
    fn default() -> Self {
        Self {
            max_nearest_neighbors: 1,
            max_distance: 20.0,
            forward_backward: true,
            consider_divisions: true,
            division_threshold: 0.3,
            with_optical_correction: false,
        }
    }
}

/// Builds a [`HypothesesGraph`] from a traxel store, one layer per
/// timestep.
pub struct SingleTimestepBuilder<'a> {
    store: &'a TraxelStore,
    options: BuilderOptions,
}

impl<'a> SingleTimestepBuilder<'a> {
    /// Create a builder over the given store
    pub fn new(store: &'a TraxelStore, options: BuilderOptions) -> Self {
        Self { store, options }
    }

    /// Build the candidate graph.
    ///
    /// Every traxel becomes a node; arcs connect nearest neighbors in the
    /// next timestep within `max_distance`. Arc distances are stored as a
    /// property.
    pub fn build(&self) -> Result<HypothesesGraph, TrackingError> {
        if self.store.is_empty() {
            return Err(TrackingError::config("traxel store is empty"));
        }

        let mut graph = HypothesesGraph::new();
        let mut node_of: BTreeMap<TraxelKey, NodeId> = BTreeMap::new();
        for traxel in self.store.iter() {
            node_of.insert(traxel.key(), graph.add_node(traxel.key()));
        }

        let earliest = self.store.earliest_timestep().expect("non-empty store");
        let latest = self.store.latest_timestep().expect("non-empty store");

        for t in earliest..latest {
            self.connect_layer(&mut graph, &node_of, t)?;
        }

        debug!(
            "hypotheses graph built: {} nodes, {} arcs over timesteps {}..={}",
            graph.node_count(),
            graph.arc_count(),
            earliest,
            latest
        );
        Ok(graph)
    }

    fn distance(&self, a: TraxelKey, b: TraxelKey) -> Result<f64, TrackingError> {
        let ta = self.store.get(a).expect("key taken from the store");
        let tb = self.store.get(b).expect("key taken from the store");
        if self.options.with_optical_correction {
            ta.distance_to_corrected(tb)
        } else {
            ta.distance_to(tb)
        }
    }

    /// Nearest neighbors of `from` among `candidates`, closest first,
    /// within the maximal distance.
    fn nearest(
        &self,
        from: TraxelKey,
        candidates: &[TraxelKey],
        count: usize,
    ) -> Result<Vec<(TraxelKey, f64)>, TrackingError> {
        let mut scored = Vec::with_capacity(candidates.len());
        for &c in candidates {
            let d = self.distance(from, c)?;
            if d <= self.options.max_distance {
                scored.push((c, d));
            }
        }
        scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(count);
        Ok(scored)
    }

    fn connect_layer(
        &self,
        graph: &mut HypothesesGraph,
        node_of: &BTreeMap<TraxelKey, NodeId>,
        t: u32,
    ) -> Result<(), TrackingError> {
        let here: Vec<TraxelKey> = self.store.at_timestep(t).map(|tr| tr.key()).collect();
        let next: Vec<TraxelKey> = self.store.at_timestep(t + 1).map(|tr| tr.key()).collect();
        if here.is_empty() || next.is_empty() {
            return Ok(());
        }

        let add = |graph: &mut HypothesesGraph,
                       from: TraxelKey,
                       to: TraxelKey,
                       d: f64|
         -> Result<(), TrackingError> {
            let (src, dst) = (node_of[&from], node_of[&to]);
            // skip duplicates from overlapping passes
            if graph.out_arcs(src).any(|a| graph.target(a) == dst) {
                return Ok(());
            }
            let arc = graph.add_arc(src, dst)?;
            graph.set_arc_distance(arc, d);
            Ok(())
        };

        // forward pass
        for &from in &here {
            let mut fanout = self.options.max_nearest_neighbors;
            if self.options.consider_divisions && self.division_candidate(from)? {
                fanout = fanout.max(2);
            }
            for (to, d) in self.nearest(from, &next, fanout)? {
                add(graph, from, to, d)?;
            }
        }

        // backward pass: make sure close successors are reachable
        if self.options.forward_backward {
            for &to in &next {
                for (from, d) in self.nearest(to, &here, self.options.max_nearest_neighbors)? {
                    add(graph, from, to, d)?;
                }
            }
        }

        Ok(())
    }

    fn division_candidate(&self, key: TraxelKey) -> Result<bool, TrackingError> {
        let traxel = self.store.get(key).expect("key taken from the store");
        Ok(traxel
            .feature("divProb")
            .and_then(|p| p.first().copied())
            .map_or(false, |p| p >= self.options.division_threshold))
    }
}
