//! Model builder
//!
//! Walks a hypotheses graph (base or tracklet view) and emits the cost
//! tables and hard constraints of the conservation tracking problem.

use log::debug;

use crate::energy::CostFunctions;
use crate::errors::TrackingError;
use crate::hypotheses::graph::{HypothesesGraph, NodeId};
use crate::hypotheses::tracklets::TrackletGraph;
use crate::model::problem::{Constraint, ProblemInstance, VariableKind};
use crate::traxels::TraxelStore;

/// Energy applied to states ruled out without a hard constraint
const FORBIDDEN: f64 = 1e8;

/// Structural parameters of the tracking model
#[derive(Debug, Clone)]
pub struct ModelParameter {
    /// Cap N on simultaneously co-located objects; counts range 0..=N
    pub max_number_objects: usize,
    /// Emit division variables and coupling constraints
    pub with_divisions: bool,
    /// Emit hard conservation/division constraints
    pub with_constraints: bool,
    /// Allow tracks to start mid-sequence (appearance variables)
    pub with_appearance: bool,
    /// Allow tracks to end mid-sequence (disappearance variables)
    pub with_disappearance: bool,
    /// Allow active detections to be explained as misdetections (count 0)
    pub with_misdetections_allowed: bool,
    /// Energy charged for ruled-out states; 0 selects a large default
    pub forbidden_cost: f64,
}

impl Default for ModelParameter {
    fn default() -> Self {
        Self {
            max_number_objects: 3,
            with_divisions: true,
            with_constraints: true,
            with_appearance: true,
            with_disappearance: true,
            with_misdetections_allowed: true,
            forbidden_cost: 0.0,
        }
    }
}

impl ModelParameter {
    fn forbidden(&self) -> f64 {
        if self.forbidden_cost > 0.0 {
            self.forbidden_cost
        } else {
            FORBIDDEN
        }
    }
}

/// Per-arc transition costs computed once and shared read-only across
/// perturbation iterations.
#[derive(Debug, Clone)]
pub struct TransitionCache {
    per_arc: Vec<f64>,
}

impl TransitionCache {
    /// Evaluate the transition cost of every arc of the graph
    pub fn compute(graph: &HypothesesGraph, costs: &CostFunctions) -> Self {
        let per_arc = (0..graph.arc_count())
            .map(|i| (costs.transition)(graph.arc_distance(crate::hypotheses::graph::ArcId(i as u32))))
            .collect();
        Self { per_arc }
    }

    #[inline]
    fn get(&self, arc: crate::hypotheses::graph::ArcId) -> f64 {
        self.per_arc[arc.index()]
    }
}

/// Translates a hypotheses graph plus cost functions into a
/// [`ProblemInstance`].
pub struct ModelBuilder<'a> {
    graph: &'a HypothesesGraph,
    tracklets: Option<&'a TrackletGraph>,
    store: &'a TraxelStore,
    costs: &'a CostFunctions,
    param: &'a ModelParameter,
    transition_cache: Option<&'a TransitionCache>,
}

impl<'a> ModelBuilder<'a> {
    /// Build over a base graph
    pub fn new(
        graph: &'a HypothesesGraph,
        store: &'a TraxelStore,
        costs: &'a CostFunctions,
        param: &'a ModelParameter,
    ) -> Self {
        Self {
            graph,
            tracklets: None,
            store,
            costs,
            param,
            transition_cache: None,
        }
    }

    /// Build over a tracklet view; detection tables absorb the chains'
    /// internal transition costs.
    pub fn with_tracklets(mut self, tracklets: &'a TrackletGraph) -> Self {
        self.graph = &tracklets.graph;
        self.tracklets = Some(tracklets);
        self
    }

    /// Reuse transition costs computed by an earlier build
    pub fn with_transition_cache(mut self, cache: &'a TransitionCache) -> Self {
        self.transition_cache = Some(cache);
        self
    }

    /// Emit the problem instance.
    ///
    /// Idempotent over an unmodified graph: the variable order is the
    /// graph's node/arc order, so repeated builds produce identical
    /// instances.
    pub fn build(&self) -> Result<ProblemInstance, TrackingError> {
        let n = self.param.max_number_objects;
        if n < 1 {
            return Err(TrackingError::config(format!(
                "max_number_objects must be at least 1, got {}",
                n
            )));
        }

        let mut instance =
            ProblemInstance::new(n, self.param.with_constraints, self.param.with_divisions);

        // sequence bounds over the underlying traxels; tracklet chains
        // may span several timesteps beyond their head
        let mut earliest = u32::MAX;
        let mut latest = 0;
        for node in self.graph.nodes() {
            earliest = earliest.min(self.graph.timestep(node));
            latest = latest.max(self.graph.last_traxel(node).timestep);
        }
        if earliest == u32::MAX {
            return Err(TrackingError::config(
                "cannot build a model over an empty graph",
            ));
        }

        // factors, node by node in id order, then arcs
        for node in self.graph.nodes() {
            self.add_detection_factor(&mut instance, node)?;
            self.add_boundary_factors(&mut instance, node, earliest, latest)?;
            if self.param.with_divisions && self.graph.out_degree(node) >= 2 {
                self.add_division_factor(&mut instance, node)?;
            }
        }
        for arc in self.graph.arcs() {
            let cost = match self.transition_cache {
                Some(cache) => cache.get(arc),
                None => (self.costs.transition)(self.graph.arc_distance(arc)),
            };
            let mut table = vec![cost; n + 1];
            table[0] = 0.0;
            instance.add_variable(VariableKind::ArcCount(arc), table);
        }

        if self.param.with_constraints {
            self.add_constraints(&mut instance);
        }

        debug!(
            "model built: {} variables, {} constraints",
            instance.num_variables(),
            instance.constraints().len()
        );
        Ok(instance)
    }

    /// Detection factor over the node's count variable.
    ///
    /// Tracklet nodes sum their members' detection energies and, for any
    /// occupied state, the transition energies of the chain's internal
    /// arcs.
    fn add_detection_factor(
        &self,
        instance: &mut ProblemInstance,
        node: NodeId,
    ) -> Result<(), TrackingError> {
        let n = self.param.max_number_objects;
        let mut table = vec![0.0; n + 1];

        for key in self.graph.node_traxels(node) {
            let traxel = self.store.get(*key).ok_or_else(|| {
                TrackingError::config(format!("graph references unknown traxel {:?}", key))
            })?;
            for (k, entry) in table.iter_mut().enumerate() {
                *entry += (self.costs.detection)(traxel, k);
            }
        }

        if let Some(tracklets) = self.tracklets {
            let internal: f64 = tracklets
                .internal_distances(node)
                .iter()
                .map(|d| (self.costs.transition)(*d))
                .sum();
            for entry in table.iter_mut().skip(1) {
                *entry += internal;
            }
        }

        if !self.param.with_misdetections_allowed {
            table[0] = self.param.forbidden();
        }

        instance.add_variable(VariableKind::NodeCount(node), table);
        Ok(())
    }

    /// Appearance/disappearance factors.
    ///
    /// Sequence boundaries are free; elsewhere the (border-aware) cost
    /// functions decide. Costs scale linearly with the number of
    /// appearing/disappearing objects.
    fn add_boundary_factors(
        &self,
        instance: &mut ProblemInstance,
        node: NodeId,
        earliest: u32,
        latest: u32,
    ) -> Result<(), TrackingError> {
        let n = self.param.max_number_objects;

        if self.param.with_appearance {
            let first = self.graph.first_traxel(node);
            let unit = if self.graph.timestep(node) == earliest {
                0.0
            } else {
                let traxel = self.store.get(first).ok_or_else(|| {
                    TrackingError::config(format!("graph references unknown traxel {:?}", first))
                })?;
                (self.costs.appearance)(traxel)
            };
            let table: Vec<f64> = (0..=n).map(|k| k as f64 * unit).collect();
            instance.add_variable(VariableKind::Appearance(node), table);
        }

        if self.param.with_disappearance {
            let last = self.graph.last_traxel(node);
            let last_timestep = last.timestep;
            let unit = if last_timestep == latest {
                0.0
            } else {
                let traxel = self.store.get(last).ok_or_else(|| {
                    TrackingError::config(format!("graph references unknown traxel {:?}", last))
                })?;
                (self.costs.disappearance)(traxel)
            };
            let table: Vec<f64> = (0..=n).map(|k| k as f64 * unit).collect();
            instance.add_variable(VariableKind::Disappearance(node), table);
        }

        Ok(())
    }

    /// Division factor over the node's binary division variable
    fn add_division_factor(
        &self,
        instance: &mut ProblemInstance,
        node: NodeId,
    ) -> Result<(), TrackingError> {
        let key = self.graph.last_traxel(node);
        let traxel = self.store.get(key).ok_or_else(|| {
            TrackingError::config(format!("graph references unknown traxel {:?}", key))
        })?;
        let cost = (self.costs.division)(traxel);
        instance.add_variable(VariableKind::Division(node), vec![0.0, cost]);
        Ok(())
    }

    /// Emit the immutable constraint list in one pass
    fn add_constraints(&self, instance: &mut ProblemInstance) {
        let mut constraints = Vec::new();
        for node in self.graph.nodes() {
            let count = instance
                .node_count_var(node)
                .expect("count variable emitted for every node");
            let in_arcs: Vec<usize> = self
                .graph
                .in_arcs(node)
                .filter_map(|a| instance.arc_var(a))
                .collect();
            let out_arcs: Vec<usize> = self
                .graph
                .out_arcs(node)
                .filter_map(|a| instance.arc_var(a))
                .collect();
            let appearance = instance.appearance_var(node);
            let disappearance = instance.disappearance_var(node);
            let division = instance.division_var(node);

            constraints.push(Constraint::IncomingConservation {
                node,
                count,
                arcs: in_arcs,
                appearance,
            });
            constraints.push(Constraint::OutgoingConservation {
                node,
                count,
                arcs: out_arcs.clone(),
                disappearance,
                division,
            });
            if let Some(division) = division {
                constraints.push(Constraint::DivisionCoupling {
                    node,
                    division,
                    count,
                    arcs: out_arcs,
                    disappearance,
                });
            }
        }
        for constraint in constraints {
            instance.add_constraint(constraint);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::energy::{CostFunctions, DetectionPrior};
    use crate::field_of_view::FieldOfView;
    use crate::hypotheses::builder::{BuilderOptions, SingleTimestepBuilder};
    use crate::traxels::Traxel;

    fn simple_costs() -> CostFunctions {
        CostFunctions::standard(
            &DetectionPrior::Classifier,
            1,
            10.0,
            10.0,
            10.0,
            5.0,
            20.0,
            20.0,
            0.0,
            FieldOfView::default(),
        )
    }

    fn two_frame_store() -> TraxelStore {
        let mut store = TraxelStore::new();
        store.add(
            Traxel::new(1, 0)
                .with_feature("com", vec![0.0, 0.0, 0.0])
                .with_feature("detProb", vec![0.1, 0.9])
                .with_feature("divProb", vec![0.0]),
        );
        store.add(
            Traxel::new(1, 1)
                .with_feature("com", vec![1.0, 0.0, 0.0])
                .with_feature("detProb", vec![0.1, 0.9])
                .with_feature("divProb", vec![0.0]),
        );
        store
    }

    #[test]
    fn test_rejects_zero_max_objects() {
        let store = two_frame_store();
        let graph = SingleTimestepBuilder::new(&store, BuilderOptions::default())
            .build()
            .unwrap();
        let costs = simple_costs();
        let param = ModelParameter {
            max_number_objects: 0,
            ..Default::default()
        };
        let result = ModelBuilder::new(&graph, &store, &costs, &param).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_variable_layout() {
        let store = two_frame_store();
        let graph = SingleTimestepBuilder::new(&store, BuilderOptions::default())
            .build()
            .unwrap();
        let costs = simple_costs();
        let param = ModelParameter {
            max_number_objects: 1,
            ..Default::default()
        };
        let instance = ModelBuilder::new(&graph, &store, &costs, &param)
            .build()
            .unwrap();

        // 2 nodes * (count + appearance + disappearance) + 1 arc
        assert_eq!(instance.num_variables(), 7);
        // 2 nodes * (incoming + outgoing), no division (out-degree < 2)
        assert_eq!(instance.constraints().len(), 4);

        for node in graph.nodes() {
            assert!(instance.node_count_var(node).is_some());
            let count = instance.node_count_var(node).unwrap();
            assert_eq!(instance.variable(count).num_states(), 2);
        }
    }

    #[test]
    fn test_boundary_factors_free_at_sequence_edges() {
        let store = two_frame_store();
        let graph = SingleTimestepBuilder::new(&store, BuilderOptions::default())
            .build()
            .unwrap();
        let costs = simple_costs();
        let param = ModelParameter {
            max_number_objects: 1,
            ..Default::default()
        };
        let instance = ModelBuilder::new(&graph, &store, &costs, &param)
            .build()
            .unwrap();

        let first = graph.nodes_at(0).next().unwrap();
        let last = graph.nodes_at(1).next().unwrap();
        let app_first = instance.appearance_var(first).unwrap();
        let dis_last = instance.disappearance_var(last).unwrap();
        let app_last = instance.appearance_var(last).unwrap();

        assert_eq!(instance.variable(app_first).costs, vec![0.0, 0.0]);
        assert_eq!(instance.variable(dis_last).costs, vec![0.0, 0.0]);
        // appearing mid-sequence costs the full appearance energy
        assert_eq!(instance.variable(app_last).costs, vec![0.0, 20.0]);
    }

    #[test]
    fn test_idempotent_build() {
        let store = two_frame_store();
        let graph = SingleTimestepBuilder::new(&store, BuilderOptions::default())
            .build()
            .unwrap();
        let costs = simple_costs();
        let param = ModelParameter {
            max_number_objects: 2,
            ..Default::default()
        };
        let builder = ModelBuilder::new(&graph, &store, &costs, &param);
        let a = builder.build().unwrap();
        let b = builder.build().unwrap();
        assert_eq!(a.num_variables(), b.num_variables());
        for i in 0..a.num_variables() {
            assert_eq!(a.variable(i).costs, b.variable(i).costs);
            assert_eq!(a.variable(i).kind, b.variable(i).kind);
        }
    }
}
