//! Min-cost-flow backend
//!
//! Maps the conservation structure onto a flow network: every graph node
//! is split into an in/out pair joined by unit capacity edges priced at
//! the detection table's increments, arcs and appearance/disappearance
//! variables become unit edges priced the same way. Tracks are units of
//! flow from the source to the sink; augmenting along shortest negative
//! paths until none remains yields the minimum-cost labeling.
//!
//! Only constraints expressible as flow conservation are supported:
//! division coupling and forced labels are rejected at build time. The
//! per-unit pricing assumes count energies unimodal in the count, which
//! holds for negative-log detection tables.

use log::debug;

use crate::errors::TrackingError;
use crate::inference::dynprog::{argmin, Structure};
use crate::inference::{InferenceBackend, SolverOptions};
use crate::model::problem::{Labeling, ProblemInstance};

const EPS: f64 = 1e-9;

#[derive(Debug, Clone)]
struct Edge {
    to: usize,
    /// Remaining residual capacity
    cap: u32,
    cost: f64,
    /// Index of the reverse edge in `graph[to]`
    rev: usize,
    /// Decision variable this edge's flow belongs to, if any
    var: Option<usize>,
}

/// Successive-shortest-path min-cost flow over the conservation network
pub struct FlowBackend {
    #[allow(dead_code)]
    options: SolverOptions,
    last: Option<Labeling>,
    built: bool,
}

impl FlowBackend {
    /// Create a backend with the given options
    pub fn new(options: SolverOptions) -> Self {
        Self {
            options,
            last: None,
            built: false,
        }
    }
}

struct Network {
    graph: Vec<Vec<Edge>>,
    source: usize,
    sink: usize,
}

impl Network {
    fn new(num_vertices: usize) -> Self {
        Self {
            graph: vec![Vec::new(); num_vertices],
            source: 0,
            sink: 1,
        }
    }

    fn add_edge(&mut self, from: usize, to: usize, cap: u32, cost: f64, var: Option<usize>) {
        let rev_from = self.graph[to].len();
        let rev_to = self.graph[from].len();
        self.graph[from].push(Edge {
            to,
            cap,
            cost,
            rev: rev_from,
            var,
        });
        self.graph[to].push(Edge {
            to: from,
            cap: 0,
            cost: -cost,
            rev: rev_to,
            var: None,
        });
    }

    /// Bellman-Ford shortest path in the residual network; returns the
    /// predecessor edge per vertex when the sink is reachable at negative
    /// cost.
    fn negative_path(&self) -> Option<Vec<(usize, usize)>> {
        let n = self.graph.len();
        let mut dist = vec![f64::INFINITY; n];
        let mut pred: Vec<Option<(usize, usize)>> = vec![None; n];
        dist[self.source] = 0.0;

        for _ in 0..n {
            let mut changed = false;
            for u in 0..n {
                if !dist[u].is_finite() {
                    continue;
                }
                for (ei, edge) in self.graph[u].iter().enumerate() {
                    if edge.cap == 0 {
                        continue;
                    }
                    let nd = dist[u] + edge.cost;
                    if nd + EPS < dist[edge.to] {
                        dist[edge.to] = nd;
                        pred[edge.to] = Some((u, ei));
                        changed = true;
                    }
                }
            }
            if !changed {
                break;
            }
        }

        if dist[self.sink] >= -EPS {
            return None;
        }

        let mut path = Vec::new();
        let mut v = self.sink;
        while v != self.source {
            let (u, ei) = pred[v].expect("reachable sink has a predecessor chain");
            path.push((u, ei));
            v = u;
        }
        path.reverse();
        Some(path)
    }

    /// Push one unit along the path; reverse residuals absorb the unit
    /// so later augmentations may cancel it.
    fn augment(&mut self, path: &[(usize, usize)]) {
        for &(u, ei) in path {
            let (to, rev) = {
                let e = &self.graph[u][ei];
                (e.to, e.rev)
            };
            self.graph[u][ei].cap -= 1;
            self.graph[to][rev].cap += 1;
        }
    }

    /// Net flow pushed through a forward edge
    fn net_flow(&self, from: usize, ei: usize) -> u32 {
        let edge = &self.graph[from][ei];
        self.graph[edge.to][edge.rev].cap
    }
}

impl InferenceBackend for FlowBackend {
    fn name(&self) -> &'static str {
        "flow"
    }

    fn supports_divisions(&self) -> bool {
        false
    }

    fn build(&mut self, instance: &ProblemInstance) -> Result<(), TrackingError> {
        if instance.num_variables() == 0 {
            return Err(TrackingError::config(
                "cannot build a solver over an empty problem instance",
            ));
        }
        if instance.with_divisions {
            return Err(TrackingError::config(
                "the flow backend only supports flow-expressible constraints; \
                 division coupling is not one of them",
            ));
        }
        if instance.has_forced_labels() {
            return Err(TrackingError::config(
                "forced labels require the exact backend",
            ));
        }
        if instance.with_constraints {
            Structure::from_instance(instance)?;
        }
        self.built = true;
        Ok(())
    }

    fn infer(&mut self, instance: &ProblemInstance) -> Result<Labeling, TrackingError> {
        if !self.built {
            return Err(TrackingError::config(
                "infer called before build on the flow backend",
            ));
        }

        let mut states = vec![0usize; instance.num_variables()];

        if !instance.with_constraints {
            for (i, state) in states.iter_mut().enumerate() {
                *state = argmin(&instance.variable(i).costs);
            }
            let labeling = instance.labeling(states, true);
            self.last = Some(labeling.clone());
            return Ok(labeling);
        }

        let structure = Structure::from_instance(instance)?;

        // vertices: 0 = source, 1 = sink, then (in, out) per node
        let mut network = Network::new(2 + 2 * structure.nodes.len());
        let vin = |i: usize| 2 + 2 * i;
        let vout = |i: usize| 2 + 2 * i + 1;

        let unit_edges = |costs: &[f64]| -> Vec<f64> {
            costs.windows(2).map(|w| w[1] - w[0]).collect()
        };

        for (i, node) in structure.nodes.iter().enumerate() {
            for delta in unit_edges(&instance.variable(node.count).costs) {
                network.add_edge(vin(i), vout(i), 1, delta, Some(node.count));
            }
            if let Some(app) = node.appearance {
                for delta in unit_edges(&instance.variable(app).costs) {
                    network.add_edge(network.source, vin(i), 1, delta, Some(app));
                }
            }
            if let Some(dis) = node.disappearance {
                for delta in unit_edges(&instance.variable(dis).costs) {
                    network.add_edge(vout(i), network.sink, 1, delta, Some(dis));
                }
            }
        }
        for (&arc, &(src, dst)) in &structure.arc_ends {
            for delta in unit_edges(&instance.variable(arc).costs) {
                network.add_edge(vout(src), vin(dst), 1, delta, Some(arc));
            }
        }

        let mut augmentations = 0usize;
        while let Some(path) = network.negative_path() {
            network.augment(&path);
            augmentations += 1;
        }
        debug!("flow solve finished after {} augmentations", augmentations);

        // read net flows back into variable states
        for u in 0..network.graph.len() {
            for ei in 0..network.graph[u].len() {
                if let Some(var) = network.graph[u][ei].var {
                    states[var] += network.net_flow(u, ei) as usize;
                }
            }
        }

        instance.check_feasible(&states)?;
        let labeling = instance.labeling(states, true);
        self.last = Some(labeling.clone());
        Ok(labeling)
    }

    fn last_solution(&self) -> Result<Labeling, TrackingError> {
        self.last
            .clone()
            .ok_or_else(|| TrackingError::config("no solve has been run on the flow backend"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypotheses::graph::{ArcId, NodeId};
    use crate::model::problem::{Constraint, VariableKind};

    fn chain_instance(active_reward: f64) -> ProblemInstance {
        let mut inst = ProblemInstance::new(1, true, false);
        let n0 = NodeId(0);
        let n1 = NodeId(1);
        let c0 = inst.add_variable(VariableKind::NodeCount(n0), vec![active_reward, 0.0]);
        let c1 = inst.add_variable(VariableKind::NodeCount(n1), vec![active_reward, 0.0]);
        let t = inst.add_variable(VariableKind::ArcCount(ArcId(0)), vec![0.0, 1.0]);
        let app = inst.add_variable(VariableKind::Appearance(n0), vec![0.0, 0.0]);
        let dis = inst.add_variable(VariableKind::Disappearance(n1), vec![0.0, 0.0]);

        inst.add_constraint(Constraint::IncomingConservation {
            node: n0,
            count: c0,
            arcs: vec![],
            appearance: Some(app),
        });
        inst.add_constraint(Constraint::OutgoingConservation {
            node: n0,
            count: c0,
            arcs: vec![t],
            disappearance: None,
            division: None,
        });
        inst.add_constraint(Constraint::IncomingConservation {
            node: n1,
            count: c1,
            arcs: vec![t],
            appearance: None,
        });
        inst.add_constraint(Constraint::OutgoingConservation {
            node: n1,
            count: c1,
            arcs: vec![],
            disappearance: Some(dis),
            division: None,
        });
        inst
    }

    #[test]
    fn test_flow_activates_profitable_track() {
        let inst = chain_instance(5.0);
        let mut backend = FlowBackend::new(SolverOptions::default());
        backend.build(&inst).unwrap();
        let labeling = backend.infer(&inst).unwrap();
        assert_eq!(labeling.states, vec![1, 1, 1, 1, 1]);
        assert!(inst.check_feasible(&labeling.states).is_ok());
    }

    #[test]
    fn test_flow_keeps_unprofitable_track_inactive() {
        // inactive is free, active costs energy
        let mut inst = chain_instance(0.0);
        inst.variable_costs_mut(0)[1] = 3.0;
        inst.variable_costs_mut(1)[1] = 3.0;
        let mut backend = FlowBackend::new(SolverOptions::default());
        backend.build(&inst).unwrap();
        let labeling = backend.infer(&inst).unwrap();
        assert_eq!(labeling.states, vec![0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_divisions_rejected_at_build() {
        let mut inst = chain_instance(5.0);
        inst.with_divisions = true;
        let mut backend = FlowBackend::new(SolverOptions::default());
        assert!(backend.build(&inst).is_err());
    }

    #[test]
    fn test_matches_exact_backend_on_chain() {
        use crate::inference::exact::ExactBackend;
        let inst = chain_instance(5.0);

        let mut flow = FlowBackend::new(SolverOptions::default());
        flow.build(&inst).unwrap();
        let flow_labeling = flow.infer(&inst).unwrap();

        let mut exact = ExactBackend::new(SolverOptions::default());
        exact.build(&inst).unwrap();
        let exact_labeling = exact.infer(&inst).unwrap();

        assert!((flow_labeling.energy - exact_labeling.energy).abs() < 1e-9);
    }
}
