//! Dynamic-programming backend
//!
//! Successive best-chain extraction over the layered DAG. Each round runs
//! one dynamic program in topological order to find the cheapest
//! appearance-to-disappearance chain (one additional unit of track flow)
//! under the current partial labeling, applies it if it lowers the total
//! energy, and repeats until no chain improves.
//!
//! Conservation and division coupling are encoded structurally in the
//! chain moves; general linear constraints beyond those are not
//! supported, and neither are forced labels or m-best enumeration.

use std::collections::BTreeMap;

use log::debug;

use crate::errors::TrackingError;
use crate::hypotheses::graph::NodeId;
use crate::inference::{InferenceBackend, SolverOptions};
use crate::model::problem::{Constraint, Labeling, ProblemInstance};

const EPS: f64 = 1e-9;

/// Node-centric view of a problem instance, reconstructed from the
/// conservation constraints.
pub(crate) struct Structure {
    /// Dense node table in topological order
    pub nodes: Vec<StructNode>,
    /// arc variable -> (source, target) position in `nodes`
    pub arc_ends: BTreeMap<usize, (usize, usize)>,
}

pub(crate) struct StructNode {
    pub id: NodeId,
    pub count: usize,
    pub appearance: Option<usize>,
    pub disappearance: Option<usize>,
    pub division: Option<usize>,
    pub in_arcs: Vec<usize>,
    pub out_arcs: Vec<usize>,
}

impl Structure {
    /// Rebuild graph structure from the constraint descriptors.
    pub(crate) fn from_instance(instance: &ProblemInstance) -> Result<Self, TrackingError> {
        let mut by_node: BTreeMap<NodeId, StructNode> = BTreeMap::new();

        for constraint in instance.constraints() {
            match constraint {
                Constraint::IncomingConservation {
                    node,
                    count,
                    arcs,
                    appearance,
                } => {
                    let entry = by_node.entry(*node).or_insert_with(|| StructNode {
                        id: *node,
                        count: *count,
                        appearance: None,
                        disappearance: None,
                        division: None,
                        in_arcs: Vec::new(),
                        out_arcs: Vec::new(),
                    });
                    entry.count = *count;
                    entry.appearance = *appearance;
                    entry.in_arcs = arcs.clone();
                }
                Constraint::OutgoingConservation {
                    node,
                    count,
                    arcs,
                    disappearance,
                    division,
                } => {
                    let entry = by_node.entry(*node).or_insert_with(|| StructNode {
                        id: *node,
                        count: *count,
                        appearance: None,
                        disappearance: None,
                        division: None,
                        in_arcs: Vec::new(),
                        out_arcs: Vec::new(),
                    });
                    entry.count = *count;
                    entry.disappearance = *disappearance;
                    entry.division = *division;
                    entry.out_arcs = arcs.clone();
                }
                Constraint::DivisionCoupling { .. } => {}
                Constraint::ForcedLabel { .. } => {
                    return Err(TrackingError::config(
                        "forced labels require the exact backend",
                    ));
                }
            }
        }

        let nodes: Vec<StructNode> = by_node.into_values().collect();

        let mut arc_ends: BTreeMap<usize, (usize, usize)> = BTreeMap::new();
        for (i, node) in nodes.iter().enumerate() {
            for &a in &node.out_arcs {
                arc_ends.entry(a).or_insert((usize::MAX, usize::MAX)).0 = i;
            }
            for &a in &node.in_arcs {
                arc_ends.entry(a).or_insert((usize::MAX, usize::MAX)).1 = i;
            }
        }
        for (&arc, &(src, dst)) in &arc_ends {
            if src == usize::MAX || dst == usize::MAX {
                return Err(TrackingError::config(format!(
                    "arc variable {} is not referenced by both of its endpoints",
                    arc
                )));
            }
        }

        // topological sort (Kahn)
        let mut order = Vec::with_capacity(nodes.len());
        let mut indegree: Vec<usize> = nodes.iter().map(|n| n.in_arcs.len()).collect();
        let mut queue: Vec<usize> = indegree
            .iter()
            .enumerate()
            .filter(|(_, &d)| d == 0)
            .map(|(i, _)| i)
            .collect();
        while let Some(i) = queue.pop() {
            order.push(i);
            for &a in &nodes[i].out_arcs {
                let (_, dst) = arc_ends[&a];
                indegree[dst] -= 1;
                if indegree[dst] == 0 {
                    queue.push(dst);
                }
            }
        }
        if order.len() != nodes.len() {
            return Err(TrackingError::config(
                "conservation constraints do not describe a DAG",
            ));
        }

        // reorder nodes topologically, remapping arc endpoints
        let mut rank = vec![0usize; nodes.len()];
        for (r, &i) in order.iter().enumerate() {
            rank[i] = r;
        }
        let mut sorted: Vec<Option<StructNode>> = nodes.into_iter().map(Some).collect();
        let mut topo_nodes: Vec<StructNode> = Vec::with_capacity(sorted.len());
        for &i in &order {
            topo_nodes.push(sorted[i].take().expect("each node moved once"));
        }
        let arc_ends = arc_ends
            .into_iter()
            .map(|(a, (s, d))| (a, (rank[s], rank[d])))
            .collect();

        Ok(Self {
            nodes: topo_nodes,
            arc_ends,
        })
    }
}

/// How the cheapest chain reached a node
#[derive(Debug, Clone, Copy)]
enum Arrival {
    /// Chain starts here via the appearance variable
    Appear,
    /// Chain continues from a predecessor over this arc variable
    ViaArc { arc: usize, from: usize },
    /// Chain starts here as the second daughter of a dividing parent
    ViaDivision { arc: usize, parent: usize },
}

/// Successive best-chain solver
pub struct DynProgBackend {
    #[allow(dead_code)]
    options: SolverOptions,
    last: Option<Labeling>,
    built: bool,
}

impl DynProgBackend {
    /// Create a backend with the given options
    pub fn new(options: SolverOptions) -> Self {
        Self {
            options,
            last: None,
            built: false,
        }
    }

    /// Cost of raising a variable by one unit, or None at the domain cap
    fn delta(instance: &ProblemInstance, states: &[usize], var: usize) -> Option<f64> {
        let costs = &instance.variable(var).costs;
        let s = states[var];
        if s + 1 < costs.len() {
            Some(costs[s + 1] - costs[s])
        } else {
            None
        }
    }

    /// Run one DP sweep; returns the applied chain's gain, if any
    fn extract_chain(
        instance: &ProblemInstance,
        structure: &Structure,
        states: &mut [usize],
    ) -> Option<f64> {
        let n = structure.nodes.len();
        let mut dp = vec![f64::INFINITY; n];
        let mut arrival: Vec<Option<Arrival>> = vec![None; n];

        for (i, node) in structure.nodes.iter().enumerate() {
            // a divided node is frozen at count 1; no further routing
            if node.division.map_or(false, |d| states[d] == 1) {
                continue;
            }
            let det = match Self::delta(instance, states, node.count) {
                Some(d) => d,
                None => continue, // node already at capacity
            };

            let mut best = f64::INFINITY;
            let mut how = None;

            if let Some(app) = node.appearance {
                if let Some(d) = Self::delta(instance, states, app) {
                    if d < best {
                        best = d;
                        how = Some(Arrival::Appear);
                    }
                }
            }

            for &arc in &node.in_arcs {
                let (src, _) = structure.arc_ends[&arc];
                let arc_delta = match Self::delta(instance, states, arc) {
                    Some(d) => d,
                    None => continue,
                };

                // continuation of a chain routed through the predecessor
                if dp[src].is_finite() {
                    let cost = dp[src] + arc_delta;
                    if cost < best {
                        best = cost;
                        how = Some(Arrival::ViaArc { arc, from: src });
                    }
                }

                // second daughter of a dividing predecessor
                let parent = &structure.nodes[src];
                if let Some(div) = parent.division {
                    let divides_cleanly = states[div] == 0
                        && states[parent.count] == 1
                        && states[arc] == 0
                        && parent
                            .out_arcs
                            .iter()
                            .map(|&a| states[a])
                            .sum::<usize>()
                            == 1;
                    if divides_cleanly {
                        if let Some(div_delta) = Self::delta(instance, states, div) {
                            let cost = div_delta + arc_delta;
                            if cost < best {
                                best = cost;
                                how = Some(Arrival::ViaDivision { arc, parent: src });
                            }
                        }
                    }
                }
            }

            if best.is_finite() {
                dp[i] = det + best;
                arrival[i] = how;
            }
        }

        // cheapest terminating chain
        let mut best_total = f64::INFINITY;
        let mut best_end = None;
        for (i, node) in structure.nodes.iter().enumerate() {
            if !dp[i].is_finite() {
                continue;
            }
            if let Some(dis) = node.disappearance {
                if let Some(d) = Self::delta(instance, states, dis) {
                    let total = dp[i] + d;
                    if total < best_total {
                        best_total = total;
                        best_end = Some(i);
                    }
                }
            }
        }

        let end = best_end?;
        if best_total >= -EPS {
            return None;
        }

        // apply the chain back to front
        let mut i = end;
        states[structure.nodes[end]
            .disappearance
            .expect("terminating node has a disappearance variable")] += 1;
        loop {
            states[structure.nodes[i].count] += 1;
            match arrival[i].expect("finite dp entries carry an arrival") {
                Arrival::Appear => {
                    states[structure.nodes[i]
                        .appearance
                        .expect("appear arrival requires the variable")] += 1;
                    break;
                }
                Arrival::ViaArc { arc, from } => {
                    states[arc] += 1;
                    i = from;
                }
                Arrival::ViaDivision { arc, parent } => {
                    states[arc] += 1;
                    let div = structure.nodes[parent]
                        .division
                        .expect("division arrival requires the variable");
                    states[div] = 1;
                    break;
                }
            }
        }

        Some(best_total)
    }
}

impl InferenceBackend for DynProgBackend {
    fn name(&self) -> &'static str {
        "dynprog"
    }

    fn build(&mut self, instance: &ProblemInstance) -> Result<(), TrackingError> {
        if instance.num_variables() == 0 {
            return Err(TrackingError::config(
                "cannot build a solver over an empty problem instance",
            ));
        }
        if instance.with_constraints {
            // validate the structure up front so failures surface before
            // any solve attempt
            Structure::from_instance(instance)?;
        }
        self.built = true;
        Ok(())
    }

    fn infer(&mut self, instance: &ProblemInstance) -> Result<Labeling, TrackingError> {
        if !self.built {
            return Err(TrackingError::config(
                "infer called before build on the dynprog backend",
            ));
        }

        let mut states = vec![0usize; instance.num_variables()];

        if !instance.with_constraints {
            // without coupling the optimum is per-variable minimization
            for (i, state) in states.iter_mut().enumerate() {
                let costs = &instance.variable(i).costs;
                *state = argmin(costs);
            }
        } else {
            let structure = Structure::from_instance(instance)?;
            let cap = (instance.max_number_objects + 1) * structure.nodes.len().max(1);
            let mut rounds = 0usize;
            while rounds < cap {
                match Self::extract_chain(instance, &structure, &mut states) {
                    Some(gain) => {
                        debug!("dynprog chain applied, gain {:.4}", gain);
                        rounds += 1;
                    }
                    None => break,
                }
            }
            instance.check_feasible(&states)?;
        }

        let labeling = instance.labeling(states, true);
        self.last = Some(labeling.clone());
        Ok(labeling)
    }

    fn last_solution(&self) -> Result<Labeling, TrackingError> {
        self.last
            .clone()
            .ok_or_else(|| TrackingError::config("no solve has been run on the dynprog backend"))
    }
}

pub(crate) fn argmin(costs: &[f64]) -> usize {
    let mut best = 0;
    for (i, c) in costs.iter().enumerate() {
        if *c < costs[best] {
            best = i;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypotheses::graph::ArcId;
    use crate::model::problem::VariableKind;

    /// Two nodes in consecutive frames joined by one arc; activating the
    /// chain saves energy.
    fn chain_instance() -> ProblemInstance {
        let mut inst = ProblemInstance::new(1, true, false);
        let n0 = NodeId(0);
        let n1 = NodeId(1);
        // being inactive is expensive (strong detections)
        let c0 = inst.add_variable(VariableKind::NodeCount(n0), vec![5.0, 0.5]);
        let c1 = inst.add_variable(VariableKind::NodeCount(n1), vec![5.0, 0.5]);
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
    fn test_chain_extraction_activates_track() {
        let inst = chain_instance();
        let mut backend = DynProgBackend::new(SolverOptions::default());
        backend.build(&inst).unwrap();
        let labeling = backend.infer(&inst).unwrap();

        // both nodes active, arc active, appearance and disappearance used
        assert_eq!(labeling.states, vec![1, 1, 1, 1, 1]);
        assert!((labeling.energy - 2.0).abs() < 1e-9);
        assert!(inst.check_feasible(&labeling.states).is_ok());
    }

    #[test]
    fn test_no_negative_chain_stays_empty() {
        let mut inst = chain_instance();
        // make activity unattractive
        for i in 0..2 {
            inst.variable_costs_mut(i)[0] = 0.0;
            inst.variable_costs_mut(i)[1] = 5.0;
        }
        let mut backend = DynProgBackend::new(SolverOptions::default());
        backend.build(&inst).unwrap();
        let labeling = backend.infer(&inst).unwrap();
        assert_eq!(labeling.states, vec![0, 0, 0, 0, 0]);
        assert_eq!(labeling.energy, 0.0);
    }

    #[test]
    fn test_forced_labels_rejected() {
        let mut inst = chain_instance();
        inst.force_node_count(NodeId(0), 1).unwrap();
        let mut backend = DynProgBackend::new(SolverOptions::default());
        assert!(backend.build(&inst).is_err());
    }

    #[test]
    fn test_mbest_unsupported() {
        let inst = chain_instance();
        let mut backend = DynProgBackend::new(SolverOptions::default());
        backend.build(&inst).unwrap();
        backend.infer(&inst).unwrap();
        assert!(backend.solution(0).is_ok());
        assert!(backend.solution(1).is_err());
    }
}
