//! The solver-agnostic problem instance
//!
//! Decision variables with explicit cost tables, an immutable list of
//! constraint descriptors built in one pass, and bidirectional maps
//! between graph elements and variable indices. Backends consume this
//! structure read-only; plain and serializable so it can be dumped for
//! external solvers or debugging.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::energy::EnergyType;
use crate::errors::TrackingError;
use crate::hypotheses::graph::{ArcId, NodeId};

/// What a decision variable decides
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VariableKind {
    /// Number of objects occupying a node, 0..=N
    NodeCount(NodeId),
    /// Units of flow realized along an arc, 0..=N
    ArcCount(ArcId),
    /// Whether a node is the start of a division, 0..=1
    Division(NodeId),
    /// Objects appearing at a node, 0..=N
    Appearance(NodeId),
    /// Objects disappearing at a node, 0..=N
    Disappearance(NodeId),
}

impl VariableKind {
    /// The energy term this variable's cost table belongs to
    pub fn energy_type(&self) -> EnergyType {
        match self {
            VariableKind::NodeCount(_) => EnergyType::Detection,
            VariableKind::ArcCount(_) => EnergyType::Transition,
            VariableKind::Division(_) => EnergyType::Division,
            VariableKind::Appearance(_) => EnergyType::Appearance,
            VariableKind::Disappearance(_) => EnergyType::Disappearance,
        }
    }
}

/// One decision variable: a kind, and one cost per state.
///
/// The domain is 0..costs.len().
#[derive(Debug, Clone, Serialize)]
pub struct Variable {
    /// What this variable decides
    pub kind: VariableKind,
    /// Energy per state; states index the table
    pub costs: Vec<f64>,
}

impl Variable {
    /// Number of states in the domain
    #[inline]
    pub fn num_states(&self) -> usize {
        self.costs.len()
    }

    /// Smallest cost over the domain (admissible bound contribution)
    pub fn min_cost(&self) -> f64 {
        self.costs.iter().copied().fold(f64::INFINITY, f64::min)
    }
}

/// Hard constraint descriptors.
///
/// Built in one pass by the model builder and handed whole to the
/// backend; never mutated incrementally afterwards.
#[derive(Debug, Clone, Serialize)]
pub enum Constraint {
    /// node count = sum of incoming arc states + appearance units
    IncomingConservation {
        /// Node this constraint belongs to
        node: NodeId,
        /// Count variable index
        count: usize,
        /// Incoming arc variable indices
        arcs: Vec<usize>,
        /// Appearance variable index, if the node may appear
        appearance: Option<usize>,
    },
    /// node count + division = sum of outgoing arc states + disappearance
    OutgoingConservation {
        /// Node this constraint belongs to
        node: NodeId,
        /// Count variable index
        count: usize,
        /// Outgoing arc variable indices
        arcs: Vec<usize>,
        /// Disappearance variable index, if the node may disappear
        disappearance: Option<usize>,
        /// Division variable index, if the node may divide
        division: Option<usize>,
    },
    /// division = 1 implies count = 1, no disappearance, and exactly two
    /// outgoing arcs carrying one unit each
    DivisionCoupling {
        /// Node this constraint belongs to
        node: NodeId,
        /// Division variable index
        division: usize,
        /// Count variable index
        count: usize,
        /// Outgoing arc variable indices
        arcs: Vec<usize>,
        /// Disappearance variable index, if present
        disappearance: Option<usize>,
    },
    /// A variable pinned to one state (training labels, warm-started
    /// partial solutions). Inconsistent forced labels are the canonical
    /// source of infeasible instances.
    ForcedLabel {
        /// Node the forced variable belongs to
        node: NodeId,
        /// Variable index
        var: usize,
        /// Pinned state
        state: usize,
    },
}

/// Verdict of a constraint over a (partial) assignment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feasibility {
    /// Satisfied under every completion observed so far
    Satisfied,
    /// Violated under every completion
    Violated,
    /// Depends on unassigned variables
    Undetermined,
}

/// Sum range of a set of variables under a partial assignment
fn sum_range(vars: &[usize], states: &[Option<usize>], instance: &ProblemInstance) -> (i64, i64) {
    let mut lo = 0i64;
    let mut hi = 0i64;
    for &v in vars {
        match states[v] {
            Some(s) => {
                lo += s as i64;
                hi += s as i64;
            }
            None => {
                hi += (instance.variable(v).num_states() - 1) as i64;
            }
        }
    }
    (lo, hi)
}

fn opt_range(
    var: Option<usize>,
    states: &[Option<usize>],
    instance: &ProblemInstance,
) -> (i64, i64) {
    match var {
        None => (0, 0),
        Some(v) => match states[v] {
            Some(s) => (s as i64, s as i64),
            None => (0, (instance.variable(v).num_states() - 1) as i64),
        },
    }
}

impl Constraint {
    /// Short name used in error contexts
    pub fn name(&self) -> &'static str {
        match self {
            Constraint::IncomingConservation { .. } => "incoming-conservation",
            Constraint::OutgoingConservation { .. } => "outgoing-conservation",
            Constraint::DivisionCoupling { .. } => "division-coupling",
            Constraint::ForcedLabel { .. } => "forced-label",
        }
    }

    /// Node the constraint belongs to
    pub fn node(&self) -> NodeId {
        match self {
            Constraint::IncomingConservation { node, .. }
            | Constraint::OutgoingConservation { node, .. }
            | Constraint::DivisionCoupling { node, .. }
            | Constraint::ForcedLabel { node, .. } => *node,
        }
    }

    /// Evaluate the constraint over a partial assignment.
    ///
    /// Interval reasoning: a conservation equation is violated as soon as
    /// the attainable ranges of its two sides no longer overlap.
    pub fn check(&self, states: &[Option<usize>], instance: &ProblemInstance) -> Feasibility {
        match self {
            Constraint::IncomingConservation {
                count,
                arcs,
                appearance,
                ..
            } => {
                let (c_lo, c_hi) = opt_range(Some(*count), states, instance);
                let (in_lo, in_hi) = sum_range(arcs, states, instance);
                let (a_lo, a_hi) = opt_range(*appearance, states, instance);
                ranges_equal((c_lo, c_hi), (in_lo + a_lo, in_hi + a_hi))
            }
            Constraint::OutgoingConservation {
                count,
                arcs,
                disappearance,
                division,
                ..
            } => {
                let (c_lo, c_hi) = opt_range(Some(*count), states, instance);
                let (v_lo, v_hi) = opt_range(*division, states, instance);
                let (out_lo, out_hi) = sum_range(arcs, states, instance);
                let (d_lo, d_hi) = opt_range(*disappearance, states, instance);
                ranges_equal(
                    (c_lo + v_lo, c_hi + v_hi),
                    (out_lo + d_lo, out_hi + d_hi),
                )
            }
            Constraint::ForcedLabel { var, state, .. } => match states[*var] {
                None => Feasibility::Undetermined,
                Some(s) if s == *state => Feasibility::Satisfied,
                Some(_) => Feasibility::Violated,
            },
            Constraint::DivisionCoupling {
                division,
                count,
                arcs,
                disappearance,
                ..
            } => {
                match states[*division] {
                    None => Feasibility::Undetermined,
                    Some(0) => Feasibility::Satisfied,
                    Some(_) => {
                        // dividing node: count must be exactly 1
                        match states[*count] {
                            Some(c) if c != 1 => return Feasibility::Violated,
                            None => return Feasibility::Undetermined,
                            _ => {}
                        }
                        // no disappearance at a divider
                        if let Some(d) = disappearance {
                            match states[*d] {
                                Some(s) if s != 0 => return Feasibility::Violated,
                                None => return Feasibility::Undetermined,
                                _ => {}
                            }
                        }
                        // exactly two outgoing arcs, one unit each
                        let mut active = 0usize;
                        for &a in arcs {
                            match states[a] {
                                Some(0) => {}
                                Some(1) => active += 1,
                                Some(_) => return Feasibility::Violated,
                                None => return Feasibility::Undetermined,
                            }
                        }
                        if active == 2 {
                            Feasibility::Satisfied
                        } else {
                            Feasibility::Violated
                        }
                    }
                }
            }
        }
    }
}

fn ranges_equal(lhs: (i64, i64), rhs: (i64, i64)) -> Feasibility {
    if lhs.0 == lhs.1 && rhs.0 == rhs.1 {
        if lhs.0 == rhs.0 {
            Feasibility::Satisfied
        } else {
            Feasibility::Violated
        }
    } else if lhs.1 < rhs.0 || rhs.1 < lhs.0 {
        Feasibility::Violated
    } else {
        Feasibility::Undetermined
    }
}

/// A complete assignment of all decision variables.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Labeling {
    /// State per variable, indexed like the instance's variables
    pub states: Vec<usize>,
    /// Total energy of the assignment
    pub energy: f64,
    /// False when the solve was cut short (timeout incumbent)
    pub optimal: bool,
}

/// The complete problem instance handed to a backend.
#[derive(Debug, Default, Serialize)]
pub struct ProblemInstance {
    /// Cap on simultaneously co-located objects (N)
    pub max_number_objects: usize,
    /// Whether hard constraints were emitted
    pub with_constraints: bool,
    /// Whether division variables were emitted
    pub with_divisions: bool,

    variables: Vec<Variable>,
    constraints: Vec<Constraint>,

    node_count_var: BTreeMap<NodeId, usize>,
    arc_var: BTreeMap<ArcId, usize>,
    division_var: BTreeMap<NodeId, usize>,
    appearance_var: BTreeMap<NodeId, usize>,
    disappearance_var: BTreeMap<NodeId, usize>,
}

impl ProblemInstance {
    pub(crate) fn new(max_number_objects: usize, with_constraints: bool, with_divisions: bool) -> Self {
        Self {
            max_number_objects,
            with_constraints,
            with_divisions,
            ..Default::default()
        }
    }

    pub(crate) fn add_variable(&mut self, kind: VariableKind, costs: Vec<f64>) -> usize {
        let index = self.variables.len();
        match kind {
            VariableKind::NodeCount(n) => {
                self.node_count_var.insert(n, index);
            }
            VariableKind::ArcCount(a) => {
                self.arc_var.insert(a, index);
            }
            VariableKind::Division(n) => {
                self.division_var.insert(n, index);
            }
            VariableKind::Appearance(n) => {
                self.appearance_var.insert(n, index);
            }
            VariableKind::Disappearance(n) => {
                self.disappearance_var.insert(n, index);
            }
        }
        self.variables.push(Variable { kind, costs });
        index
    }

    pub(crate) fn add_constraint(&mut self, constraint: Constraint) {
        self.constraints.push(constraint);
    }

    /// Pin a node's count variable to a fixed state.
    ///
    /// Used to fix labeled detections before a solve. Inconsistent forced
    /// labels make the instance infeasible, which the backend reports as
    /// the distinguished infeasibility error.
    pub fn force_node_count(&mut self, node: NodeId, state: usize) -> Result<(), TrackingError> {
        let var = self.node_count_var(node).ok_or_else(|| {
            TrackingError::config(format!("no count variable for node {:?}", node))
        })?;
        if state >= self.variables[var].num_states() {
            return Err(TrackingError::config(format!(
                "forced state {} outside domain of node {:?}",
                state, node
            )));
        }
        self.constraints.push(Constraint::ForcedLabel { node, var, state });
        Ok(())
    }

    /// Whether any forced labels are present (only the exact backend
    /// honors them)
    pub fn has_forced_labels(&self) -> bool {
        self.constraints
            .iter()
            .any(|c| matches!(c, Constraint::ForcedLabel { .. }))
    }

    /// Number of decision variables
    pub fn num_variables(&self) -> usize {
        self.variables.len()
    }

    /// Variable by index
    pub fn variable(&self, index: usize) -> &Variable {
        &self.variables[index]
    }

    /// All variables
    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    /// Mutable cost access, used by the perturbation engine
    pub(crate) fn variable_costs_mut(&mut self, index: usize) -> &mut Vec<f64> {
        &mut self.variables[index].costs
    }

    /// The immutable constraint list
    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    /// Count variable of a node
    pub fn node_count_var(&self, node: NodeId) -> Option<usize> {
        self.node_count_var.get(&node).copied()
    }

    /// Arc variable of an arc
    pub fn arc_var(&self, arc: ArcId) -> Option<usize> {
        self.arc_var.get(&arc).copied()
    }

    /// Division variable of a node
    pub fn division_var(&self, node: NodeId) -> Option<usize> {
        self.division_var.get(&node).copied()
    }

    /// Appearance variable of a node
    pub fn appearance_var(&self, node: NodeId) -> Option<usize> {
        self.appearance_var.get(&node).copied()
    }

    /// Disappearance variable of a node
    pub fn disappearance_var(&self, node: NodeId) -> Option<usize> {
        self.disappearance_var.get(&node).copied()
    }

    /// Total energy of a complete assignment
    pub fn evaluate(&self, states: &[usize]) -> f64 {
        self.variables
            .iter()
            .zip(states.iter())
            .map(|(v, &s)| v.costs[s])
            .sum()
    }

    /// Check a complete assignment against all constraints.
    ///
    /// Returns the distinguished infeasibility error naming the first
    /// violated constraint, so callers never mistake an infeasible
    /// assignment for a valid empty solution.
    pub fn check_feasible(&self, states: &[usize]) -> Result<(), TrackingError> {
        if !self.with_constraints {
            return Ok(());
        }
        let assigned: Vec<Option<usize>> = states.iter().map(|&s| Some(s)).collect();
        for constraint in &self.constraints {
            if constraint.check(&assigned, self) == Feasibility::Violated {
                return Err(TrackingError::Infeasible {
                    constraint: constraint.name().to_string(),
                    context: format!("node {:?}", constraint.node()),
                });
            }
        }
        Ok(())
    }

    /// Wrap a complete assignment into a labeling with its energy
    pub fn labeling(&self, states: Vec<usize>, optimal: bool) -> Labeling {
        let energy = self.evaluate(&states);
        Labeling {
            states,
            energy,
            optimal,
        }
    }
}
