//! Exact branch-and-bound backend
//!
//! Depth-first search over the integer decision variables with interval
//! constraint propagation and an admissible suffix bound. This is the
//! reference backend: it supports warm starts, wall-clock timeouts that
//! return the best incumbent, and ranked m-best enumeration from a single
//! solve.

use std::time::Instant;

use log::{debug, warn};

use crate::errors::TrackingError;
use crate::inference::{InferenceBackend, SolverOptions};
use crate::model::problem::{Feasibility, Labeling, ProblemInstance};

/// How many search-node expansions between deadline checks
const TIMEOUT_CHECK_INTERVAL: u64 = 1024;

/// Branch-and-bound solver over a [`ProblemInstance`]
pub struct ExactBackend {
    options: SolverOptions,
    /// Ranked solutions of the last solve, best first
    solutions: Vec<Labeling>,
    built: bool,
}

impl ExactBackend {
    /// Create a backend with the given options
    pub fn new(options: SolverOptions) -> Self {
        Self {
            options,
            solutions: Vec::new(),
            built: false,
        }
    }

    /// Ranked solutions of the last solve, best first
    pub fn solutions(&self) -> &[Labeling] {
        &self.solutions
    }
}

impl InferenceBackend for ExactBackend {
    fn name(&self) -> &'static str {
        "exact"
    }

    fn supports_mbest(&self) -> bool {
        true
    }

    fn build(&mut self, instance: &ProblemInstance) -> Result<(), TrackingError> {
        if instance.num_variables() == 0 {
            return Err(TrackingError::config(
                "cannot build a solver over an empty problem instance",
            ));
        }
        self.built = true;
        Ok(())
    }

    fn infer(&mut self, instance: &ProblemInstance) -> Result<Labeling, TrackingError> {
        if !self.built {
            return Err(TrackingError::config(
                "infer called before build on the exact backend",
            ));
        }

        let keep = self.options.num_solutions.max(1);
        let mut search = Search::new(instance, keep, &self.options);

        if let Some(warm) = &self.options.warm_start {
            search.seed_incumbent(warm);
        }

        search.run();

        if search.best.is_empty() {
            if search.timed_out {
                return Err(TrackingError::Timeout {
                    elapsed_secs: search.started.elapsed().as_secs_f64(),
                });
            }
            return Err(TrackingError::Infeasible {
                constraint: search
                    .last_violated
                    .unwrap_or("conservation")
                    .to_string(),
                context: format!(
                    "no labeling satisfies all {} constraints",
                    instance.constraints().len()
                ),
            });
        }

        if search.timed_out {
            warn!(
                "exact solver hit its deadline after {} expansions; returning incumbent",
                search.expansions
            );
        } else {
            debug!(
                "exact solve finished: {} expansions, best energy {:.4}",
                search.expansions,
                search.best[0].0
            );
        }

        let optimal = !search.timed_out;
        self.solutions = search
            .best
            .into_iter()
            .map(|(_, states)| instance.labeling(states, optimal))
            .collect();
        Ok(self.solutions[0].clone())
    }

    fn solution(&self, k: usize) -> Result<Labeling, TrackingError> {
        self.solutions.get(k).cloned().ok_or_else(|| {
            TrackingError::config(format!(
                "exact backend kept {} ranked solutions, requested k={}",
                self.solutions.len(),
                k
            ))
        })
    }

    fn last_solution(&self) -> Result<Labeling, TrackingError> {
        self.solution(0)
    }
}

/// Depth-first search state
struct Search<'a> {
    instance: &'a ProblemInstance,
    /// Constraint indices involving each variable
    constraints_of: Vec<Vec<usize>>,
    /// suffix_min[i] = sum over variables i.. of their cheapest state
    suffix_min: Vec<f64>,
    /// States of each variable ordered by ascending cost
    value_order: Vec<Vec<usize>>,
    /// Kept complete assignments (energy, states), ascending, len <= keep
    best: Vec<(f64, Vec<usize>)>,
    keep: usize,
    states: Vec<Option<usize>>,
    deadline: Option<Instant>,
    started: Instant,
    timed_out: bool,
    expansions: u64,
    last_violated: Option<&'static str>,
}

impl<'a> Search<'a> {
    fn new(instance: &'a ProblemInstance, keep: usize, options: &SolverOptions) -> Self {
        let n = instance.num_variables();

        let mut constraints_of = vec![Vec::new(); n];
        for (ci, constraint) in instance.constraints().iter().enumerate() {
            for v in constraint_vars(constraint) {
                constraints_of[v].push(ci);
            }
        }

        let mut suffix_min = vec![0.0; n + 1];
        for i in (0..n).rev() {
            suffix_min[i] = suffix_min[i + 1] + instance.variable(i).min_cost();
        }

        let value_order = (0..n)
            .map(|i| {
                let costs = &instance.variable(i).costs;
                let mut order: Vec<usize> = (0..costs.len()).collect();
                order.sort_by(|&a, &b| {
                    costs[a]
                        .partial_cmp(&costs[b])
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
                order
            })
            .collect();

        let started = Instant::now();
        Self {
            instance,
            constraints_of,
            suffix_min,
            value_order,
            best: Vec::new(),
            keep,
            states: vec![None; n],
            deadline: options.timeout.map(|t| started + t),
            started,
            timed_out: false,
            expansions: 0,
            last_violated: None,
        }
    }

    /// Seed the incumbent list with a known-good assignment
    fn seed_incumbent(&mut self, states: &[usize]) {
        if states.len() != self.instance.num_variables() {
            warn!(
                "warm start ignored: {} states for {} variables",
                states.len(),
                self.instance.num_variables()
            );
            return;
        }
        if self.instance.check_feasible(states).is_ok() {
            let energy = self.instance.evaluate(states);
            self.record(energy, states.to_vec());
            debug!("warm start accepted with energy {:.4}", energy);
        } else {
            warn!("warm start ignored: infeasible assignment");
        }
    }

    fn record(&mut self, energy: f64, states: Vec<usize>) {
        // the DFS never revisits an assignment, but a warm start can
        // coincide with one found by the search
        if self.best.iter().any(|(_, s)| *s == states) {
            return;
        }
        let pos = self
            .best
            .partition_point(|(e, _)| *e <= energy);
        self.best.insert(pos, (energy, states));
        self.best.truncate(self.keep);
    }

    /// Worst energy still worth beating
    fn bound(&self) -> f64 {
        if self.best.len() < self.keep {
            f64::INFINITY
        } else {
            self.best[self.keep - 1].0
        }
    }

    fn run(&mut self) {
        self.dfs(0, 0.0);
    }

    fn dfs(&mut self, var: usize, cost: f64) {
        if self.timed_out {
            return;
        }
        self.expansions += 1;
        if self.expansions % TIMEOUT_CHECK_INTERVAL == 0 {
            if let Some(deadline) = self.deadline {
                if Instant::now() >= deadline {
                    self.timed_out = true;
                    return;
                }
            }
        }

        if var == self.instance.num_variables() {
            let states: Vec<usize> = self.states.iter().map(|s| s.unwrap()).collect();
            self.record(cost, states);
            return;
        }

        // admissible bound over the unassigned suffix
        if cost + self.suffix_min[var] >= self.bound() {
            return;
        }

        let order = self.value_order[var].clone();
        for state in order {
            let state_cost = self.instance.variable(var).costs[state];
            if cost + state_cost + self.suffix_min[var + 1] >= self.bound() {
                continue;
            }
            self.states[var] = Some(state);

            let mut violated = false;
            if self.instance.with_constraints {
                for &ci in &self.constraints_of[var] {
                    let constraint = &self.instance.constraints()[ci];
                    if constraint.check(&self.states, self.instance) == Feasibility::Violated {
                        self.last_violated = Some(constraint.name());
                        violated = true;
                        break;
                    }
                }
            }
            if !violated {
                self.dfs(var + 1, cost + state_cost);
            }
            self.states[var] = None;
            if self.timed_out {
                return;
            }
        }
    }
}

/// All variable indices referenced by a constraint
fn constraint_vars(constraint: &crate::model::problem::Constraint) -> Vec<usize> {
    use crate::model::problem::Constraint::*;
    match constraint {
        IncomingConservation {
            count,
            arcs,
            appearance,
            ..
        } => {
            let mut v = vec![*count];
            v.extend(arcs);
            v.extend(appearance.iter());
            v
        }
        OutgoingConservation {
            count,
            arcs,
            disappearance,
            division,
            ..
        } => {
            let mut v = vec![*count];
            v.extend(arcs);
            v.extend(disappearance.iter());
            v.extend(division.iter());
            v
        }
        DivisionCoupling {
            division,
            count,
            arcs,
            disappearance,
            ..
        } => {
            let mut v = vec![*division, *count];
            v.extend(arcs);
            v.extend(disappearance.iter());
            v
        }
        ForcedLabel { var, .. } => vec![*var],
    }
}
