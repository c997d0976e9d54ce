//! Perturbation strategies
//!
//! Each strategy mutates a freshly rebuilt problem instance's cost tables
//! before the next solve. Iteration 0 is always the unperturbed MAP
//! solve; strategies only see iterations 1..K-1.

use rand::RngCore;
use rand_distr::{Distribution, Gumbel, Normal};

use crate::energy::EnergyType;
use crate::hypotheses::graph::HypothesesGraph;
use crate::model::problem::{Labeling, ProblemInstance, VariableKind};
use crate::traxels::{Traxel, TraxelStore};

/// A cost-perturbation strategy.
///
/// `perturb` receives the fresh instance of the coming iteration, the
/// graph the instance was built over, and all previously produced
/// labelings (append-only, iteration order).
pub trait Perturbation {
    /// Strategy name for logs
    fn name(&self) -> &'static str;

    /// Mutate the instance's cost tables in place
    fn perturb(
        &self,
        instance: &mut ProblemInstance,
        graph: &HypothesesGraph,
        store: &TraxelStore,
        previous: &[Labeling],
        rng: &mut dyn RngCore,
    );
}

/// Per-energy-type standard deviation lookup
fn sigma_for(parameters: &[f64], energy_type: EnergyType) -> f64 {
    parameters.get(energy_type as usize).copied().unwrap_or(0.0)
}

/// Independent Gaussian noise per cost entry, with a per-energy-type
/// standard deviation.
pub struct GaussianPerturbation {
    /// Standard deviations indexed by [`EnergyType`]
    pub sigmas: Vec<f64>,
}

impl Perturbation for GaussianPerturbation {
    fn name(&self) -> &'static str {
        "gaussian"
    }

    fn perturb(
        &self,
        instance: &mut ProblemInstance,
        _graph: &HypothesesGraph,
        _store: &TraxelStore,
        _previous: &[Labeling],
        rng: &mut dyn RngCore,
    ) {
        for i in 0..instance.num_variables() {
            let sigma = sigma_for(&self.sigmas, instance.variable(i).kind.energy_type());
            if sigma <= 0.0 {
                continue;
            }
            let normal = Normal::new(0.0, sigma).expect("positive sigma");
            for cost in instance.variable_costs_mut(i).iter_mut() {
                *cost += normal.sample(rng);
            }
        }
    }
}

/// Perturb-and-MAP: i.i.d. Gumbel noise on the unary costs. Repeated MAP
/// solves then approximate samples from the model's distribution (exact
/// for tree-structured energies, approximate otherwise).
pub struct PerturbAndMapPerturbation {
    /// Noise scales indexed by [`EnergyType`]
    pub scales: Vec<f64>,
}

impl Perturbation for PerturbAndMapPerturbation {
    fn name(&self) -> &'static str {
        "perturb-and-map"
    }

    fn perturb(
        &self,
        instance: &mut ProblemInstance,
        _graph: &HypothesesGraph,
        _store: &TraxelStore,
        _previous: &[Labeling],
        rng: &mut dyn RngCore,
    ) {
        for i in 0..instance.num_variables() {
            let scale = sigma_for(&self.scales, instance.variable(i).kind.energy_type());
            if scale <= 0.0 {
                continue;
            }
            let gumbel = Gumbel::new(0.0, scale).expect("positive scale");
            for cost in instance.variable_costs_mut(i).iter_mut() {
                *cost += gumbel.sample(rng);
            }
        }
    }
}

/// Diverse m-best: penalize every previous solution's exact state per
/// variable by a weight, pushing the next solve a Hamming distance away
/// from all prior labelings.
pub struct DivMBestPerturbation {
    /// Penalty weight added per matching variable state
    pub lambda: f64,
}

impl Perturbation for DivMBestPerturbation {
    fn name(&self) -> &'static str {
        "diverse-m-best"
    }

    fn perturb(
        &self,
        instance: &mut ProblemInstance,
        _graph: &HypothesesGraph,
        _store: &TraxelStore,
        previous: &[Labeling],
        _rng: &mut dyn RngCore,
    ) {
        for labeling in previous {
            for (i, &state) in labeling.states.iter().enumerate() {
                if i >= instance.num_variables() {
                    break;
                }
                let costs = instance.variable_costs_mut(i);
                if state < costs.len() {
                    costs[state] += self.lambda;
                }
            }
        }
    }
}

/// Classifier-uncertainty perturbation: Gaussian noise whose magnitude is
/// drawn from the spread of the classifier's class probabilities, so
/// confident decisions are perturbed less than ambiguous ones.
pub struct ClassifierUncertaintyPerturbation {
    /// Base noise scales indexed by [`EnergyType`]
    pub scales: Vec<f64>,
}

impl ClassifierUncertaintyPerturbation {
    /// Ambiguity of a probability vector in [0, 1]: 0 for a confident
    /// classifier, 1 for a uniform one.
    fn ambiguity(probs: &[f64]) -> f64 {
        let max = probs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let min = probs.iter().copied().fold(f64::INFINITY, f64::min);
        if max.is_finite() && min.is_finite() {
            (1.0 - (max - min)).clamp(0.0, 1.0)
        } else {
            1.0
        }
    }

    fn traxel_ambiguity(traxel: Option<&Traxel>, feature: &str) -> f64 {
        traxel
            .and_then(|t| t.feature(feature))
            .map(|p| Self::ambiguity(p))
            .unwrap_or(1.0)
    }
}

impl Perturbation for ClassifierUncertaintyPerturbation {
    fn name(&self) -> &'static str {
        "classifier-uncertainty"
    }

    fn perturb(
        &self,
        instance: &mut ProblemInstance,
        graph: &HypothesesGraph,
        store: &TraxelStore,
        _previous: &[Labeling],
        rng: &mut dyn RngCore,
    ) {
        for i in 0..instance.num_variables() {
            let kind = instance.variable(i).kind;
            let base = sigma_for(&self.scales, kind.energy_type());
            if base <= 0.0 {
                continue;
            }
            let ambiguity = match kind {
                VariableKind::NodeCount(n) | VariableKind::Appearance(n) => {
                    Self::traxel_ambiguity(store.get(graph.first_traxel(n)), "detProb")
                }
                VariableKind::Disappearance(n) => {
                    Self::traxel_ambiguity(store.get(graph.last_traxel(n)), "detProb")
                }
                VariableKind::Division(n) => {
                    Self::traxel_ambiguity(store.get(graph.last_traxel(n)), "divProb")
                }
                // transitions carry no classifier output; full base scale
                VariableKind::ArcCount(_) => 1.0,
            };
            let sigma = base * ambiguity;
            if sigma <= 0.0 {
                continue;
            }
            let normal = Normal::new(0.0, sigma).expect("positive sigma");
            for cost in instance.variable_costs_mut(i).iter_mut() {
                *cost += normal.sample(rng);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypotheses::graph::NodeId;
    use crate::traxels::TraxelKey;
    use rand::SeedableRng;

    fn tiny_instance() -> (ProblemInstance, HypothesesGraph, TraxelStore) {
        let mut store = TraxelStore::new();
        store.add(
            Traxel::new(1, 0)
                .with_feature("com", vec![0.0, 0.0, 0.0])
                .with_feature("detProb", vec![0.5, 0.5]),
        );
        let mut graph = HypothesesGraph::new();
        let n = graph.add_node(TraxelKey::new(0, 1));
        let mut inst = ProblemInstance::new(1, false, false);
        inst.add_variable(VariableKind::NodeCount(n), vec![1.0, 2.0]);
        (inst, graph, store)
    }

    #[test]
    fn test_gaussian_changes_costs_deterministically_per_seed() {
        let (mut a, graph, store) = tiny_instance();
        let (mut b, _, _) = tiny_instance();
        let strategy = GaussianPerturbation {
            sigmas: vec![0.0, 0.0, 1.0, 0.0, 0.0],
        };
        let mut rng_a = rand::rngs::StdRng::seed_from_u64(7);
        let mut rng_b = rand::rngs::StdRng::seed_from_u64(7);
        strategy.perturb(&mut a, &graph, &store, &[], &mut rng_a);
        strategy.perturb(&mut b, &graph, &store, &[], &mut rng_b);
        assert_eq!(a.variable(0).costs, b.variable(0).costs);
        assert_ne!(a.variable(0).costs, vec![1.0, 2.0]);
    }

    #[test]
    fn test_divmbest_penalizes_previous_states() {
        let (mut inst, graph, store) = tiny_instance();
        let previous = vec![Labeling {
            states: vec![1],
            energy: 2.0,
            optimal: true,
        }];
        let strategy = DivMBestPerturbation { lambda: 10.0 };
        let mut rng = rand::rngs::StdRng::seed_from_u64(0);
        strategy.perturb(&mut inst, &graph, &store, &previous, &mut rng);
        assert_eq!(inst.variable(0).costs, vec![1.0, 12.0]);
    }

    #[test]
    fn test_ambiguity_scales() {
        assert!((ClassifierUncertaintyPerturbation::ambiguity(&[0.5, 0.5]) - 1.0).abs() < 1e-12);
        assert!(ClassifierUncertaintyPerturbation::ambiguity(&[0.01, 0.99]) < 0.05);
    }
}
