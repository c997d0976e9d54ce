/*!
Uncertainty estimation via perturbed re-solves.

The engine wraps an inference backend: iteration 0 is the unperturbed MAP
solve, iterations 1..K-1 rebuild a fresh problem instance, perturb its
costs with the selected strategy ([`perturbation`]) and solve again. Each
labeling is appended to an ordered solution list; per-node relative
uncertainty is the fraction of iterations in which the node was active.
*/

pub mod perturbation;

use log::{debug, info};
use rand::RngCore;
use rayon::prelude::*;
use serde::Serialize;

use crate::energy::CostFunctions;
use crate::errors::TrackingError;
use crate::events::EventVectorVector;
use crate::hypotheses::graph::{HypothesesGraph, NodeId};
use crate::hypotheses::tracklets::TrackletGraph;
use crate::inference::{create_backend, SolutionWriter, SolverOptions, SolverType};
use crate::model::builder::{ModelBuilder, ModelParameter, TransitionCache};
use crate::model::problem::Labeling;
use crate::traxels::TraxelStore;

pub use perturbation::{
    ClassifierUncertaintyPerturbation, DivMBestPerturbation, GaussianPerturbation,
    Perturbation, PerturbAndMapPerturbation,
};

/// Which perturbation strategy drives iterations 1..K-1
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PerturbationDistribution {
    /// Gaussian noise on every cost entry
    Gaussian,
    /// Gumbel noise (perturb-and-MAP sampling)
    PerturbAndMap,
    /// Diverse m-best penalty on previous labelings
    DiverseMbest,
    /// Noise scaled by classifier ambiguity
    ClassifierUncertainty,
    /// Ranked m-best enumeration in a single exact solve
    MbestExact,
}

/// Parameters of an uncertainty run
#[derive(Debug, Clone, Serialize)]
pub struct UncertaintyParameter {
    /// Strategy for the perturbed iterations
    pub distribution: PerturbationDistribution,
    /// Total number of solutions K, including the MAP solve
    pub iterations: usize,
    /// Per-energy-type strategy parameters (sigma/scale per
    /// [`EnergyType`](crate::energy::EnergyType) index; `[0]` doubles as
    /// the diverse-m-best penalty weight)
    pub parameters: Vec<f64>,
}

impl Default for UncertaintyParameter {
    /// Plain MAP: one iteration, no perturbation
    fn default() -> Self {
        Self {
            distribution: PerturbationDistribution::Gaussian,
            iterations: 1,
            parameters: Vec::new(),
        }
    }
}

impl UncertaintyParameter {
    /// Create a parameter set
    pub fn new(
        distribution: PerturbationDistribution,
        iterations: usize,
        parameters: Vec<f64>,
    ) -> Self {
        Self {
            distribution,
            iterations,
            parameters,
        }
    }
}

/// Result of an uncertainty run
#[derive(Debug, Clone)]
pub struct UncertaintyOutput {
    /// All labelings in iteration order; index 0 is the MAP solution
    pub solutions: Vec<Labeling>,
    /// Events derived from the MAP solution
    pub events: EventVectorVector,
}

/// Drives MAP plus perturbed re-solves and aggregates uncertainty.
pub struct PerturbationEngine {
    solver: SolverType,
    solver_options: SolverOptions,
    param: UncertaintyParameter,
}

impl PerturbationEngine {
    /// Create an engine for the chosen solver and uncertainty parameters
    pub fn new(
        solver: SolverType,
        solver_options: SolverOptions,
        param: UncertaintyParameter,
    ) -> Self {
        Self {
            solver,
            solver_options,
            param,
        }
    }

    fn create_perturbation(&self) -> Result<Box<dyn Perturbation>, TrackingError> {
        let params = self.param.parameters.clone();
        match self.param.distribution {
            PerturbationDistribution::Gaussian => {
                Ok(Box::new(GaussianPerturbation { sigmas: params }))
            }
            PerturbationDistribution::PerturbAndMap => {
                Ok(Box::new(PerturbAndMapPerturbation { scales: params }))
            }
            PerturbationDistribution::DiverseMbest => Ok(Box::new(DivMBestPerturbation {
                lambda: params.first().copied().unwrap_or(1.0),
            })),
            PerturbationDistribution::ClassifierUncertainty => {
                Ok(Box::new(ClassifierUncertaintyPerturbation { scales: params }))
            }
            PerturbationDistribution::MbestExact => Err(TrackingError::config(
                "m-best enumeration is not an iterative perturbation",
            )),
        }
    }

    /// Run MAP plus K-1 perturbed iterations.
    ///
    /// Labels of every iteration are appended to the base graph;
    /// relative uncertainty is written to its node property map. The
    /// solution list is append-only and ordered by iteration.
    pub fn run(
        &self,
        graph: &mut HypothesesGraph,
        tracklets: Option<&TrackletGraph>,
        store: &TraxelStore,
        costs: &CostFunctions,
        model_param: &ModelParameter,
        rng: &mut dyn RngCore,
    ) -> Result<UncertaintyOutput, TrackingError> {
        let iterations = self.param.iterations.max(1);

        // transition costs are shared read-only across all rebuilds
        let cache = TransitionCache::compute(tracklets.map_or(&*graph, |t| &t.graph), costs);

        fn build_instance(
            graph: &HypothesesGraph,
            tracklets: Option<&TrackletGraph>,
            store: &TraxelStore,
            costs: &CostFunctions,
            model_param: &ModelParameter,
            cache: &TransitionCache,
        ) -> Result<crate::model::problem::ProblemInstance, TrackingError> {
            let builder = ModelBuilder::new(graph, store, costs, model_param);
            let builder = match tracklets {
                Some(t) => builder.with_tracklets(t),
                None => builder,
            };
            builder.with_transition_cache(cache).build()
        }

        let mut solutions: Vec<Labeling> = Vec::new();
        let mut events = Vec::new();

        if self.param.distribution == PerturbationDistribution::MbestExact && iterations > 1 {
            // single solve, ranked extraction
            info!("m-best enumeration of {} ranked solutions", iterations);
            let options = SolverOptions {
                num_solutions: iterations,
                ..self.solver_options.clone()
            };
            let mut backend = create_backend(self.solver, options, model_param.with_divisions)?;
            let instance = build_instance(graph, tracklets, store, costs, model_param, &cache)?;
            backend.build(&instance)?;
            backend.infer(&instance)?;

            let writer = SolutionWriter::new(&instance, tracklets);
            for k in 0..iterations {
                // fewer than K distinct solutions may exist
                let labeling = match backend.solution(k) {
                    Ok(l) => l,
                    Err(_) => break,
                };
                writer.conclude(graph, &labeling)?;
                if k == 0 {
                    events = writer.derive_events(graph, &labeling, 0);
                }
                solutions.push(labeling);
            }
        } else {
            debug!("uncertainty iteration 0 (MAP)");
            let instance = build_instance(graph, tracklets, store, costs, model_param, &cache)?;
            let mut backend = create_backend(
                self.solver,
                self.solver_options.clone(),
                model_param.with_divisions,
            )?;
            backend.build(&instance)?;
            let map_labeling = backend.infer(&instance)?;
            let writer = SolutionWriter::new(&instance, tracklets);
            writer.conclude(graph, &map_labeling)?;
            events = writer.derive_events(graph, &map_labeling, 0);
            solutions.push(map_labeling);

            if iterations > 1 {
                let strategy = self.create_perturbation()?;
                info!(
                    "running {} perturbed iterations with the {} strategy",
                    iterations - 1,
                    strategy.name()
                );
                for iteration in 1..iterations {
                    debug!("uncertainty iteration {}", iteration);
                    let mut instance = build_instance(graph, tracklets, store, costs, model_param, &cache)?;
                    {
                        let view_graph = tracklets.map_or(&*graph, |t| &t.graph);
                        strategy.perturb(&mut instance, view_graph, store, &solutions, rng);
                    }
                    let mut backend = create_backend(
                        self.solver,
                        self.solver_options.clone(),
                        model_param.with_divisions,
                    )?;
                    backend.build(&instance)?;
                    let labeling = backend.infer(&instance)?;
                    let writer = SolutionWriter::new(&instance, tracklets);
                    writer.conclude(graph, &labeling)?;
                    solutions.push(labeling);
                }
            }
        }

        compute_relative_uncertainty(graph, solutions.len());

        Ok(UncertaintyOutput { solutions, events })
    }
}

/// Per-node empirical marginal: active iterations / K.
///
/// K = 1 degenerates to plain MAP where uncertainty is not defined; it is
/// written as 0 by convention, never NaN.
pub fn compute_relative_uncertainty(graph: &mut HypothesesGraph, iterations: usize) {
    let nodes: Vec<NodeId> = graph.nodes().collect();
    let values: Vec<f64> = if iterations <= 1 {
        vec![0.0; nodes.len()]
    } else {
        nodes
            .par_iter()
            .map(|&node| {
                let active = graph
                    .active_counts(node)
                    .iter()
                    .filter(|&&c| c > 0)
                    .count();
                active as f64 / iterations as f64
            })
            .collect()
    };
    for (node, value) in nodes.into_iter().zip(values) {
        graph.set_relative_uncertainty(node, value);
    }
}
