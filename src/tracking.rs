//! Tracking pipeline facade
//!
//! Orchestrates the full conservation tracking run: detection-probability
//! injection, hypotheses graph construction, model building, inference
//! with optional perturbations, event derivation and optional merger
//! resolution.

use std::collections::BTreeMap;
use std::time::Duration;

use log::info;
use rand::RngCore;

use crate::energy::{
    inject_detection_probabilities, CostFunctions, DetectionPrior, NegLnTransition,
};
use crate::errors::TrackingError;
use crate::events::{merge_event_vectors, EventVectorVector};
use crate::field_of_view::FieldOfView;
use crate::hypotheses::builder::{BuilderOptions, SingleTimestepBuilder};
use crate::hypotheses::graph::HypothesesGraph;
use crate::hypotheses::tracklets::generate_tracklet_graph;
use crate::inference::{SolverOptions, SolverType};
use crate::mergers::clustering::GaussianMixture;
use crate::mergers::resolver::{MergerResolver, ResolvedMerger, TimestepIdCoordinateMap};
use crate::model::builder::ModelParameter;
use crate::model::problem::Labeling;
use crate::traxels::{TraxelKey, TraxelStore};
use crate::uncertainty::{PerturbationEngine, UncertaintyParameter};

/// Everything a tracking run is configured by.
#[derive(Clone)]
pub struct TrackingOptions {
    /// Cap N on simultaneously co-located objects
    pub max_number_objects: usize,
    /// Maximal center-of-mass distance for candidate transitions
    pub max_neighbor_distance: f64,
    /// Candidate arcs per node in the forward builder pass
    pub max_nearest_neighbors: usize,
    /// Model cell divisions
    pub with_divisions: bool,
    /// Minimal division probability to fan out extra candidates
    pub division_threshold: f64,
    /// How detection energies are derived (explicitly chosen, never
    /// inferred from feature presence)
    pub detection_prior: DetectionPrior,
    /// Capture volume for border-aware appearance/disappearance
    pub field_of_view: FieldOfView,
    /// Width of the border band where appearance/disappearance is cheap
    pub border_width: f64,
    /// Detection energy weight
    pub detection_weight: f64,
    /// Division energy weight
    pub division_weight: f64,
    /// Transition energy weight
    pub transition_weight: f64,
    /// Transition decay parameter alpha
    pub transition_parameter: f64,
    /// Appearance cost in the volume interior
    pub appearance_cost: f64,
    /// Disappearance cost in the volume interior
    pub disappearance_cost: f64,
    /// Energy for ruled-out states; 0 selects a large default
    pub forbidden_cost: f64,
    /// Compress unambiguous chains before solving
    pub with_tracklets: bool,
    /// Emit hard conservation constraints
    pub with_constraints: bool,
    /// Allow tracks to start mid-sequence
    pub with_appearance: bool,
    /// Allow tracks to end mid-sequence
    pub with_disappearance: bool,
    /// Allow count 0 on detections
    pub with_misdetections_allowed: bool,
    /// Use drift-corrected centers of mass for distances
    pub with_optical_correction: bool,
    /// Split concluded mergers
    pub with_merger_resolution: bool,
    /// Inference backend
    pub solver: SolverType,
    /// Wall-clock bound per solve
    pub timeout: Option<Duration>,
    /// Perturbation setup; default is plain MAP
    pub uncertainty: UncertaintyParameter,
}

impl Default for TrackingOptions {
    fn default() -> Self {
        Self {
            max_number_objects: 3,
            max_neighbor_distance: 20.0,
            max_nearest_neighbors: 1,
            with_divisions: true,
            division_threshold: 0.3,
            detection_prior: DetectionPrior::Hard { p: 0.7 },
            field_of_view: FieldOfView::default(),
            border_width: 0.0,
            detection_weight: 10.0,
            division_weight: 10.0,
            transition_weight: 10.0,
            transition_parameter: 5.0,
            appearance_cost: 0.0,
            disappearance_cost: 0.0,
            forbidden_cost: 0.0,
            with_tracklets: false,
            with_constraints: true,
            with_appearance: true,
            with_disappearance: true,
            with_misdetections_allowed: true,
            with_optical_correction: false,
            with_merger_resolution: true,
            solver: SolverType::Exact,
            timeout: None,
            uncertainty: UncertaintyParameter::default(),
        }
    }
}

/// Everything a tracking run produces.
#[derive(Debug)]
pub struct TrackingOutput {
    /// Per-timestep events (resolution events merged in when enabled)
    pub events: EventVectorVector,
    /// All labelings in iteration order; index 0 is MAP
    pub solutions: Vec<Labeling>,
    /// Mergers split by the resolver
    pub resolved: Vec<ResolvedMerger>,
    /// Mergers left unresolved with their failures
    pub unresolved: Vec<(TraxelKey, TrackingError)>,
}

/// Conservation tracking entry point.
///
/// Constructed once from options; each [`track`](ConsTracking::track)
/// call runs the full pipeline on a traxel store.
pub struct ConsTracking {
    options: TrackingOptions,
    graph: Option<HypothesesGraph>,
    last_detections: Option<Vec<BTreeMap<u32, bool>>>,
}

impl ConsTracking {
    /// Validate the options and create a tracker
    pub fn new(options: TrackingOptions) -> Result<Self, TrackingError> {
        if options.max_number_objects < 1 {
            return Err(TrackingError::config(format!(
                "max_number_objects must be at least 1, got {}",
                options.max_number_objects
            )));
        }
        if options.max_neighbor_distance <= 0.0 {
            return Err(TrackingError::config(
                "max_neighbor_distance must be positive",
            ));
        }
        Ok(Self {
            options,
            graph: None,
            last_detections: None,
        })
    }

    /// Run the pipeline without merger-splitting coordinates
    pub fn track(
        &mut self,
        store: &mut TraxelStore,
        rng: &mut dyn RngCore,
    ) -> Result<TrackingOutput, TrackingError> {
        self.track_with_coordinates(store, None, rng)
    }

    /// Run the full pipeline.
    ///
    /// `coordinates` supplies per-detection coordinate samples for the
    /// merger resolver; without them mergers stay unresolved events.
    pub fn track_with_coordinates(
        &mut self,
        store: &mut TraxelStore,
        coordinates: Option<&TimestepIdCoordinateMap>,
        rng: &mut dyn RngCore,
    ) -> Result<TrackingOutput, TrackingError> {
        let opts = self.options.clone();

        info!("injecting detection probabilities");
        inject_detection_probabilities(store, &opts.detection_prior, opts.max_number_objects)?;

        info!("building hypotheses graph");
        let builder_options = BuilderOptions {
            max_nearest_neighbors: opts.max_nearest_neighbors,
            max_distance: opts.max_neighbor_distance,
            forward_backward: true,
            consider_divisions: opts.with_divisions,
            division_threshold: opts.division_threshold,
            with_optical_correction: opts.with_optical_correction,
        };
        let mut graph = SingleTimestepBuilder::new(store, builder_options).build()?;

        let costs = CostFunctions::standard(
            &opts.detection_prior,
            opts.max_number_objects,
            opts.detection_weight,
            opts.division_weight,
            opts.transition_weight,
            opts.transition_parameter,
            opts.appearance_cost,
            opts.disappearance_cost,
            opts.border_width,
            opts.field_of_view,
        );

        let tracklets = if opts.with_tracklets {
            info!("compressing tracklets");
            Some(generate_tracklet_graph(&graph)?)
        } else {
            None
        };

        let model_param = ModelParameter {
            max_number_objects: opts.max_number_objects,
            with_divisions: opts.with_divisions,
            with_constraints: opts.with_constraints,
            with_appearance: opts.with_appearance,
            with_disappearance: opts.with_disappearance,
            with_misdetections_allowed: opts.with_misdetections_allowed,
            forbidden_cost: opts.forbidden_cost,
        };

        info!("running inference");
        let engine = PerturbationEngine::new(
            opts.solver,
            SolverOptions {
                timeout: opts.timeout,
                ..Default::default()
            },
            opts.uncertainty.clone(),
        );
        let output = engine.run(
            &mut graph,
            tracklets.as_ref(),
            store,
            &costs,
            &model_param,
            rng,
        )?;

        self.last_detections = Some(state_of_nodes(&graph, store));

        let mut events = output.events;
        let mut resolved = Vec::new();
        let mut unresolved = Vec::new();

        if opts.with_merger_resolution && opts.max_number_objects > 1 {
            if let Some(coordinates) = coordinates {
                info!("resolving mergers");
                let strategy = GaussianMixture::default();
                let transition_fn =
                    NegLnTransition::new(opts.transition_weight, opts.transition_parameter);
                let transition = move |d: f64| transition_fn.cost(d);
                let resolver = MergerResolver::new(&strategy, &transition);
                let resolution = resolver.resolve(&mut graph, store, coordinates, 0, rng);
                events = merge_event_vectors(&events, &resolution.events);
                resolved = resolution.resolved;
                unresolved = resolution.unresolved;
            }
        }

        let (pruned_nodes, pruned_arcs) = graph.prune_inactive(0);
        info!(
            "pruned {} inactive nodes and {} arcs",
            pruned_nodes, pruned_arcs
        );
        self.graph = Some(graph);

        Ok(TrackingOutput {
            events,
            solutions: output.solutions,
            resolved,
            unresolved,
        })
    }

    /// Per-timestep detection states of the previous run
    pub fn detections(&self) -> Result<&[BTreeMap<u32, bool>], TrackingError> {
        self.last_detections
            .as_deref()
            .ok_or_else(|| TrackingError::config("detections() requires a previous tracking run"))
    }

    /// The hypotheses graph of the previous run, labels written and
    /// inactive elements pruned
    pub fn hypotheses_graph(&self) -> Option<&HypothesesGraph> {
        self.graph.as_ref()
    }
}

/// Detection activity per timestep after the MAP solve
fn state_of_nodes(graph: &HypothesesGraph, store: &TraxelStore) -> Vec<BTreeMap<u32, bool>> {
    let earliest = store.earliest_timestep().unwrap_or(0);
    let latest = store.latest_timestep().unwrap_or(0);
    let mut states = vec![BTreeMap::new(); (latest - earliest + 1) as usize];
    for node in graph.nodes() {
        let active = graph.active_count(node, 0) > 0;
        for key in graph.node_traxels(node) {
            states[(key.timestep - earliest) as usize].insert(key.id, active);
        }
    }
    states
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_invalid_options() {
        let options = TrackingOptions {
            max_number_objects: 0,
            ..Default::default()
        };
        assert!(ConsTracking::new(options).is_err());

        let options = TrackingOptions {
            max_neighbor_distance: -1.0,
            ..Default::default()
        };
        assert!(ConsTracking::new(options).is_err());
    }

    #[test]
    fn test_detections_require_a_run() {
        let tracker = ConsTracking::new(TrackingOptions::default()).unwrap();
        assert!(tracker.detections().is_err());
    }
}
