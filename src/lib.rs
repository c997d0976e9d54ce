/*!
# Constrack - Conservation tracking library

Rust implementation of conservation tracking: multi-object tracking of
moving, dividing and merging objects (biological cells) formulated as a
constrained energy minimization over a temporal hypotheses graph.

## Features

- Temporal hypotheses graph with optional tracklet compression
- Solver-agnostic problem instances with hard conservation constraints
- Multiple inference backends (exact branch-and-bound, dynamic
  programming, min-cost flow)
- Perturbation framework for uncertainty estimation (Gaussian,
  perturb-and-MAP, diverse m-best, classifier uncertainty)
- Merger resolution by coordinate clustering and local re-linking

## Modules

- [`tracking`] - the pipeline facade, start here
- [`hypotheses`] - the temporal candidate graph
- [`model`] - problem construction (factors + constraints)
- [`inference`] - backends and the solution writer
- [`uncertainty`] - perturbed re-solves and empirical marginals
- [`mergers`] - splitting falsely merged detections
- [`energy`] - cost functions
- [`traxels`] - detections and their store

## Example

```rust,no_run
use constrack::{ConsTracking, TrackingOptions, Traxel, TraxelStore};

let mut store = TraxelStore::new();
store.add(
    Traxel::new(1, 0)
        .with_feature("com", vec![10.0, 12.0, 0.0])
        .with_feature("detProb", vec![0.1, 0.9])
        .with_feature("divProb", vec![0.05]),
);
// ... add the remaining detections ...

let options = TrackingOptions {
    max_number_objects: 2,
    detection_prior: constrack::DetectionPrior::Classifier,
    ..Default::default()
};
let mut tracker = ConsTracking::new(options).unwrap();
let mut rng = rand::thread_rng();
let output = tracker.track(&mut store, &mut rng).unwrap();
for (t, events) in output.events.iter().enumerate() {
    println!("t={}: {} events", t, events.len());
}
```
*/

// ============================================================================
// Core modules
// ============================================================================

/// Error taxonomy
pub mod errors;

/// Detections (traxels), the traxel store, feature calculators
pub mod traxels;

/// Capture-volume geometry for border-aware costs
pub mod field_of_view;

/// Cost functions over traxel features
pub mod energy;

/// Temporal hypotheses graph, builder and tracklet compression
pub mod hypotheses;

/// Problem construction: decision variables and hard constraints
pub mod model;

/// Inference backends and the solution writer
pub mod inference;

/// Structured tracking events
pub mod events;

/// Perturbation framework and uncertainty aggregation
pub mod uncertainty;

/// Merger splitting and re-linking
pub mod mergers;

/// The tracking pipeline facade
pub mod tracking;

// ============================================================================
// Re-exports for convenience
// ============================================================================

// Core types
pub use traxels::{CalculatorRegistry, FeatureCalculator, Traxel, TraxelKey, TraxelStore};

pub use field_of_view::FieldOfView;

// Errors
pub use errors::TrackingError;

// Energies
pub use energy::{CostFunctions, DetectionPrior, EnergyType};

// Graph
pub use hypotheses::{ArcId, HypothesesGraph, NodeId, SingleTimestepBuilder, TrackletGraph};

// Model
pub use model::{Labeling, ModelBuilder, ModelParameter, ProblemInstance};

// Inference
pub use inference::{
    create_backend, DynProgBackend, ExactBackend, FlowBackend, InferenceBackend, SolutionWriter,
    SolverOptions, SolverType,
};

// Events
pub use events::{Event, EventKind, EventVector, EventVectorVector};

// Uncertainty
pub use uncertainty::{
    PerturbationDistribution, PerturbationEngine, UncertaintyOutput, UncertaintyParameter,
};

// Mergers
pub use mergers::{
    ClusterStrategy, GaussianMixture, KMeans, MergerResolver, TimestepIdCoordinateMap,
};

// Pipeline
pub use tracking::{ConsTracking, TrackingOptions, TrackingOutput};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
