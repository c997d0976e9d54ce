//! Energy (cost) functions for the tracking model
//!
//! Pure functions mapping object/transition features to scalar costs. The
//! model builder consumes them as opaque callables; concrete
//! implementations live in [`functions`].

pub mod functions;

pub use functions::{
    compute_detection_probabilities, inject_detection_probabilities, quasi_geometric_prior,
    CostFunctions, DetectionPrior, NegLnConstant, NegLnDetection, NegLnDivision, NegLnTransition,
    SpatialBorderAwareWeight,
};

use serde::Serialize;

/// The energy terms a tracking model is composed of.
///
/// Perturbation strategies draw noise per energy type; the index order is
/// the layout of the per-type parameter vector in
/// [`crate::uncertainty::UncertaintyParameter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EnergyType {
    /// Track starts (object enters the scene)
    Appearance = 0,
    /// Track ends (object leaves the scene)
    Disappearance = 1,
    /// Detection-by-count energy of a node
    Detection = 2,
    /// Transition energy of an arc
    Transition = 3,
    /// Division energy of a node
    Division = 4,
}

impl EnergyType {
    /// Number of energy types
    pub const COUNT: usize = 5;
}
