//! Concrete cost functions
//!
//! All costs are energies (negative log-probabilities) scaled by a weight.
//! Probabilities are clamped away from 0 before taking the logarithm so a
//! hard zero never produces an infinite table entry.

use crate::errors::TrackingError;
use crate::field_of_view::FieldOfView;
use crate::traxels::{Traxel, TraxelStore};

/// Smallest probability fed into a logarithm
const MIN_PROB: f64 = 1e-10;

fn neg_ln(p: f64) -> f64 {
    -p.max(MIN_PROB).ln()
}

/// Detection energy from a classifier's per-count probabilities.
///
/// Reads the "detProb" feature: `detProb[k]` is the probability that the
/// detection contains exactly k objects. Counts beyond the feature length
/// reuse the last entry.
#[derive(Debug, Clone, Copy)]
pub struct NegLnDetection {
    weight: f64,
}

impl NegLnDetection {
    /// Create with the given energy weight
    pub fn new(weight: f64) -> Self {
        Self { weight }
    }

    /// Energy of the traxel containing exactly `count` objects
    pub fn cost(&self, traxel: &Traxel, count: usize) -> Result<f64, TrackingError> {
        let probs = traxel.require_feature("detProb")?;
        let p = if count < probs.len() {
            probs[count]
        } else {
            *probs.last().unwrap_or(&MIN_PROB)
        };
        Ok(self.weight * neg_ln(p))
    }
}

/// Detection energy from a fixed prior over counts, independent of the
/// traxel's features.
#[derive(Debug, Clone)]
pub struct NegLnConstant {
    weight: f64,
    prob_vector: Vec<f64>,
}

impl NegLnConstant {
    /// Create from an explicit probability vector over counts 0..=N
    pub fn new(weight: f64, prob_vector: Vec<f64>) -> Self {
        Self {
            weight,
            prob_vector,
        }
    }

    /// Energy of a detection containing exactly `count` objects
    pub fn cost(&self, count: usize) -> f64 {
        let p = self
            .prob_vector
            .get(count)
            .copied()
            .unwrap_or(MIN_PROB);
        self.weight * neg_ln(p)
    }
}

/// Quasi-geometric prior over object counts 0..=N.
///
/// P(k) = p(1-p)^(k-1) for k in 1..=N, P(0) = 1 - sum of the others.
/// For N=3, p=0.7 this yields (0.027, 0.7, 0.21, 0.063).
pub fn quasi_geometric_prior(max_number_objects: usize, p: f64) -> Vec<f64> {
    let mut probs = Vec::with_capacity(max_number_objects + 1);
    let mut sum = 0.0;
    for state in 0..max_number_objects {
        let prob = p * (1.0 - p).powi(state as i32);
        probs.push(prob);
        sum += prob;
    }
    probs.insert(0, 1.0 - sum);
    probs
}

/// Division energy from the "divProb" classifier feature
#[derive(Debug, Clone, Copy)]
pub struct NegLnDivision {
    weight: f64,
}

impl NegLnDivision {
    /// Create with the given energy weight
    pub fn new(weight: f64) -> Self {
        Self { weight }
    }

    /// Energy of the traxel dividing into two daughters
    pub fn cost(&self, traxel: &Traxel) -> Result<f64, TrackingError> {
        let probs = traxel.require_feature("divProb")?;
        Ok(self.weight * neg_ln(probs.first().copied().unwrap_or(0.0)))
    }
}

/// Transition energy from geometric distance.
///
/// The transition probability decays as exp(-d/alpha), so the energy is
/// linear in the distance: weight * d / alpha.
#[derive(Debug, Clone, Copy)]
pub struct NegLnTransition {
    weight: f64,
    alpha: f64,
}

impl NegLnTransition {
    /// Create with the given weight and decay parameter alpha
    pub fn new(weight: f64, alpha: f64) -> Self {
        Self { weight, alpha }
    }

    /// Energy of realizing a transition over the given distance
    pub fn cost(&self, distance: f64) -> f64 {
        self.weight * distance / self.alpha
    }
}

/// Appearance/disappearance cost that vanishes near the field-of-view
/// border.
///
/// Inside the volume the full cost applies; within `margin` of the spatial
/// border the cost ramps linearly down to zero, so objects entering or
/// leaving the capture volume are not penalized.
#[derive(Debug, Clone)]
pub struct SpatialBorderAwareWeight {
    cost: f64,
    margin: f64,
    /// Margin interpreted as a fraction of the half-extent instead of
    /// absolute units
    relative: bool,
    fov: FieldOfView,
}

impl SpatialBorderAwareWeight {
    /// Create a border-aware cost function
    pub fn new(cost: f64, margin: f64, relative: bool, fov: FieldOfView) -> Self {
        Self {
            cost,
            margin,
            relative,
            fov,
        }
    }

    /// Cost for the given traxel, scaled by its distance to the border
    pub fn cost_for(&self, traxel: &Traxel) -> Result<f64, TrackingError> {
        if self.margin <= 0.0 {
            return Ok(self.cost);
        }
        let com = traxel.com()?;
        let x = com.get(0).copied().unwrap_or(0.0);
        let y = com.get(1).copied().unwrap_or(0.0);
        let z = com.get(2).copied().unwrap_or(0.0);

        let mut margin = self.margin;
        if self.relative {
            let extent = (0..3)
                .map(|i| self.fov.upper[i + 1] - self.fov.lower[i + 1])
                .filter(|e| e.is_finite() && *e > 0.0)
                .fold(f64::INFINITY, f64::min);
            if extent.is_finite() {
                margin *= extent / 2.0;
            }
        }

        let distance = self.fov.spatial_margin(x, y, z);
        Ok(self.cost * (distance / margin).min(1.0))
    }
}

/// Detection probabilities for a size-dependent prior.
///
/// Places a Gaussian bump at k * avg object size for each count k,
/// normalizes over counts, and clamps each probability to [0.01, 0.99].
pub fn compute_detection_probabilities(volume: f64, means: &[f64], sigma2: &[f64]) -> Vec<f64> {
    let mut probs: Vec<f64> = means
        .iter()
        .zip(sigma2.iter())
        .map(|(m, s2)| {
            let d = volume - m;
            (-(d * d) / s2).exp()
        })
        .collect();
    let sum: f64 = probs.iter().sum();
    if sum > 0.0 {
        for p in probs.iter_mut() {
            *p /= sum;
        }
    }
    for p in probs.iter_mut() {
        *p = p.clamp(0.01, 0.99);
    }
    probs
}

/// How per-node detection energies are derived.
///
/// The caller selects the prior explicitly; the builder never infers it
/// from which features happen to be present.
#[derive(Debug, Clone)]
pub enum DetectionPrior {
    /// Use the classifier's "detProb" feature as-is
    Classifier,
    /// Derive probabilities from the "count" (size) feature using Gaussian
    /// bumps around multiples of the average object size
    SizeDependent {
        /// Average size of a single object
        avg_obj_size: f64,
        /// Optional explicit per-count means, overriding k * avg_obj_size
        means: Vec<f64>,
        /// Optional explicit per-count variances
        sigmas: Vec<f64>,
    },
    /// Quasi-geometric prior over counts, ignoring traxel features
    Hard {
        /// Success probability of the geometric distribution
        p: f64,
    },
}

/// Inject "detProb" features into the store according to the chosen prior.
///
/// For [`DetectionPrior::Classifier`] this only validates that the feature
/// is present. For [`DetectionPrior::Hard`] nothing is written; the caller
/// uses [`NegLnConstant`] instead. For [`DetectionPrior::SizeDependent`]
/// the probabilities are computed from the "count" feature and written
/// in place.
pub fn inject_detection_probabilities(
    store: &mut TraxelStore,
    prior: &DetectionPrior,
    max_number_objects: usize,
) -> Result<(), TrackingError> {
    match prior {
        DetectionPrior::Classifier => {
            for traxel in store.iter() {
                traxel.require_feature("detProb")?;
            }
            Ok(())
        }
        DetectionPrior::Hard { .. } => Ok(()),
        DetectionPrior::SizeDependent {
            avg_obj_size,
            means,
            sigmas,
        } => {
            let means: Vec<f64> = if means.is_empty() {
                (0..=max_number_objects)
                    .map(|k| k as f64 * avg_obj_size)
                    .collect()
            } else {
                means.clone()
            };
            let sigma2: Vec<f64> = if sigmas.is_empty() {
                let s2 = ((avg_obj_size * avg_obj_size) / 4.0).max(1e-4);
                vec![s2; max_number_objects + 1]
            } else {
                sigmas.clone()
            };

            let keys: Vec<_> = store.iter().map(|t| t.key()).collect();
            for key in keys {
                let volume = {
                    let traxel = store.get(key).expect("key taken from the store");
                    traxel.require_feature("count")?[0]
                };
                let probs = compute_detection_probabilities(volume, &means, &sigma2);
                store.replace_feature(key, "detProb", probs)?;
            }
            Ok(())
        }
    }
}

// ============================================================================
// Cost-function bundle consumed by the model builder
// ============================================================================

/// Scalar cost of a traxel containing `count` objects
pub type DetectionCostFn = Box<dyn Fn(&Traxel, usize) -> f64 + Send + Sync>;
/// Scalar cost of a traxel dividing
pub type DivisionCostFn = Box<dyn Fn(&Traxel) -> f64 + Send + Sync>;
/// Scalar cost of realizing a transition over a distance
pub type TransitionCostFn = Box<dyn Fn(f64) -> f64 + Send + Sync>;
/// Scalar cost of a track starting or ending at a traxel
pub type BoundaryCostFn = Box<dyn Fn(&Traxel) -> f64 + Send + Sync>;

/// The opaque callables the model builder consumes.
///
/// Supplied by the feature/classifier collaborator; the core treats them
/// as black boxes with the documented signatures.
pub struct CostFunctions {
    /// detection(traxel, count) -> energy
    pub detection: DetectionCostFn,
    /// division(traxel) -> energy
    pub division: DivisionCostFn,
    /// transition(distance) -> energy
    pub transition: TransitionCostFn,
    /// appearance(traxel) -> energy
    pub appearance: BoundaryCostFn,
    /// disappearance(traxel) -> energy
    pub disappearance: BoundaryCostFn,
}

impl CostFunctions {
    /// Assemble the standard cost bundle for the chosen detection prior.
    #[allow(clippy::too_many_arguments)]
    pub fn standard(
        prior: &DetectionPrior,
        max_number_objects: usize,
        detection_weight: f64,
        division_weight: f64,
        transition_weight: f64,
        transition_parameter: f64,
        appearance_cost: f64,
        disappearance_cost: f64,
        border_width: f64,
        fov: FieldOfView,
    ) -> Self {
        let detection: DetectionCostFn = match prior {
            DetectionPrior::Hard { p } => {
                let prior_fn = NegLnConstant::new(
                    detection_weight,
                    quasi_geometric_prior(max_number_objects, *p),
                );
                Box::new(move |_traxel, count| prior_fn.cost(count))
            }
            // Classifier and size-dependent priors both read "detProb";
            // the size-dependent variant has injected it beforehand.
            _ => {
                let det = NegLnDetection::new(detection_weight);
                Box::new(move |traxel: &Traxel, count| {
                    det.cost(traxel, count).unwrap_or(f64::INFINITY)
                })
            }
        };

        let div = NegLnDivision::new(division_weight);
        let division: DivisionCostFn =
            Box::new(move |traxel: &Traxel| div.cost(traxel).unwrap_or(f64::INFINITY));

        let trans = NegLnTransition::new(transition_weight, transition_parameter);
        let transition: TransitionCostFn = Box::new(move |distance| trans.cost(distance));

        let app_weight = SpatialBorderAwareWeight::new(appearance_cost, border_width, false, fov);
        let appearance: BoundaryCostFn =
            Box::new(move |traxel: &Traxel| app_weight.cost_for(traxel).unwrap_or(f64::INFINITY));

        let dis_weight =
            SpatialBorderAwareWeight::new(disappearance_cost, border_width, false, fov);
        let disappearance: BoundaryCostFn =
            Box::new(move |traxel: &Traxel| dis_weight.cost_for(traxel).unwrap_or(f64::INFINITY));

        Self {
            detection,
            division,
            transition,
            appearance,
            disappearance,
        }
    }
}
