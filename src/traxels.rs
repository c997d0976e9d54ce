//! Traxels and the traxel store
//!
//! A traxel is one object detection at one timestep. The store owns all
//! traxels of a sequence and is the only collaborator allowed to mutate
//! their features (in-place replacement, used to inject computed detection
//! probabilities before graph construction).

use std::collections::BTreeMap;

use nalgebra::DVector;
use serde::Serialize;

use crate::errors::TrackingError;

/// A named, vector-valued feature (e.g. "com", "detProb", "divProb")
pub type FeatureArray = Vec<f64>;

/// Named-feature map of a traxel.
///
/// BTreeMap so iteration order is deterministic across runs.
pub type FeatureMap = BTreeMap<String, FeatureArray>;

/// Key identifying a traxel within a store
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct TraxelKey {
    /// Timestep of the detection
    pub timestep: u32,
    /// Id of the detection, unique within its timestep
    pub id: u32,
}

impl TraxelKey {
    /// Create a new key
    pub fn new(timestep: u32, id: u32) -> Self {
        Self { timestep, id }
    }
}

/// One object detection at one timestep.
///
/// Immutable once built; owned by a [`TraxelStore`].
#[derive(Debug, Clone)]
pub struct Traxel {
    /// Id, unique within the timestep
    pub id: u32,
    /// Timestep of the detection
    pub timestep: u32,
    /// Named feature map (position, size, per-class probabilities, ...)
    pub features: FeatureMap,
}

impl Traxel {
    /// Create a traxel with an empty feature map
    pub fn new(id: u32, timestep: u32) -> Self {
        Self {
            id,
            timestep,
            features: FeatureMap::new(),
        }
    }

    /// Key of this traxel
    #[inline]
    pub fn key(&self) -> TraxelKey {
        TraxelKey::new(self.timestep, self.id)
    }

    /// Set a feature, consuming and returning self for chained construction
    pub fn with_feature(mut self, name: &str, values: Vec<f64>) -> Self {
        self.features.insert(name.to_string(), values);
        self
    }

    /// Look up a feature by name
    pub fn feature(&self, name: &str) -> Option<&FeatureArray> {
        self.features.get(name)
    }

    /// Look up a feature, converting absence into a [`TrackingError`]
    pub fn require_feature(&self, name: &str) -> Result<&FeatureArray, TrackingError> {
        self.features
            .get(name)
            .ok_or_else(|| TrackingError::MissingFeature {
                traxel_id: self.id,
                timestep: self.timestep,
                feature: name.to_string(),
            })
    }

    /// Center of mass, from the "com" feature
    pub fn com(&self) -> Result<DVector<f64>, TrackingError> {
        Ok(DVector::from_column_slice(self.require_feature("com")?))
    }

    /// Center of mass corrected for stage drift ("com_corrected"),
    /// falling back to the plain center of mass
    pub fn com_corrected(&self) -> Result<DVector<f64>, TrackingError> {
        match self.feature("com_corrected") {
            Some(c) => Ok(DVector::from_column_slice(c)),
            None => self.com(),
        }
    }

    /// Euclidean distance between the centers of mass of two traxels
    pub fn distance_to(&self, other: &Traxel) -> Result<f64, TrackingError> {
        Ok((self.com()? - other.com()?).norm())
    }

    /// Euclidean distance between drift-corrected centers of mass
    pub fn distance_to_corrected(&self, other: &Traxel) -> Result<f64, TrackingError> {
        Ok((self.com_corrected()? - other.com_corrected()?).norm())
    }
}

/// Owns all traxels of a sequence, keyed by (timestep, id).
#[derive(Debug, Clone, Default)]
pub struct TraxelStore {
    traxels: BTreeMap<TraxelKey, Traxel>,
}

impl TraxelStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a traxel. Replaces any previous traxel with the same key.
    pub fn add(&mut self, traxel: Traxel) {
        self.traxels.insert(traxel.key(), traxel);
    }

    /// Look up a traxel by key
    pub fn get(&self, key: TraxelKey) -> Option<&Traxel> {
        self.traxels.get(&key)
    }

    /// Replace one feature of a stored traxel in place.
    ///
    /// This is the only mutation the core performs on traxels; it is used
    /// to inject computed detection-probability features before the
    /// hypotheses graph is built.
    pub fn replace_feature(
        &mut self,
        key: TraxelKey,
        name: &str,
        values: Vec<f64>,
    ) -> Result<(), TrackingError> {
        let traxel = self.traxels.get_mut(&key).ok_or_else(|| {
            TrackingError::config(format!(
                "cannot replace feature on unknown traxel {} at t={}",
                key.id, key.timestep
            ))
        })?;
        traxel.features.insert(name.to_string(), values);
        Ok(())
    }

    /// Iterate all traxels in (timestep, id) order
    pub fn iter(&self) -> impl Iterator<Item = &Traxel> {
        self.traxels.values()
    }

    /// Iterate the traxels of one timestep
    pub fn at_timestep(&self, timestep: u32) -> impl Iterator<Item = &Traxel> {
        self.traxels
            .range(TraxelKey::new(timestep, 0)..=TraxelKey::new(timestep, u32::MAX))
            .map(|(_, t)| t)
    }

    /// Earliest timestep present in the store
    pub fn earliest_timestep(&self) -> Option<u32> {
        self.traxels.keys().next().map(|k| k.timestep)
    }

    /// Latest timestep present in the store
    pub fn latest_timestep(&self) -> Option<u32> {
        self.traxels.keys().next_back().map(|k| k.timestep)
    }

    /// Largest traxel id over all timesteps, used when minting sub-object ids
    pub fn max_id(&self) -> u32 {
        self.traxels.keys().map(|k| k.id).max().unwrap_or(0)
    }

    /// Number of traxels
    pub fn len(&self) -> usize {
        self.traxels.len()
    }

    /// Whether the store holds no traxels
    pub fn is_empty(&self) -> bool {
        self.traxels.is_empty()
    }
}

// ============================================================================
// Feature calculators
// ============================================================================

/// A pure, named function over feature arrays.
///
/// Calculators combine traxel features into derived features, e.g. the
/// squared difference of two position vectors. They carry no state.
pub trait FeatureCalculator: Send + Sync {
    /// Apply the calculator to its inputs
    fn calculate(&self, inputs: &[&FeatureArray]) -> Result<FeatureArray, TrackingError>;

    /// Calculator name, used as registry key
    fn name(&self) -> &'static str;
}

fn check_arity(name: &str, inputs: &[&FeatureArray], expected: usize) -> Result<(), TrackingError> {
    if inputs.len() != expected {
        return Err(TrackingError::config(format!(
            "calculator \"{}\" expects {} inputs, got {}",
            name,
            expected,
            inputs.len()
        )));
    }
    if expected == 2 && inputs[0].len() != inputs[1].len() {
        return Err(TrackingError::config(format!(
            "calculator \"{}\" expects inputs of equal length ({} vs {})",
            name,
            inputs[0].len(),
            inputs[1].len()
        )));
    }
    Ok(())
}

/// Concatenates its inputs unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityCalculator;

impl FeatureCalculator for IdentityCalculator {
    fn calculate(&self, inputs: &[&FeatureArray]) -> Result<FeatureArray, TrackingError> {
        let mut out = Vec::new();
        for input in inputs {
            out.extend_from_slice(input);
        }
        Ok(out)
    }

    fn name(&self) -> &'static str {
        "identity"
    }
}

/// Element-wise squared difference of two equally sized inputs
#[derive(Debug, Clone, Copy, Default)]
pub struct SquaredDifferenceCalculator;

impl FeatureCalculator for SquaredDifferenceCalculator {
    fn calculate(&self, inputs: &[&FeatureArray]) -> Result<FeatureArray, TrackingError> {
        check_arity(self.name(), inputs, 2)?;
        Ok(inputs[0]
            .iter()
            .zip(inputs[1].iter())
            .map(|(a, b)| (a - b) * (a - b))
            .collect())
    }

    fn name(&self) -> &'static str {
        "squared difference"
    }
}

/// Element-wise absolute difference of two equally sized inputs
#[derive(Debug, Clone, Copy, Default)]
pub struct AbsoluteDifferenceCalculator;

impl FeatureCalculator for AbsoluteDifferenceCalculator {
    fn calculate(&self, inputs: &[&FeatureArray]) -> Result<FeatureArray, TrackingError> {
        check_arity(self.name(), inputs, 2)?;
        Ok(inputs[0]
            .iter()
            .zip(inputs[1].iter())
            .map(|(a, b)| (a - b).abs())
            .collect())
    }

    fn name(&self) -> &'static str {
        "absolute difference"
    }
}

/// Element-wise ratio min/max of two equally sized inputs, in [0, 1]
#[derive(Debug, Clone, Copy, Default)]
pub struct AsymmetricRatioCalculator;

impl FeatureCalculator for AsymmetricRatioCalculator {
    fn calculate(&self, inputs: &[&FeatureArray]) -> Result<FeatureArray, TrackingError> {
        check_arity(self.name(), inputs, 2)?;
        Ok(inputs[0]
            .iter()
            .zip(inputs[1].iter())
            .map(|(a, b)| {
                let (lo, hi) = if a.abs() < b.abs() { (a, b) } else { (b, a) };
                if hi.abs() < f64::EPSILON {
                    0.0
                } else {
                    (lo / hi).abs()
                }
            })
            .collect())
    }

    fn name(&self) -> &'static str {
        "asymmetric ratio"
    }
}

/// Explicit, constructed-once registry of feature calculators.
///
/// Passed by reference into builders that need derived features. Never a
/// process-wide singleton.
pub struct CalculatorRegistry {
    calculators: BTreeMap<&'static str, Box<dyn FeatureCalculator>>,
}

impl CalculatorRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            calculators: BTreeMap::new(),
        }
    }

    /// Create a registry holding the default calculators
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(IdentityCalculator));
        registry.register(Box::new(SquaredDifferenceCalculator));
        registry.register(Box::new(AbsoluteDifferenceCalculator));
        registry.register(Box::new(AsymmetricRatioCalculator));
        registry
    }

    /// Register a calculator under its own name
    pub fn register(&mut self, calculator: Box<dyn FeatureCalculator>) {
        self.calculators.insert(calculator.name(), calculator);
    }

    /// Look up a calculator by name
    pub fn get(&self, name: &str) -> Result<&dyn FeatureCalculator, TrackingError> {
        self.calculators
            .get(name)
            .map(|c| c.as_ref())
            .ok_or_else(|| TrackingError::config(format!("unknown feature calculator \"{}\"", name)))
    }

    /// Names of all registered calculators
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.calculators.keys().copied()
    }
}

impl Default for CalculatorRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn traxel_at(id: u32, t: u32, x: f64, y: f64) -> Traxel {
        Traxel::new(id, t).with_feature("com", vec![x, y, 0.0])
    }

    #[test]
    fn test_store_lookup_and_bounds() {
        let mut store = TraxelStore::new();
        store.add(traxel_at(1, 0, 0.0, 0.0));
        store.add(traxel_at(2, 0, 1.0, 0.0));
        store.add(traxel_at(1, 3, 2.0, 0.0));

        assert_eq!(store.len(), 3);
        assert_eq!(store.earliest_timestep(), Some(0));
        assert_eq!(store.latest_timestep(), Some(3));
        assert_eq!(store.at_timestep(0).count(), 2);
        assert!(store.get(TraxelKey::new(3, 1)).is_some());
        assert!(store.get(TraxelKey::new(1, 1)).is_none());
    }

    #[test]
    fn test_feature_replacement() {
        let mut store = TraxelStore::new();
        store.add(traxel_at(1, 0, 0.0, 0.0));
        store
            .replace_feature(TraxelKey::new(0, 1), "detProb", vec![0.2, 0.8])
            .unwrap();
        let trax = store.get(TraxelKey::new(0, 1)).unwrap();
        assert_eq!(trax.feature("detProb").unwrap(), &vec![0.2, 0.8]);

        assert!(store
            .replace_feature(TraxelKey::new(9, 9), "detProb", vec![])
            .is_err());
    }

    #[test]
    fn test_distance() {
        let a = traxel_at(1, 0, 0.0, 0.0);
        let b = traxel_at(2, 1, 3.0, 4.0);
        assert!((a.distance_to(&b).unwrap() - 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_calculators() {
        let registry = CalculatorRegistry::with_defaults();
        let f1 = vec![1.0, 2.0];
        let f2 = vec![4.0, 0.0];

        let sq = registry.get("squared difference").unwrap();
        assert_eq!(sq.calculate(&[&f1, &f2]).unwrap(), vec![9.0, 4.0]);

        let abs = registry.get("absolute difference").unwrap();
        assert_eq!(abs.calculate(&[&f1, &f2]).unwrap(), vec![3.0, 2.0]);

        let ratio = registry.get("asymmetric ratio").unwrap();
        let r = ratio.calculate(&[&f1, &f2]).unwrap();
        assert!((r[0] - 0.25).abs() < 1e-12);
        assert_eq!(r[1], 0.0);

        assert!(registry.get("no such calculator").is_err());
        assert!(sq.calculate(&[&f1]).is_err());
    }
}
