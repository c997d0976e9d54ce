//! Coordinate clustering for merger splitting
//!
//! Pluggable strategies that split a merger's coordinate samples into k
//! components. K-means is the fast default; the Gaussian-mixture strategy
//! refines the k-means seed with a few EM rounds using spherical
//! covariances.

use nalgebra::DVector;
use rand::RngCore;

use crate::errors::TrackingError;

/// Centers considered coincident below this distance
const DEGENERATE_SEPARATION: f64 = 1e-6;

/// Result of clustering a merger's coordinate samples
#[derive(Debug, Clone)]
pub struct Clustering {
    /// Component centers (the sub-objects' centers of mass)
    pub centers: Vec<DVector<f64>>,
    /// Component index per input point
    pub assignments: Vec<usize>,
}

/// A clustering strategy over coordinate samples
pub trait ClusterStrategy: Send + Sync {
    /// Split `points` into `k` distinguishable components.
    ///
    /// Degenerate inputs (fewer points than components, coincident
    /// component centers) are errors; the resolver downgrades them to a
    /// per-node resolution failure.
    fn cluster(
        &self,
        points: &[DVector<f64>],
        k: usize,
        rng: &mut dyn RngCore,
    ) -> Result<Clustering, TrackingError>;

    /// Strategy name for logs
    fn name(&self) -> &'static str;
}

fn validate(points: &[DVector<f64>], k: usize) -> Result<(), TrackingError> {
    if k < 2 {
        return Err(TrackingError::config(format!(
            "clustering into {} components is not a split",
            k
        )));
    }
    if points.len() < k {
        return Err(TrackingError::config(format!(
            "cannot split {} coordinate samples into {} components",
            points.len(),
            k
        )));
    }
    Ok(())
}

fn check_separation(clustering: &Clustering) -> Result<(), TrackingError> {
    let k = clustering.centers.len();
    for i in 0..k {
        if !clustering.assignments.iter().any(|&a| a == i) {
            return Err(TrackingError::config(format!(
                "cluster {} is empty; coordinates do not separate",
                i
            )));
        }
        for j in (i + 1)..k {
            let d = (&clustering.centers[i] - &clustering.centers[j]).norm();
            if d < DEGENERATE_SEPARATION {
                return Err(TrackingError::config(
                    "cluster centers coincide; coordinates do not separate",
                ));
            }
        }
    }
    Ok(())
}

/// Lloyd's k-means with farthest-point seeding
#[derive(Debug, Clone)]
pub struct KMeans {
    /// Maximal Lloyd iterations
    pub max_iterations: usize,
}

impl Default for KMeans {
    fn default() -> Self {
        Self { max_iterations: 50 }
    }
}

impl KMeans {
    /// Deterministic farthest-point seeding from a random first pick
    fn seed(
        &self,
        points: &[DVector<f64>],
        k: usize,
        rng: &mut dyn RngCore,
    ) -> Vec<DVector<f64>> {
        let first = (rng.next_u64() % points.len() as u64) as usize;
        let mut centers = vec![points[first].clone()];
        while centers.len() < k {
            let farthest = points
                .iter()
                .enumerate()
                .max_by(|(_, a), (_, b)| {
                    let da = centers.iter().map(|c| (*a - c).norm()).fold(f64::INFINITY, f64::min);
                    let db = centers.iter().map(|c| (*b - c).norm()).fold(f64::INFINITY, f64::min);
                    da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|(i, _)| i)
                .expect("non-empty points");
            centers.push(points[farthest].clone());
        }
        centers
    }

    fn assign(points: &[DVector<f64>], centers: &[DVector<f64>]) -> Vec<usize> {
        points
            .iter()
            .map(|p| {
                centers
                    .iter()
                    .enumerate()
                    .min_by(|(_, a), (_, b)| {
                        let da = (p - *a).norm();
                        let db = (p - *b).norm();
                        da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .map(|(i, _)| i)
                    .expect("non-empty centers")
            })
            .collect()
    }

    fn run(
        &self,
        points: &[DVector<f64>],
        k: usize,
        rng: &mut dyn RngCore,
    ) -> Result<Clustering, TrackingError> {
        validate(points, k)?;
        let dim = points[0].len();
        let mut centers = self.seed(points, k, rng);
        let mut assignments = Self::assign(points, &centers);

        for _ in 0..self.max_iterations {
            // recompute means
            let mut sums = vec![DVector::<f64>::zeros(dim); k];
            let mut counts = vec![0usize; k];
            for (p, &a) in points.iter().zip(assignments.iter()) {
                sums[a] += p;
                counts[a] += 1;
            }
            for (c, (sum, count)) in centers.iter_mut().zip(sums.iter().zip(counts.iter())) {
                if *count > 0 {
                    *c = sum / *count as f64;
                }
            }

            let next = Self::assign(points, &centers);
            if next == assignments {
                break;
            }
            assignments = next;
        }

        let clustering = Clustering {
            centers,
            assignments,
        };
        check_separation(&clustering)?;
        Ok(clustering)
    }
}

impl ClusterStrategy for KMeans {
    fn cluster(
        &self,
        points: &[DVector<f64>],
        k: usize,
        rng: &mut dyn RngCore,
    ) -> Result<Clustering, TrackingError> {
        self.run(points, k, rng)
    }

    fn name(&self) -> &'static str {
        "k-means"
    }
}

/// Gaussian mixture with spherical covariances, EM-refined from a k-means
/// seed.
#[derive(Debug, Clone)]
pub struct GaussianMixture {
    /// EM rounds after seeding
    pub em_iterations: usize,
    /// Floor on the per-component variance
    pub min_variance: f64,
}

impl Default for GaussianMixture {
    fn default() -> Self {
        Self {
            em_iterations: 20,
            min_variance: 1e-4,
        }
    }
}

impl ClusterStrategy for GaussianMixture {
    fn cluster(
        &self,
        points: &[DVector<f64>],
        k: usize,
        rng: &mut dyn RngCore,
    ) -> Result<Clustering, TrackingError> {
        let seed = KMeans::default().run(points, k, rng)?;
        let dim = points[0].len() as f64;
        let n = points.len();

        let mut means = seed.centers;
        let mut weights = vec![1.0 / k as f64; k];
        let mut variances: Vec<f64> = vec![1.0; k];

        // responsibilities, row per point
        let mut resp = vec![vec![0.0; k]; n];

        for _ in 0..self.em_iterations {
            // E step
            for (p, r) in points.iter().zip(resp.iter_mut()) {
                let mut total = 0.0;
                for c in 0..k {
                    let d2 = (p - &means[c]).norm_squared();
                    let var = variances[c].max(self.min_variance);
                    let density =
                        weights[c] * (-d2 / (2.0 * var)).exp() / var.powf(dim / 2.0);
                    r[c] = density;
                    total += density;
                }
                if total > 0.0 {
                    for v in r.iter_mut() {
                        *v /= total;
                    }
                } else {
                    for v in r.iter_mut() {
                        *v = 1.0 / k as f64;
                    }
                }
            }

            // M step
            for c in 0..k {
                let mass: f64 = resp.iter().map(|r| r[c]).sum();
                if mass <= f64::EPSILON {
                    continue;
                }
                let mut mean = DVector::<f64>::zeros(points[0].len());
                for (p, r) in points.iter().zip(resp.iter()) {
                    mean += p * r[c];
                }
                mean /= mass;
                let var: f64 = points
                    .iter()
                    .zip(resp.iter())
                    .map(|(p, r)| r[c] * (p - &mean).norm_squared())
                    .sum::<f64>()
                    / (mass * dim);
                means[c] = mean;
                variances[c] = var.max(self.min_variance);
                weights[c] = mass / n as f64;
            }
        }

        let assignments: Vec<usize> = resp
            .iter()
            .map(|r| {
                r.iter()
                    .enumerate()
                    .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
                    .map(|(i, _)| i)
                    .expect("k > 0")
            })
            .collect();

        let clustering = Clustering {
            centers: means,
            assignments,
        };
        check_separation(&clustering)?;
        Ok(clustering)
    }

    fn name(&self) -> &'static str {
        "gaussian-mixture"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn two_blobs() -> Vec<DVector<f64>> {
        let mut points = Vec::new();
        for i in 0..5 {
            points.push(DVector::from_vec(vec![0.0 + 0.1 * i as f64, 0.0]));
            points.push(DVector::from_vec(vec![10.0 + 0.1 * i as f64, 0.0]));
        }
        points
    }

    #[test]
    fn test_kmeans_separates_two_blobs() {
        let points = two_blobs();
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        let clustering = KMeans::default().cluster(&points, 2, &mut rng).unwrap();
        assert_eq!(clustering.centers.len(), 2);
        // points of one blob share a component
        assert_eq!(clustering.assignments[0], clustering.assignments[2]);
        assert_ne!(clustering.assignments[0], clustering.assignments[1]);
        let gap = (&clustering.centers[0] - &clustering.centers[1]).norm();
        assert!(gap > 5.0);
    }

    #[test]
    fn test_gmm_refines_kmeans() {
        let points = two_blobs();
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        let clustering = GaussianMixture::default()
            .cluster(&points, 2, &mut rng)
            .unwrap();
        assert_eq!(clustering.centers.len(), 2);
        assert_ne!(clustering.assignments[0], clustering.assignments[1]);
    }

    #[test]
    fn test_degenerate_coordinates_rejected() {
        // all samples coincide: no split into 2 exists
        let points = vec![DVector::from_vec(vec![1.0, 1.0]); 6];
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        assert!(KMeans::default().cluster(&points, 2, &mut rng).is_err());
    }

    #[test]
    fn test_too_few_points_rejected() {
        let points = vec![DVector::from_vec(vec![1.0, 1.0])];
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        assert!(KMeans::default().cluster(&points, 2, &mut rng).is_err());
    }
}
