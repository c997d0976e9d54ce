//! Field of view of the capture volume
//!
//! Answers whether a point lies within a margin of the spatial boundary,
//! which decides appearance/disappearance eligibility instead of forced
//! conservation.

use serde::Serialize;

/// Axis-aligned space-time box covering the captured volume.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FieldOfView {
    /// Lower bounds (t, x, y, z)
    pub lower: [f64; 4],
    /// Upper bounds (t, x, y, z)
    pub upper: [f64; 4],
}

impl FieldOfView {
    /// Create a field of view from explicit bounds
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        t_low: f64,
        x_low: f64,
        y_low: f64,
        z_low: f64,
        t_up: f64,
        x_up: f64,
        y_up: f64,
        z_up: f64,
    ) -> Self {
        Self {
            lower: [t_low, x_low, y_low, z_low],
            upper: [t_up, x_up, y_up, z_up],
        }
    }

    /// Whether the space-time point lies inside the box
    pub fn contains(&self, t: f64, x: f64, y: f64, z: f64) -> bool {
        let p = [t, x, y, z];
        p.iter()
            .zip(self.lower.iter().zip(self.upper.iter()))
            .all(|(v, (lo, up))| v >= lo && v <= up)
    }

    /// Shortest distance from a spatial point to the spatial boundary.
    ///
    /// Degenerate axes (upper == lower, e.g. z in 2D data) are skipped.
    /// Points outside the box report distance 0.
    pub fn spatial_margin(&self, x: f64, y: f64, z: f64) -> f64 {
        let p = [x, y, z];
        let mut margin = f64::INFINITY;
        let mut bounded = false;
        for (i, v) in p.iter().enumerate() {
            let lo = self.lower[i + 1];
            let up = self.upper[i + 1];
            if up <= lo {
                continue;
            }
            bounded = true;
            margin = margin.min((v - lo).max(0.0)).min((up - v).max(0.0));
        }
        // a fully degenerate volume has no interior; an unbounded one is
        // all interior (margin stays infinite)
        if bounded {
            margin
        } else {
            0.0
        }
    }

    /// First timestep covered by the field of view
    pub fn earliest_time(&self) -> f64 {
        self.lower[0]
    }

    /// Last timestep covered by the field of view
    pub fn latest_time(&self) -> f64 {
        self.upper[0]
    }
}

impl Default for FieldOfView {
    /// An unbounded field of view: every point is infinitely far from the
    /// border, so no node is border-eligible.
    fn default() -> Self {
        Self {
            lower: [f64::NEG_INFINITY; 4],
            upper: [f64::INFINITY; 4],
        }
    }
}
