//! Error types for the tracking pipeline
//!
//! This module provides proper error handling instead of panics.

use std::fmt;

/// Errors that can occur while building or solving a tracking problem
#[derive(Debug, Clone)]
pub enum TrackingError {
    /// Invalid parameters or missing backend capability.
    ///
    /// Fatal, surfaced immediately, never retried.
    Configuration {
        /// Description of the configuration issue
        description: String,
    },

    /// No labeling satisfies the hard constraints.
    ///
    /// Fatal for this solve. Callers may retry with relaxed constraints
    /// as an explicit fallback, never automatically.
    Infeasible {
        /// Name of the first violated constraint
        constraint: String,
        /// Context (node/arc id, solver status)
        context: String,
    },

    /// The solver hit its wall-clock limit before finding any incumbent.
    ///
    /// A timeout with an incumbent is NOT an error: the backend returns the
    /// best labeling found, flagged as non-optimal.
    Timeout {
        /// Seconds elapsed when the deadline was hit
        elapsed_secs: f64,
    },

    /// Merger splitting failed for one node.
    ///
    /// Local: the node stays labeled as an unresolved merger, the overall
    /// run continues.
    Resolution {
        /// Traxel id of the merger node
        traxel_id: u32,
        /// Timestep of the merger node
        timestep: u32,
        /// Description of the failure
        description: String,
    },

    /// A required feature is missing from a traxel
    MissingFeature {
        /// Traxel id
        traxel_id: u32,
        /// Timestep
        timestep: u32,
        /// Feature name
        feature: String,
    },
}

impl TrackingError {
    /// Convenience constructor for configuration errors
    pub fn config(description: impl Into<String>) -> Self {
        TrackingError::Configuration {
            description: description.into(),
        }
    }

    /// Whether this error is fatal for the whole run
    pub fn is_fatal(&self) -> bool {
        !matches!(self, TrackingError::Resolution { .. })
    }

    /// Whether this is an infeasibility error
    pub fn is_infeasible(&self) -> bool {
        matches!(self, TrackingError::Infeasible { .. })
    }

    /// Whether this is a timeout without incumbent
    pub fn is_timeout(&self) -> bool {
        matches!(self, TrackingError::Timeout { .. })
    }
}

impl fmt::Display for TrackingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackingError::Configuration { description } => {
                write!(f, "Configuration error: {}", description)
            }
            TrackingError::Infeasible {
                constraint,
                context,
            } => {
                write!(f, "Infeasible model: constraint {} ({})", constraint, context)
            }
            TrackingError::Timeout { elapsed_secs } => {
                write!(
                    f,
                    "Solver timed out after {:.1}s without finding any solution",
                    elapsed_secs
                )
            }
            TrackingError::Resolution {
                traxel_id,
                timestep,
                description,
            } => {
                write!(
                    f,
                    "Merger resolution failed for traxel {} at t={}: {}",
                    traxel_id, timestep, description
                )
            }
            TrackingError::MissingFeature {
                traxel_id,
                timestep,
                feature,
            } => {
                write!(
                    f,
                    "Traxel {} at t={} is missing feature \"{}\"",
                    traxel_id, timestep, feature
                )
            }
        }
    }
}

impl std::error::Error for TrackingError {}
