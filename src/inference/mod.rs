/*!
Inference backends.

One capability interface implemented by each backend; callers select a
variant by configuration:

- [`exact`] - branch-and-bound integer solver: the reference backend,
  supports warm starts, timeouts and m-best enumeration
- [`dynprog`] - successive best-path extraction over the layered DAG
- [`flow`] - min-cost-flow on the conservation network (no divisions)

All backends consume the same [`ProblemInstance`](crate::model::ProblemInstance)
and must produce labelings satisfying the same conservation invariants;
[`writer`] maps labelings back onto the graph and derives events.
*/

pub mod dynprog;
pub mod exact;
pub mod flow;
pub mod writer;

use std::time::Duration;

use serde::Serialize;

use crate::errors::TrackingError;
use crate::model::problem::{Labeling, ProblemInstance};

pub use dynprog::DynProgBackend;
pub use exact::ExactBackend;
pub use flow::FlowBackend;
pub use writer::SolutionWriter;

/// Which solver implementation to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SolverType {
    /// Branch-and-bound integer solver (reference; m-best capable)
    Exact,
    /// Dynamic programming over the layered DAG
    DynProg,
    /// Min-cost flow (conservation-only constraint subset)
    Flow,
}

/// Options shared by all backends
#[derive(Debug, Clone, Default)]
pub struct SolverOptions {
    /// Wall-clock bound; on expiry the best incumbent is returned,
    /// flagged non-optimal
    pub timeout: Option<Duration>,
    /// Number of ranked solutions to keep (m-best mode; Exact only)
    pub num_solutions: usize,
    /// Initial incumbent for warm-started solves (Exact only)
    pub warm_start: Option<Vec<usize>>,
}

/// The common backend contract.
///
/// `build` is idempotent given the same instance and never mutates the
/// hypotheses graph. `infer` is synchronous, blocking, a single attempt.
pub trait InferenceBackend {
    /// Backend name for logs and error contexts
    fn name(&self) -> &'static str;

    /// Whether the backend can enumerate ranked m-best solutions
    fn supports_mbest(&self) -> bool {
        false
    }

    /// Whether the backend accepts division coupling constraints
    fn supports_divisions(&self) -> bool {
        true
    }

    /// Prepare internal state for the given instance
    fn build(&mut self, instance: &ProblemInstance) -> Result<(), TrackingError>;

    /// Solve and return the best labeling found
    fn infer(&mut self, instance: &ProblemInstance) -> Result<Labeling, TrackingError>;

    /// Retrieve the k-th best labeling of the last solve.
    ///
    /// k = 0 is the best labeling. Backends without m-best support fail
    /// with a capability error for k > 0.
    fn solution(&self, k: usize) -> Result<Labeling, TrackingError> {
        if k > 0 {
            Err(TrackingError::config(format!(
                "backend \"{}\" cannot enumerate ranked solutions (requested k={})",
                self.name(),
                k
            )))
        } else {
            self.last_solution()
        }
    }

    /// The labeling produced by the last `infer` call
    fn last_solution(&self) -> Result<Labeling, TrackingError>;
}

/// Instantiate the configured backend.
///
/// Asking for a capability the chosen backend lacks (m-best on a
/// non-exact solver, divisions on the flow solver) is a fatal
/// configuration error raised here, before any solve attempt.
pub fn create_backend(
    solver: SolverType,
    options: SolverOptions,
    with_divisions: bool,
) -> Result<Box<dyn InferenceBackend>, TrackingError> {
    let backend: Box<dyn InferenceBackend> = match solver {
        SolverType::Exact => Box::new(ExactBackend::new(options.clone())),
        SolverType::DynProg => Box::new(DynProgBackend::new(options.clone())),
        SolverType::Flow => Box::new(FlowBackend::new(options.clone())),
    };
    if options.num_solutions > 1 && !backend.supports_mbest() {
        return Err(TrackingError::config(format!(
            "backend \"{}\" does not support m-best enumeration",
            backend.name()
        )));
    }
    if with_divisions && !backend.supports_divisions() {
        return Err(TrackingError::config(format!(
            "backend \"{}\" does not support division constraints",
            backend.name()
        )));
    }
    Ok(backend)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_errors_are_raised_before_solving() {
        let options = SolverOptions {
            num_solutions: 5,
            ..Default::default()
        };
        assert!(create_backend(SolverType::DynProg, options.clone(), false).is_err());
        assert!(create_backend(SolverType::Exact, options, false).is_ok());

        assert!(create_backend(SolverType::Flow, SolverOptions::default(), true).is_err());
        assert!(create_backend(SolverType::Flow, SolverOptions::default(), false).is_ok());
    }
}
