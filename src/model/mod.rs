/*!
Model construction: hypotheses graph in, optimization problem out.

- [`problem`] - the solver-agnostic problem instance: decision variables
  with cost tables, hard constraint descriptors, and the bidirectional
  variable maps used to write solutions back.
- [`builder`] - walks the graph and emits factors and constraints.
*/

pub mod builder;
pub mod problem;

pub use builder::{ModelBuilder, ModelParameter, TransitionCache};
pub use problem::{
    Constraint, Feasibility, Labeling, ProblemInstance, Variable, VariableKind,
};
