/*!
Merger resolution.

Nodes whose concluded count exceeds one hold several objects detected as
one blob. The resolver splits them by clustering the blob's coordinate
samples, re-derives candidate links for the new sub-objects and solves a
local assignment problem to re-link them across the affected frames.

- [`clustering`] - pluggable coordinate clustering (k-means, GMM)
- [`assignment`] - minimum-cost assignment used for re-linking
- [`resolver`] - the resolution pass over a concluded graph
*/

pub mod assignment;
pub mod clustering;
pub mod resolver;

pub use assignment::{min_cost_assignment, Assignment};
pub use clustering::{ClusterStrategy, Clustering, GaussianMixture, KMeans};
pub use resolver::{MergerResolver, ResolvedMerger, TimestepIdCoordinateMap};
