/*!
Temporal hypotheses graph.

A layered DAG of candidate object lifetimes: nodes are detections
(traxels), arcs are candidate transitions between consecutive timesteps.
Solutions are written back as per-iteration activity labels on nodes and
arcs.

- [`graph`] - arena-based graph with dense property maps
- [`builder`] - nearest-neighbor candidate graph construction
- [`tracklets`] - compression of unambiguous 1:1 chains
*/

pub mod builder;
pub mod graph;
pub mod tracklets;

pub use builder::{BuilderOptions, SingleTimestepBuilder};
pub use graph::{ArcId, HypothesesGraph, NodeId};
pub use tracklets::{generate_tracklet_graph, TrackletGraph};
