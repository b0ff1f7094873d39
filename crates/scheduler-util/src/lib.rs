//! Small, shared building blocks used by the scheduler crate and its demo.

pub mod digest;
pub mod graph;

pub use digest::Digest;
pub use graph::{FinalizedGraph, Graph, GraphEdgeIdx, GraphNodeIdx};
