//! Compiles job specs into executable graphs.

mod compiler;
mod graph;
mod spec;

pub use compiler::Grapher;
pub use graph::{generate_node_id, Graph, Node, NodeId};
pub use spec::{Category, ChainSpec, JobSpec, SequenceSpec, StageSpec};
