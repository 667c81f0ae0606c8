//! Compute-graph model for the bufuse fusion engine.
//!
//! Nodes are operator instances tagged with a concrete operator type and a
//! fusion category ([`OpKind`]); edges carry tensor descriptors (shape,
//! layout, element type). The fusion engine reads structure and metadata
//! and writes node attributes only.

mod attr;
mod display;
mod error;
pub mod graph;
mod types;

pub use attr::AttrValue;
pub use display::dump_graph;
pub use error::GraphError;
pub use graph::{ComputeGraph, EdgeId, GraphNode, NodeId, TensorInfo};
pub use types::{DataType, Format, OpKind, TensorDesc};
