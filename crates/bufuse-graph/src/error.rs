//! Error types for the compute graph.

use crate::graph::{EdgeId, NodeId};

/// Errors raised while building, loading or querying a compute graph.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    /// An edge id is not registered in the graph.
    #[error("edge {0:?} is not registered in the graph")]
    UnknownEdge(EdgeId),

    /// A node id is not present in the graph.
    #[error("node {0:?} is not present in the graph")]
    UnknownNode(NodeId),

    /// Two nodes share an id.
    #[error("node id {0:?} is used more than once")]
    DuplicateNode(NodeId),

    /// No id is left to allocate after the highest one in use.
    #[error("{0} id space exhausted")]
    IdSpaceExhausted(&'static str),

    /// An edge already has a producer.
    #[error("edge {edge:?} is already produced by node '{producer}'")]
    DuplicateProducer { edge: EdgeId, producer: String },

    /// The graph contains a cycle.
    #[error("graph contains a cycle ({visited} of {total} nodes ordered)")]
    Cycle { visited: usize, total: usize },

    /// An operator kind string could not be parsed.
    #[error("unknown operator kind '{0}'")]
    UnknownOpKind(String),

    /// The serialized graph could not be parsed.
    #[error("malformed graph: {0}")]
    Malformed(#[from] serde_json::Error),
}
