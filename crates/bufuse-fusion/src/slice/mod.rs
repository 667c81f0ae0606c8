//! Slice (axis-split) metadata of fused kernels.
//!
//! A fused kernel inherits the split maps of its anchor. Every other node in
//! the set then removes the splits it cannot honour and describes how its
//! own external operands are cut.

mod info;
mod layout;
mod propagate;
mod rules;

pub use info::{
    AxisSplitMap, InputSplitInfo, L1FusionEnable, OpCalcInfo, OutputSplitInfo, CHANNEL_AXIS,
    UNBOUNDED_OVERLAP,
};
pub use layout::{KernelOperand, OperandCursor, OperandLayout};
pub use propagate::{read_slice_info, write_slice_info, SlicePropagator, OP_SLICE_INFO_ATTR};
pub use rules::{
    append_channel_input, delete_split_maps, slice_rule_for, NodeOperands, SliceRule, SplitKey,
};

use bufuse_graph::GraphError;

/// Errors raised while computing or persisting slice info.
#[derive(Debug, thiserror::Error)]
pub enum SliceInfoError {
    #[error("node '{0}' carries no slice info")]
    Missing(String),

    #[error("slice info of node '{node}' is malformed: {source}")]
    Malformed {
        node: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("slice info attribute of node '{0}' is not a string")]
    NotText(String),

    #[error("failed to encode slice info: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("empty fusion node set")]
    EmptyNodeSet,

    #[error(transparent)]
    Graph(#[from] GraphError),
}
