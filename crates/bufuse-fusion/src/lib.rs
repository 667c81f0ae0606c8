//! Buffer-fusion pattern matching for accelerator compute graphs.
//!
//! Passes describe fusable operator families as [`Pattern`]s. The
//! [`FusionEngine`] matches them against a [`ComputeGraph`], asks each pass
//! which matched nodes are legal to fuse, and records the result on the
//! graph: a shared `fusion_scope` id and the fused kernel's slice info.
//!
//! [`ComputeGraph`]: bufuse_graph::ComputeGraph

pub mod config;
pub mod engine;
mod log_context;
pub mod matcher;
pub mod passes;
pub mod pattern;
pub mod rules;
pub mod selector;
pub mod slice;

pub use config::{ConfigError, FusionConfig};
pub use engine::{EngineError, FusedScope, FusionEngine, FusionReport};
pub use log_context::LogContext;
pub use matcher::{is_fused, match_pattern, match_pattern_excluding, Mapping, FUSION_SCOPE_ATTR};
pub use passes::{FusionPass, FusionPassRegistry};
pub use pattern::{BranchMode, OpDesc, Pattern, PatternBuilder, PatternError, TypeFilter};
pub use rules::{Rejection, RuleContext, ValidityRule};
pub use selector::FusionDecision;
pub use slice::{OpCalcInfo, SliceInfoError, SlicePropagator, OP_SLICE_INFO_ATTR};
