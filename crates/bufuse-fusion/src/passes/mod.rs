//! Operator-family fusion passes.
//!
//! Each [`FusionPass`] owns its patterns, built once at construction, and
//! decides which nodes of a match are fused. The [`FusionPassRegistry`]
//! collects the passes the engine runs.

mod conv_branch;
mod conv_dequant;
mod conv_reduce;
mod pool_quant;

pub use conv_branch::ConvBranchFusion;
pub use conv_dequant::ConvDequantFusion;
pub use conv_reduce::ConvReduceFusion;
pub use pool_quant::PoolQuantFusion;

use std::fmt::Debug;

use bufuse_graph::{ComputeGraph, NodeId};

use crate::config::FusionConfig;
use crate::log_context::LogContext;
use crate::matcher::Mapping;
use crate::pattern::{Pattern, PatternBuilder};
use crate::rules::RuleContext;
use crate::selector::FusionDecision;
use crate::slice::L1FusionEnable;

/// A fusion pass for one operator family.
pub trait FusionPass: Debug {
    /// Name used in logs, reports and `enabled_passes`.
    fn name(&self) -> &str;

    /// Patterns in matching order.
    fn patterns(&self) -> &[Pattern];

    /// Select the nodes of `mapping` to fuse.
    fn get_fusion_nodes(
        &self,
        graph: &ComputeGraph,
        pattern: &Pattern,
        mapping: &Mapping,
        ctx: &mut RuleContext,
        log_ctx: LogContext<'_>,
    ) -> FusionDecision;

    /// L1 fusion flag forced onto the fused kernel, if any.
    fn l1_override(&self, _graph: &ComputeGraph, _nodes: &[NodeId]) -> Option<L1FusionEnable> {
        None
    }
}

/// Build `builders`, logging and skipping any that fail validation.
pub(crate) fn build_patterns(pass: &str, builders: Vec<PatternBuilder>) -> Vec<Pattern> {
    builders
        .into_iter()
        .filter_map(|b| match b.build() {
            Ok(pattern) => Some(pattern),
            Err(err) => {
                log::warn!("pass '{pass}': pattern skipped: {err}");
                None
            }
        })
        .collect()
}

/// Registry of fusion passes, run in registration order.
#[derive(Debug)]
pub struct FusionPassRegistry {
    passes: Vec<Box<dyn FusionPass>>,
}

impl Default for FusionPassRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FusionPassRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self { passes: Vec::new() }
    }

    /// Creates a registry pre-populated with the built-in passes.
    pub fn with_builtins(config: &FusionConfig) -> Self {
        let mut reg = Self::new();
        reg.register(Box::new(ConvDequantFusion::new(config)));
        reg.register(Box::new(ConvBranchFusion::new(config)));
        reg.register(Box::new(PoolQuantFusion::new(config)));
        reg.register(Box::new(ConvReduceFusion::new(config)));
        reg
    }

    /// Registers a pass.
    pub fn register(&mut self, pass: Box<dyn FusionPass>) {
        self.passes.push(pass);
    }

    /// Finds a pass by name.
    pub fn find(&self, name: &str) -> Option<&dyn FusionPass> {
        self.passes
            .iter()
            .find(|p| p.name() == name)
            .map(|p| &**p)
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn FusionPass> {
        self.passes.iter().map(|p| &**p)
    }

    /// Lists all pass names.
    pub fn list_passes(&self) -> Vec<&str> {
        self.passes.iter().map(|p| p.name()).collect()
    }

    /// Every registered pattern with the name of its pass.
    pub fn patterns(&self) -> Vec<(&str, &Pattern)> {
        self.passes
            .iter()
            .flat_map(|p| p.patterns().iter().map(move |pat| (p.name(), pat)))
            .collect()
    }
}
