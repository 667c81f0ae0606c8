//! Convolution feeding a batch-norm statistics reduction.

use bufuse_graph::{ComputeGraph, NodeId, OpKind};

use super::{build_patterns, FusionPass};
use crate::config::FusionConfig;
use crate::log_context::LogContext;
use crate::matcher::Mapping;
use crate::pattern::{BranchMode, Pattern, PatternBuilder, TypeFilter};
use crate::rules::{check_all, FormatRule, Rejection, RuleContext, StrideRule, ValidityRule};
use crate::selector::{flatten, FusionDecision};
use crate::slice::L1FusionEnable;

const CONV: &str = "conv";
const REDUCE: &str = "bn_reduce";

/// The convolution output is also read by the batch-norm update outside the
/// kernel, so the producer must fan out.
#[derive(Debug)]
pub struct ConvReduceFusion {
    patterns: Vec<Pattern>,
    stride: StrideRule,
    format: FormatRule,
}

impl ConvReduceFusion {
    pub fn new(config: &FusionConfig) -> Self {
        let pattern = PatternBuilder::new("conv_bn_reduce")
            .add_op(CONV, TypeFilter::kinds(&[OpKind::Convolution]), 1, 1)
            .add_op(REDUCE, TypeFilter::kinds(&[OpKind::CommReduce]), 1, 1)
            .set_outputs(CONV, &[REDUCE], BranchMode::Multi, false)
            .set_head(&[CONV]);

        Self {
            patterns: build_patterns("conv-reduce", vec![pattern]),
            stride: StrideRule::new(config.max_stride),
            format: FormatRule::new(config.zero_copy_formats.clone()),
        }
    }
}

impl FusionPass for ConvReduceFusion {
    fn name(&self) -> &str {
        "conv-reduce"
    }

    fn patterns(&self) -> &[Pattern] {
        &self.patterns
    }

    fn get_fusion_nodes(
        &self,
        graph: &ComputeGraph,
        pattern: &Pattern,
        mapping: &Mapping,
        ctx: &mut RuleContext,
        log_ctx: LogContext<'_>,
    ) -> FusionDecision {
        for &id in mapping.nodes(REDUCE) {
            match graph.node(id) {
                Some(node) if node.op_type == "BNTrainingReduce" => {}
                Some(node) => {
                    return FusionDecision::Reject(Rejection::new(
                        "reduce-type",
                        format!("'{}' is a {}, not a BNTrainingReduce", node.name, node.op_type),
                    ))
                }
                None => return FusionDecision::Reject(Rejection::new("reduce-type", "node missing")),
            }
        }
        let rules: [&dyn ValidityRule; 2] = [&self.stride, &self.format];
        match check_all(&rules, graph, mapping.nodes(CONV), ctx, log_ctx) {
            Ok(()) => FusionDecision::Fuse(flatten(pattern, mapping)),
            Err(rejection) => FusionDecision::Reject(rejection),
        }
    }

    /// Reduced statistics are written out per core, so the kernel cannot
    /// share L1 with its neighbours.
    fn l1_override(&self, _graph: &ComputeGraph, _nodes: &[NodeId]) -> Option<L1FusionEnable> {
        Some(L1FusionEnable::Disabled)
    }
}
