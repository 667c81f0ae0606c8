//! Quantized convolution chains: `conv → dequant → eltwise* → quant →
//! strided write`.

use bufuse_graph::{ComputeGraph, DataType, NodeId, OpKind};

use super::{build_patterns, FusionPass};
use crate::config::FusionConfig;
use crate::log_context::LogContext;
use crate::matcher::Mapping;
use crate::pattern::{BranchMode, Pattern, PatternBuilder, TypeFilter};
use crate::rules::{
    check_all, ActivationAllowList, DataTypeRule, FormatRule, RuleContext, ScalarOperandRule,
    TensorSlot,
};
use crate::selector::{flatten, prune_chain, FusionDecision};
use crate::slice::L1FusionEnable;

const CONV: &str = "conv";
const DEQUANT: &str = "dequant";
const ELTWISE: &str = "eltwise";
const QUANT: &str = "quant";
const STRIDED_WRITE: &str = "strided_write";
const OTHER_INPUT: &str = "other_input";

/// Fuses an int8 convolution with its dequantization, up to three
/// elementwise operators, requantization and a strided write.
#[derive(Debug)]
pub struct ConvDequantFusion {
    patterns: Vec<Pattern>,
    format: FormatRule,
    allow: ActivationAllowList,
    dequant_input: DataTypeRule,
    quant_output: DataTypeRule,
}

impl ConvDequantFusion {
    pub fn new(config: &FusionConfig) -> Self {
        let pattern = PatternBuilder::new("conv_dequant_chain")
            .add_op(
                CONV,
                TypeFilter::kinds(&[OpKind::Convolution, OpKind::DepthwiseConvolution]),
                1,
                1,
            )
            .add_op(
                DEQUANT,
                TypeFilter::kinds(&[OpKind::Dequant, OpKind::DequantS16]),
                0,
                1,
            )
            .add_op(ELTWISE, TypeFilter::kinds(&[OpKind::ElemWise]), 0, 3)
            .add_op(QUANT, TypeFilter::kinds(&[OpKind::Quant]), 0, 1)
            .add_op(STRIDED_WRITE, TypeFilter::kinds(&[OpKind::StridedWrite]), 0, 1)
            .add_op(OTHER_INPUT, TypeFilter::AnyInput, 0, 3)
            .set_outputs(CONV, &[DEQUANT], BranchMode::Single, false)
            .set_outputs(DEQUANT, &[ELTWISE, QUANT, STRIDED_WRITE], BranchMode::None, false)
            .set_outputs(ELTWISE, &[ELTWISE, QUANT, STRIDED_WRITE], BranchMode::None, false)
            .set_outputs(QUANT, &[STRIDED_WRITE], BranchMode::Single, false)
            .set_outputs(OTHER_INPUT, &[DEQUANT, ELTWISE], BranchMode::None, false)
            .set_head(&[CONV]);

        Self {
            patterns: build_patterns("conv-dequant", vec![pattern]),
            format: FormatRule::new(config.zero_copy_formats.clone()),
            allow: ActivationAllowList::new(config.allowed_activations.clone()),
            dequant_input: DataTypeRule::new(TensorSlot::Input(0), DataType::Int32),
            quant_output: DataTypeRule::new(TensorSlot::Output(0), DataType::Int8),
        }
    }
}

impl FusionPass for ConvDequantFusion {
    fn name(&self) -> &str {
        "conv-dequant"
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
        let mut mapping = mapping.clone();

        if let Err(rejection) = check_all(&[&self.format], graph, mapping.nodes(CONV), ctx, log_ctx)
            .and_then(|()| {
                check_all(&[&self.dequant_input], graph, mapping.nodes(DEQUANT), ctx, log_ctx)
            })
        {
            return FusionDecision::Reject(rejection);
        }

        prune_chain(
            graph,
            pattern,
            &mut mapping,
            ELTWISE,
            &[&self.allow, &ScalarOperandRule],
            ctx,
            log_ctx,
        );

        if let Err(rejection) =
            check_all(&[&self.quant_output], graph, mapping.nodes(QUANT), ctx, log_ctx)
        {
            return FusionDecision::Reject(rejection);
        }

        let tail_empty = [DEQUANT, QUANT, STRIDED_WRITE]
            .iter()
            .all(|role| mapping.nodes(role).is_empty());
        if tail_empty {
            log::debug!("{log_ctx} nothing beyond the generic elementwise fusion");
            return FusionDecision::UseCommonRule;
        }
        FusionDecision::Fuse(flatten(pattern, &mapping))
    }

    fn l1_override(&self, graph: &ComputeGraph, nodes: &[NodeId]) -> Option<L1FusionEnable> {
        let strided = nodes
            .iter()
            .any(|&id| graph.node(id).is_some_and(|n| n.kind == OpKind::StridedWrite));
        strided.then_some(L1FusionEnable::Disabled)
    }
}
