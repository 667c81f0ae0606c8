//! Pooling followed by an activation and requantization.

use bufuse_graph::{ComputeGraph, DataType, OpKind};

use super::{build_patterns, FusionPass};
use crate::config::FusionConfig;
use crate::log_context::LogContext;
use crate::matcher::Mapping;
use crate::pattern::{BranchMode, Pattern, PatternBuilder, TypeFilter};
use crate::rules::{
    check_all, ActivationAllowList, DataTypeRule, FormatRule, PoolInputWidthRule, PoolWindowRule,
    RuleContext, TensorSlot, ValidityRule,
};
use crate::selector::{flatten, prune_chain, FusionDecision};

const POOL: &str = "pool";
const ELTWISE: &str = "eltwise";
const QUANT: &str = "quant";

#[derive(Debug)]
pub struct PoolQuantFusion {
    patterns: Vec<Pattern>,
    window: PoolWindowRule,
    width: PoolInputWidthRule,
    format: FormatRule,
    allow: ActivationAllowList,
    quant_output: DataTypeRule,
}

impl PoolQuantFusion {
    pub fn new(config: &FusionConfig) -> Self {
        let pattern = PatternBuilder::new("pool_eltwise_quant")
            .add_op(POOL, TypeFilter::kinds(&[OpKind::Pool2d]), 1, 1)
            .add_op(ELTWISE, TypeFilter::kinds(&[OpKind::ElemWise]), 0, 1)
            .add_op(QUANT, TypeFilter::kinds(&[OpKind::Quant]), 0, 1)
            .set_outputs(POOL, &[ELTWISE, QUANT], BranchMode::Single, false)
            .set_outputs(ELTWISE, &[QUANT], BranchMode::Single, false)
            .set_head(&[POOL]);

        Self {
            patterns: build_patterns("pool-quant", vec![pattern]),
            window: PoolWindowRule::new(config.max_pool_window, config.max_stride),
            width: PoolInputWidthRule::new(config.l1_line_buffer_bytes, config.c0),
            format: FormatRule::new(config.zero_copy_formats.clone()),
            allow: ActivationAllowList::new(config.allowed_activations.clone()),
            quant_output: DataTypeRule::new(TensorSlot::Output(0), DataType::Int8),
        }
    }
}

impl FusionPass for PoolQuantFusion {
    fn name(&self) -> &str {
        "pool-quant"
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

        // The width limit depends on the window the first rule records.
        let pool_rules: [&dyn ValidityRule; 3] =
            [&self.window, &self.width, &self.format];
        if let Err(rejection) = check_all(&pool_rules, graph, mapping.nodes(POOL), ctx, log_ctx) {
            return FusionDecision::Reject(rejection);
        }

        prune_chain(
            graph,
            pattern,
            &mut mapping,
            ELTWISE,
            &[&self.allow],
            ctx,
            log_ctx,
        );
        if let Err(rejection) =
            check_all(&[&self.quant_output], graph, mapping.nodes(QUANT), ctx, log_ctx)
        {
            return FusionDecision::Reject(rejection);
        }

        if mapping.nodes(ELTWISE).is_empty() && mapping.nodes(QUANT).is_empty() {
            return FusionDecision::UseCommonRule;
        }
        FusionDecision::Fuse(flatten(pattern, &mapping))
    }
}
