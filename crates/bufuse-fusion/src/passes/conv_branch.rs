//! Two convolution branches joined by an `Add`, optionally followed by an
//! activation.

use bufuse_graph::{ComputeGraph, OpKind};

use super::{build_patterns, FusionPass};
use crate::config::FusionConfig;
use crate::log_context::LogContext;
use crate::matcher::Mapping;
use crate::pattern::{BranchMode, Pattern, PatternBuilder, TypeFilter};
use crate::rules::{check_all, ActivationAllowList, FormatRule, Rejection, RuleContext};
use crate::selector::{dedup_branches, flatten, prune_chain, FusionDecision};

const CONV_A: &str = "conv_a";
const DEQUANT_A: &str = "dequant_a";
const CONV_B: &str = "conv_b";
const DEQUANT_B: &str = "dequant_b";
const ADD: &str = "add";
const ACTIVATION: &str = "activation";

/// Only one convolution can own the cube unit of a fused kernel, so when
/// both branches of an `Add` start with a convolution, one branch is kept
/// and the other stays outside as a plain input.
#[derive(Debug)]
pub struct ConvBranchFusion {
    patterns: Vec<Pattern>,
    format: FormatRule,
    allow: ActivationAllowList,
}

impl ConvBranchFusion {
    pub fn new(config: &FusionConfig) -> Self {
        let conv = TypeFilter::kinds(&[OpKind::Convolution, OpKind::DepthwiseConvolution]);
        let dequant = TypeFilter::kinds(&[OpKind::Dequant]);
        let pattern = PatternBuilder::new("conv_branch_add")
            .add_op_in_group(CONV_A, conv.clone(), 1, 1, 1)
            .add_op_in_group(DEQUANT_A, dequant.clone(), 0, 1, 1)
            .add_op_in_group(CONV_B, conv, 0, 1, 2)
            .add_op_in_group(DEQUANT_B, dequant, 0, 1, 2)
            .add_op(ADD, TypeFilter::kinds(&[OpKind::ElemWise]), 1, 1)
            .add_op(ACTIVATION, TypeFilter::kinds(&[OpKind::ElemWise]), 0, 1)
            .set_outputs(CONV_A, &[DEQUANT_A, ADD], BranchMode::Single, false)
            .set_outputs(DEQUANT_A, &[ADD], BranchMode::Single, false)
            .set_outputs(CONV_B, &[DEQUANT_B, ADD], BranchMode::Single, false)
            .set_outputs(DEQUANT_B, &[ADD], BranchMode::Single, false)
            .set_outputs(ADD, &[ACTIVATION], BranchMode::Single, false)
            .set_head(&[CONV_A, CONV_B]);

        Self {
            patterns: build_patterns("conv-branch", vec![pattern]),
            format: FormatRule::new(config.zero_copy_formats.clone()),
            allow: ActivationAllowList::new(config.allowed_activations.clone()),
        }
    }
}

impl FusionPass for ConvBranchFusion {
    fn name(&self) -> &str {
        "conv-branch"
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

        for &id in mapping.nodes(ADD) {
            let Some(node) = graph.node(id) else {
                continue;
            };
            if node.op_type != "Add" {
                let rejection = Rejection::new(
                    "branch-join",
                    format!("branches join at '{}' ({}), not an Add", node.name, node.op_type),
                );
                log::debug!("{log_ctx} not fused: {rejection}");
                return FusionDecision::Reject(rejection);
            }
        }
        if let Err(rejection) = check_all(&[&self.format], graph, mapping.nodes(ADD), ctx, log_ctx)
        {
            return FusionDecision::Reject(rejection);
        }

        dedup_branches(graph, pattern, &mut mapping, log_ctx);
        prune_chain(
            graph,
            pattern,
            &mut mapping,
            ACTIVATION,
            &[&self.allow],
            ctx,
            log_ctx,
        );
        FusionDecision::Fuse(flatten(pattern, &mapping))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::match_pattern;
    use bufuse_graph::{DataType, EdgeId, Format, NodeId, TensorDesc};

    fn fmap(c0: i64) -> TensorDesc {
        TensorDesc::new(vec![1, 1, 8, 8, c0], Format::Nc1hwc0, DataType::Float16)
    }

    fn add_node(g: &mut ComputeGraph, op: &str, kind: OpKind, inputs: Vec<EdgeId>, c0: i64) -> (NodeId, EdgeId) {
        let out = g.add_tensor(format!("{op}_{}", g.node_count()), fmap(c0));
        let id = g
            .add_node(op, kind, inputs, vec![out], format!("{}{}", op.to_lowercase(), g.node_count()))
            .unwrap();
        (id, out)
    }

    fn decide(g: &ComputeGraph) -> FusionDecision {
        let pass = ConvBranchFusion::new(&FusionConfig::default());
        let pattern = &pass.patterns()[0];
        let mapping = match_pattern(g, pattern).unwrap();
        pass.get_fusion_nodes(
            g,
            pattern,
            &mapping,
            &mut RuleContext::default(),
            LogContext::new("conv-branch", pattern.name()),
        )
    }

    #[test]
    fn wider_branch_kept() {
        let mut g = ComputeGraph::new();
        let x = g.add_tensor("x", fmap(16));
        let (narrow, a) = add_node(&mut g, "Conv2D", OpKind::Convolution, vec![x], 4);
        let (wide, b) = add_node(&mut g, "Conv2D", OpKind::Convolution, vec![x], 8);
        let (deq, d) = add_node(&mut g, "AscendDequant", OpKind::Dequant, vec![b], 8);
        let (add, s) = add_node(&mut g, "Add", OpKind::ElemWise, vec![a, d], 8);
        let (relu, _) = add_node(&mut g, "Relu", OpKind::ElemWise, vec![s], 8);

        let nodes = decide(&g).into_nodes();
        assert!(!nodes.contains(&narrow));
        assert_eq!(nodes, vec![wide, deq, add, relu]);
    }

    #[test]
    fn non_add_join_rejected() {
        let mut g = ComputeGraph::new();
        let x = g.add_tensor("x", fmap(16));
        let (_, a) = add_node(&mut g, "Conv2D", OpKind::Convolution, vec![x], 16);
        let (_, b) = add_node(&mut g, "Conv2D", OpKind::Convolution, vec![x], 16);
        add_node(&mut g, "Mul", OpKind::ElemWise, vec![a, b], 16);

        match decide(&g) {
            FusionDecision::Reject(r) => assert_eq!(r.rule, "branch-join"),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn disallowed_activation_left_out() {
        let mut g = ComputeGraph::new();
        let x = g.add_tensor("x", fmap(16));
        let (conv, a) = add_node(&mut g, "Conv2D", OpKind::Convolution, vec![x], 16);
        let (add, s) = add_node(&mut g, "Add", OpKind::ElemWise, vec![a, x], 16);
        add_node(&mut g, "Sigmoid", OpKind::ElemWise, vec![s], 16);

        assert_eq!(decide(&g), FusionDecision::Fuse(vec![conv, add]));
    }
}
