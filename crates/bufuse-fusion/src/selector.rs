//! Turning a [`Mapping`] into the node set that is actually fused.

use std::collections::{BTreeMap, BTreeSet};

use bufuse_graph::{ComputeGraph, NodeId, OpKind};

use crate::log_context::LogContext;
use crate::matcher::Mapping;
use crate::pattern::Pattern;
use crate::rules::{check_all, Rejection, RuleContext, ValidityRule};

/// Outcome of node selection for one match.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FusionDecision {
    Fuse(Vec<NodeId>),
    /// Only nodes the generic fusion already handles remain.
    UseCommonRule,
    Reject(Rejection),
}

impl FusionDecision {
    pub fn is_fuse(&self) -> bool {
        matches!(self, Self::Fuse(_))
    }

    /// The nodes to fuse; empty unless the decision is [`Fuse`](Self::Fuse).
    pub fn into_nodes(self) -> Vec<NodeId> {
        match self {
            Self::Fuse(nodes) => nodes,
            Self::UseCommonRule | Self::Reject(_) => Vec::new(),
        }
    }
}

/// Nodes of every typed role, deduplicated, in mapping order.
///
/// `AnyInput` roles describe outside producers and never join the set.
pub fn flatten(pattern: &Pattern, mapping: &Mapping) -> Vec<NodeId> {
    let mut seen = BTreeSet::new();
    let mut nodes = Vec::new();
    for (role, bound) in mapping.iter() {
        let any_input = pattern
            .desc(role)
            .is_some_and(|d| d.filter.is_any_input());
        if any_input {
            continue;
        }
        for &id in bound {
            if seen.insert(id) {
                nodes.push(id);
            }
        }
    }
    nodes
}

/// Remove chain nodes that fail `rules`.
///
/// Each node bound to `chain_role` is checked in order. A failing node is
/// unbound together with every candidate reachable from it, so output
/// formatting nodes behind it go too while those on other branches stay.
/// Returns the unbound nodes in id order.
pub fn prune_chain(
    graph: &ComputeGraph,
    pattern: &Pattern,
    mapping: &mut Mapping,
    chain_role: &str,
    rules: &[&dyn ValidityRule],
    ctx: &mut RuleContext,
    log_ctx: LogContext<'_>,
) -> BTreeSet<NodeId> {
    let candidates: BTreeSet<NodeId> = flatten(pattern, mapping).into_iter().collect();
    let mut removed = BTreeSet::new();

    for &id in mapping.nodes(chain_role) {
        if removed.contains(&id) {
            continue;
        }
        if check_all(rules, graph, &[id], ctx, log_ctx).is_ok() {
            continue;
        }
        let mut worklist = vec![id];
        while let Some(cur) = worklist.pop() {
            if !removed.insert(cur) {
                continue;
            }
            worklist.extend(
                graph
                    .successors(cur)
                    .into_iter()
                    .filter(|s| candidates.contains(s) && !removed.contains(s)),
            );
        }
    }

    if !removed.is_empty() {
        log::debug!("{log_ctx} pruned {} node(s): {removed:?}", removed.len());
    }
    for &id in &removed {
        mapping.remove_node(id);
    }
    removed
}

fn is_convolution(kind: OpKind) -> bool {
    matches!(kind, OpKind::Convolution | OpKind::DepthwiseConvolution)
}

/// Keep one of several convolution branches.
///
/// Branches are the pattern's operand groups. Between two groups each
/// holding a convolution, a group whose convolution is downstream of the
/// other's wins; without a dependency path the convolution with more output
/// channels wins, and on a tie the lower node id. Losing groups are unbound
/// from `mapping`. Returns the unbound nodes in id order.
pub fn dedup_branches(
    graph: &ComputeGraph,
    pattern: &Pattern,
    mapping: &mut Mapping,
    log_ctx: LogContext<'_>,
) -> BTreeSet<NodeId> {
    let mut groups: BTreeMap<u32, Vec<NodeId>> = BTreeMap::new();
    for desc in pattern.descs() {
        if let Some(group) = desc.group {
            groups
                .entry(group)
                .or_default()
                .extend_from_slice(mapping.nodes(&desc.name));
        }
    }

    let conv_of = |nodes: &[NodeId]| {
        nodes
            .iter()
            .copied()
            .find(|&id| graph.node(id).is_some_and(|n| is_convolution(n.kind)))
    };
    let channels = |id: NodeId| {
        graph
            .output_desc(id, 0)
            .and_then(|d| d.channels())
            .unwrap_or(0)
    };

    let mut winner: Option<(u32, NodeId)> = None;
    let mut losers = Vec::new();
    for (&group, nodes) in &groups {
        let Some(conv) = conv_of(nodes) else {
            continue;
        };
        let Some((best_group, best)) = winner else {
            winner = Some((group, conv));
            continue;
        };
        let challenger_wins = if graph.has_path(best, conv) {
            true
        } else if graph.has_path(conv, best) {
            false
        } else {
            let (c_new, c_best) = (channels(conv), channels(best));
            c_new > c_best || (c_new == c_best && conv < best)
        };
        if challenger_wins {
            losers.push(best_group);
            winner = Some((group, conv));
        } else {
            losers.push(group);
        }
    }

    let mut evicted = BTreeSet::new();
    for group in losers {
        for &id in &groups[&group] {
            mapping.remove_node(id);
            evicted.insert(id);
        }
    }
    if let Some((group, conv)) = winner.filter(|_| !evicted.is_empty()) {
        log::debug!(
            "{log_ctx} kept branch group {group} (convolution {conv:?}), evicted {evicted:?}"
        );
    }
    evicted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::match_pattern;
    use crate::pattern::{BranchMode, PatternBuilder, TypeFilter};
    use crate::rules::ActivationAllowList;
    use bufuse_graph::{DataType, EdgeId, Format, TensorDesc};

    fn fmap(c1: i64) -> TensorDesc {
        TensorDesc::new(vec![1, c1, 8, 8, 16], Format::Nc1hwc0, DataType::Float16)
    }

    fn node(g: &mut ComputeGraph, op: &str, kind: OpKind, inputs: Vec<EdgeId>, name: &str) -> (NodeId, EdgeId) {
        let out = g.add_tensor(format!("{name}_out"), fmap(1));
        let id = g.add_node(op, kind, inputs, vec![out], name).unwrap();
        (id, out)
    }

    fn chain_pattern() -> Pattern {
        PatternBuilder::new("chain")
            .add_op("conv", TypeFilter::kinds(&[OpKind::Convolution]), 1, 1)
            .add_op("eltwise", TypeFilter::kinds(&[OpKind::ElemWise]), 0, 4)
            .add_op("quant", TypeFilter::kinds(&[OpKind::Quant]), 0, 1)
            .add_op("other", TypeFilter::AnyInput, 0, 1)
            .set_outputs("conv", &["eltwise"], BranchMode::None, false)
            .set_outputs("eltwise", &["eltwise", "quant"], BranchMode::None, false)
            .set_outputs("other", &["eltwise"], BranchMode::None, false)
            .set_head(&["conv"])
            .build()
            .unwrap()
    }

    #[test]
    fn decision_nodes() {
        assert_eq!(FusionDecision::Fuse(vec![NodeId(1)]).into_nodes(), vec![NodeId(1)]);
        assert!(FusionDecision::UseCommonRule.into_nodes().is_empty());
        assert!(!FusionDecision::Reject(Rejection::new("r", "x")).is_fuse());
    }

    #[test]
    fn flatten_skips_outside_producers() {
        let mut g = ComputeGraph::new();
        let x = g.add_tensor("x", fmap(1));
        let (pre, p) = node(&mut g, "Cast", OpKind::Opaque, vec![x], "pre");
        let (conv, c) = node(&mut g, "Conv2D", OpKind::Convolution, vec![x], "conv");
        let (add, _) = node(&mut g, "Add", OpKind::ElemWise, vec![c, p], "add");

        let pattern = chain_pattern();
        let mapping = match_pattern(&g, &pattern).unwrap();
        assert_eq!(mapping.nodes("other"), &[pre]);
        assert_eq!(flatten(&pattern, &mapping), vec![conv, add]);
    }

    /// conv -> relu -> sqrt -> relu2 -> quant, with a sibling relu_side off conv.
    #[test]
    fn disallowed_activation_prunes_reachable_only() {
        let mut g = ComputeGraph::new();
        let x = g.add_tensor("x", fmap(1));
        let (conv, c) = node(&mut g, "Conv2D", OpKind::Convolution, vec![x], "conv");
        let (relu, r) = node(&mut g, "Relu", OpKind::ElemWise, vec![c], "relu");
        let (side, _) = node(&mut g, "LeakyRelu", OpKind::ElemWise, vec![c], "side");
        let (sqrt, s) = node(&mut g, "Sqrt", OpKind::ElemWise, vec![r], "sqrt");
        let (relu2, r2) = node(&mut g, "Relu", OpKind::ElemWise, vec![s], "relu2");
        let (quant, _) = node(&mut g, "AscendQuant", OpKind::Quant, vec![r2], "quant");

        let pattern = chain_pattern();
        let mut mapping = match_pattern(&g, &pattern).unwrap();
        assert_eq!(mapping.nodes("eltwise").len(), 4);
        assert_eq!(mapping.nodes("quant"), &[quant]);

        let allow = ActivationAllowList::new(vec!["Relu".into(), "Relu6".into(), "LeakyRelu".into()]);
        let mut ctx = RuleContext::default();
        let removed = prune_chain(
            &g,
            &pattern,
            &mut mapping,
            "eltwise",
            &[&allow],
            &mut ctx,
            LogContext::new("test", "chain"),
        );
        assert_eq!(removed, BTreeSet::from([sqrt, relu2, quant]));
        assert_eq!(flatten(&pattern, &mapping), vec![conv, relu, side]);
    }

    /// conv -> relu_a -> sqrt, conv -> relu_b -> quant.
    #[test]
    fn quant_on_healthy_branch_survives() {
        let mut g = ComputeGraph::new();
        let x = g.add_tensor("x", fmap(1));
        let (conv, c) = node(&mut g, "Conv2D", OpKind::Convolution, vec![x], "conv");
        let (relu_a, ra) = node(&mut g, "Relu", OpKind::ElemWise, vec![c], "relu_a");
        let (relu_b, rb) = node(&mut g, "Relu", OpKind::ElemWise, vec![c], "relu_b");
        let (sqrt, _) = node(&mut g, "Sqrt", OpKind::ElemWise, vec![ra], "sqrt");
        let (quant, _) = node(&mut g, "AscendQuant", OpKind::Quant, vec![rb], "quant");

        let pattern = chain_pattern();
        let mut mapping = match_pattern(&g, &pattern).unwrap();
        assert_eq!(mapping.nodes("quant"), &[quant]);

        let allow = ActivationAllowList::new(vec!["Relu".into()]);
        let removed = prune_chain(
            &g,
            &pattern,
            &mut mapping,
            "eltwise",
            &[&allow],
            &mut RuleContext::default(),
            LogContext::new("test", "chain"),
        );
        assert_eq!(removed, BTreeSet::from([sqrt]));
        let kept: BTreeSet<NodeId> = flatten(&pattern, &mapping).into_iter().collect();
        assert_eq!(kept, BTreeSet::from([conv, relu_a, relu_b, quant]));
    }

    #[test]
    fn clean_chain_is_untouched() {
        let mut g = ComputeGraph::new();
        let x = g.add_tensor("x", fmap(1));
        let (_, c) = node(&mut g, "Conv2D", OpKind::Convolution, vec![x], "conv");
        let (_, r) = node(&mut g, "Relu", OpKind::ElemWise, vec![c], "relu");
        node(&mut g, "AscendQuant", OpKind::Quant, vec![r], "quant");

        let pattern = chain_pattern();
        let mut mapping = match_pattern(&g, &pattern).unwrap();
        let allow = ActivationAllowList::new(vec!["Relu".into()]);
        let removed = prune_chain(
            &g,
            &pattern,
            &mut mapping,
            "eltwise",
            &[&allow],
            &mut RuleContext::default(),
            LogContext::new("test", "chain"),
        );
        assert!(removed.is_empty());
        assert_eq!(mapping.node_count(), 3);
    }

    fn branch_pattern() -> Pattern {
        let conv = TypeFilter::kinds(&[OpKind::Convolution]);
        PatternBuilder::new("branches")
            .add_op_in_group("conv_a", conv.clone(), 1, 1, 1)
            .add_op_in_group("conv_b", conv, 0, 1, 2)
            .add_op("add", TypeFilter::kinds(&[OpKind::ElemWise]), 1, 1)
            .set_outputs("conv_a", &["add"], BranchMode::None, false)
            .set_outputs("conv_b", &["add"], BranchMode::None, false)
            .set_head(&["conv_a", "conv_b"])
            .build()
            .unwrap()
    }

    fn conv_with_channels(g: &mut ComputeGraph, input: EdgeId, c1: i64, name: &str) -> (NodeId, EdgeId) {
        let out = g.add_tensor(format!("{name}_out"), fmap(c1));
        let id = g.add_node("Conv2D", OpKind::Convolution, vec![input], vec![out], name).unwrap();
        (id, out)
    }

    #[test]
    fn independent_branches_keep_more_channels() {
        let mut g = ComputeGraph::new();
        let x = g.add_tensor("x", fmap(1));
        let (small, a) = conv_with_channels(&mut g, x, 1, "small");
        let (wide, b) = conv_with_channels(&mut g, x, 2, "wide");
        let (add, _) = node(&mut g, "Add", OpKind::ElemWise, vec![a, b], "add");

        let pattern = branch_pattern();
        let mut mapping = match_pattern(&g, &pattern).unwrap();
        let evicted = dedup_branches(&g, &pattern, &mut mapping, LogContext::new("test", "b"));
        assert_eq!(evicted, BTreeSet::from([small]));
        assert_eq!(flatten(&pattern, &mapping), vec![wide, add]);
    }

    #[test]
    fn channel_tie_keeps_lower_id() {
        let mut g = ComputeGraph::new();
        let x = g.add_tensor("x", fmap(1));
        let (first, a) = conv_with_channels(&mut g, x, 2, "first");
        let (second, b) = conv_with_channels(&mut g, x, 2, "second");
        node(&mut g, "Add", OpKind::ElemWise, vec![a, b], "add");

        let pattern = branch_pattern();
        let mut mapping = match_pattern(&g, &pattern).unwrap();
        let evicted = dedup_branches(&g, &pattern, &mut mapping, LogContext::new("test", "b"));
        assert_eq!(evicted, BTreeSet::from([second]));
        assert_eq!(mapping.nodes("conv_a"), &[first]);
    }

    #[test]
    fn dependent_branch_keeps_downstream() {
        let mut g = ComputeGraph::new();
        let x = g.add_tensor("x", fmap(1));
        let (up, a) = conv_with_channels(&mut g, x, 4, "up");
        let (down, b) = conv_with_channels(&mut g, a, 1, "down");
        node(&mut g, "Add", OpKind::ElemWise, vec![a, b], "add");

        let pattern = branch_pattern();
        let mut mapping = match_pattern(&g, &pattern).unwrap();
        let evicted = dedup_branches(&g, &pattern, &mut mapping, LogContext::new("test", "b"));
        assert_eq!(evicted, BTreeSet::from([up]));
        assert!(flatten(&pattern, &mapping).contains(&down));
    }

    #[test]
    fn single_branch_is_kept() {
        let mut g = ComputeGraph::new();
        let x = g.add_tensor("x", fmap(1));
        let (_, a) = conv_with_channels(&mut g, x, 1, "only");
        node(&mut g, "Relu", OpKind::ElemWise, vec![a], "relu");

        let pattern = branch_pattern();
        let mut mapping = match_pattern(&g, &pattern).unwrap();
        assert!(dedup_branches(&g, &pattern, &mut mapping, LogContext::new("test", "b")).is_empty());
        assert_eq!(mapping.node_count(), 2);
    }
}
