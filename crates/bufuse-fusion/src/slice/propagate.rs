use std::collections::BTreeSet;

use bufuse_graph::{ComputeGraph, GraphError, GraphNode, NodeId};

use super::info::{L1FusionEnable, OpCalcInfo};
use super::layout::{OperandCursor, OperandLayout};
use super::rules::{delete_split_maps, slice_rule_for, NodeOperands};
use super::SliceInfoError;
use crate::log_context::LogContext;

/// Node attribute holding the persisted [`OpCalcInfo`].
pub const OP_SLICE_INFO_ATTR: &str = "_op_slice_info";

/// Parse the slice info stored on `node`.
pub fn read_slice_info(node: &GraphNode) -> Result<OpCalcInfo, SliceInfoError> {
    let value = node
        .attr(OP_SLICE_INFO_ATTR)
        .ok_or_else(|| SliceInfoError::Missing(node.name.clone()))?;
    let text = value
        .as_str()
        .ok_or_else(|| SliceInfoError::NotText(node.name.clone()))?;
    OpCalcInfo::from_json(text).map_err(|source| SliceInfoError::Malformed {
        node: node.name.clone(),
        source,
    })
}

/// Store `info` on every node of `nodes`.
///
/// Nothing is written unless every node exists.
pub fn write_slice_info(
    graph: &mut ComputeGraph,
    nodes: &[NodeId],
    info: &OpCalcInfo,
) -> Result<(), SliceInfoError> {
    let text = info.to_json()?;
    if let Some(&missing) = nodes.iter().find(|&&id| graph.node(id).is_none()) {
        return Err(GraphError::UnknownNode(missing).into());
    }
    for &id in nodes {
        if let Some(node) = graph.node_mut(id) {
            node.set_attr(OP_SLICE_INFO_ATTR, text.as_str());
        }
    }
    Ok(())
}

/// Computes the slice info of a fused node set from its anchor.
pub struct SlicePropagator<'a> {
    graph: &'a ComputeGraph,
    log_ctx: LogContext<'a>,
}

impl<'a> SlicePropagator<'a> {
    pub fn new(graph: &'a ComputeGraph, log_ctx: LogContext<'a>) -> Self {
        Self { graph, log_ctx }
    }

    fn node(&self, id: NodeId) -> Result<&'a GraphNode, SliceInfoError> {
        self.graph
            .node(id)
            .ok_or_else(|| GraphError::UnknownNode(id).into())
    }

    /// The anchor (first anchor-kind node, else the first node) followed by
    /// the remaining nodes in topological order.
    pub fn join_order(&self, nodes: &[NodeId]) -> Result<Vec<NodeId>, SliceInfoError> {
        for &id in nodes {
            self.node(id)?;
        }
        let members: BTreeSet<NodeId> = nodes.iter().copied().collect();
        let topo: Vec<NodeId> = self
            .graph
            .topological_order()?
            .into_iter()
            .filter(|id| members.contains(id))
            .collect();

        let anchor = topo
            .iter()
            .copied()
            .find(|&id| self.graph.node(id).is_some_and(|n| n.kind.is_anchor()))
            .or_else(|| topo.first().copied())
            .ok_or(SliceInfoError::EmptyNodeSet)?;

        let mut order = vec![anchor];
        order.extend(topo.into_iter().filter(|&id| id != anchor));
        Ok(order)
    }

    /// Seed from the anchor's slice info, drop splits other nodes cannot
    /// honour, describe their external operands, then apply the L1 override.
    pub fn compute_slice_info(
        &self,
        nodes: &[NodeId],
        l1_override: Option<L1FusionEnable>,
    ) -> Result<OpCalcInfo, SliceInfoError> {
        let ctx = self.log_ctx;
        let order = self.join_order(nodes)?;
        let layout = OperandLayout::compute(self.graph, &order)?;

        let anchor = self.node(order[0])?;
        let mut info = read_slice_info(anchor)?;
        log::debug!(
            "{ctx} seeded {} split map(s) from anchor '{}'",
            info.split_maps.len(),
            anchor.name
        );

        let mut operands = Vec::with_capacity(order.len());
        for &id in &order {
            operands.push(NodeOperands {
                graph: self.graph,
                node: self.node(id)?,
                external_inputs: layout.input_slots(id),
                external_outputs: layout.output_slots(id),
            });
        }

        for ops in &operands {
            let Some(rule) = slice_rule_for(ops.node.kind) else {
                log::debug!(
                    "{ctx} no slice rule for {} node '{}'",
                    ops.node.kind,
                    ops.node.name
                );
                continue;
            };
            for key in rule.delete(ops) {
                let removed = delete_split_maps(&mut info.split_maps, key);
                if removed > 0 {
                    log::debug!(
                        "{ctx} {} '{}' removed {removed} split map(s) using {key:?}",
                        rule.name(),
                        ops.node.name
                    );
                }
            }
        }

        for ops in operands.iter().skip(1) {
            let Some(rule) = slice_rule_for(ops.node.kind) else {
                continue;
            };
            let inputs = layout.input_range(ops.node.id);
            let outputs = layout.output_range(ops.node.id);
            let mut cursor = OperandCursor::new(inputs.start, outputs.start);
            rule.update_input(ops, &mut cursor, &mut info.split_maps);
            rule.update_output(ops, &mut cursor, &mut info.split_maps);

            // The next node starts from its own layout position again.
            if cursor.next_input() != inputs.end || cursor.next_output() != outputs.end {
                log::warn!(
                    "{ctx} slice rule '{}' on '{}' ended at operands ({}, {}), expected ({}, {})",
                    rule.name(),
                    ops.node.name,
                    cursor.next_input(),
                    cursor.next_output(),
                    inputs.end,
                    outputs.end
                );
            }
        }

        if let Some(l1) = l1_override {
            if l1 != info.l1_fusion_enable {
                log::debug!(
                    "{ctx} l1 fusion {} -> {l1}",
                    info.l1_fusion_enable
                );
            }
            info.l1_fusion_enable = l1;
        }
        Ok(info)
    }
}
