//! Kernel operand numbering of a fused node set.
//!
//! A fused kernel sees one flat list of inputs and one of outputs. Operands
//! are numbered in join order (anchor first, then the rest topologically) and
//! per node in slot order, so each node's external operands occupy a
//! contiguous index range.

use std::collections::BTreeSet;
use std::ops::Range;

use bufuse_graph::{ComputeGraph, EdgeId, GraphError, NodeId};

/// One edge crossing the fused-set boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KernelOperand {
    pub node: NodeId,
    pub slot: usize,
    pub edge: EdgeId,
    /// Position in the kernel's flat operand list.
    pub index: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct NodeRanges {
    node: NodeId,
    inputs: Range<usize>,
    outputs: Range<usize>,
}

/// External input and output numbering of a fused node set.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OperandLayout {
    inputs: Vec<KernelOperand>,
    outputs: Vec<KernelOperand>,
    ranges: Vec<NodeRanges>,
}

impl OperandLayout {
    /// Number the operands of `join_order`.
    ///
    /// An input is external when its producer lies outside the set or it has
    /// none. An output is external when it is a graph output, has a consumer
    /// outside the set, or has no consumer at all.
    pub fn compute(graph: &ComputeGraph, join_order: &[NodeId]) -> Result<Self, GraphError> {
        let members: BTreeSet<NodeId> = join_order.iter().copied().collect();
        let mut layout = Self::default();

        for &id in join_order {
            let node = graph.node(id).ok_or(GraphError::UnknownNode(id))?;

            let in_start = layout.inputs.len();
            for (slot, &edge) in node.inputs.iter().enumerate() {
                let internal = graph
                    .edge_producer(edge)
                    .is_some_and(|p| members.contains(&p.id));
                if !internal {
                    layout.inputs.push(KernelOperand {
                        node: id,
                        slot,
                        edge,
                        index: layout.inputs.len(),
                    });
                }
            }

            let out_start = layout.outputs.len();
            for (slot, &edge) in node.outputs.iter().enumerate() {
                let consumers = graph.edge_consumers(edge);
                let external = graph.is_graph_output(edge)
                    || consumers.is_empty()
                    || consumers.iter().any(|c| !members.contains(&c.id));
                if external {
                    layout.outputs.push(KernelOperand {
                        node: id,
                        slot,
                        edge,
                        index: layout.outputs.len(),
                    });
                }
            }

            layout.ranges.push(NodeRanges {
                node: id,
                inputs: in_start..layout.inputs.len(),
                outputs: out_start..layout.outputs.len(),
            });
        }
        Ok(layout)
    }

    pub fn inputs(&self) -> &[KernelOperand] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[KernelOperand] {
        &self.outputs
    }

    /// Kernel input indices owned by `node`; empty if it has none.
    pub fn input_range(&self, node: NodeId) -> Range<usize> {
        self.ranges
            .iter()
            .find(|r| r.node == node)
            .map_or(0..0, |r| r.inputs.clone())
    }

    pub fn output_range(&self, node: NodeId) -> Range<usize> {
        self.ranges
            .iter()
            .find(|r| r.node == node)
            .map_or(0..0, |r| r.outputs.clone())
    }

    /// External input slots of `node`, in slot order.
    pub fn input_slots(&self, node: NodeId) -> Vec<usize> {
        self.inputs[self.input_range(node)]
            .iter()
            .map(|o| o.slot)
            .collect()
    }

    pub fn output_slots(&self, node: NodeId) -> Vec<usize> {
        self.outputs[self.output_range(node)]
            .iter()
            .map(|o| o.slot)
            .collect()
    }
}

/// Next unassigned kernel input and output index while rules run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OperandCursor {
    next_input: usize,
    next_output: usize,
}

impl OperandCursor {
    pub fn new(next_input: usize, next_output: usize) -> Self {
        Self {
            next_input,
            next_output,
        }
    }

    pub fn next_input(&self) -> usize {
        self.next_input
    }

    pub fn next_output(&self) -> usize {
        self.next_output
    }

    /// Consume one input index.
    pub fn take_input(&mut self) -> usize {
        let idx = self.next_input;
        self.next_input += 1;
        idx
    }

    pub fn take_output(&mut self) -> usize {
        let idx = self.next_output;
        self.next_output += 1;
        idx
    }
}
