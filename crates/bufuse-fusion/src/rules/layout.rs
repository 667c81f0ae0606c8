use bufuse_graph::{ComputeGraph, DataType, Format, NodeId, TensorDesc};

use super::{Rejection, RuleContext, ValidityRule};

/// Input or output position on a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TensorSlot {
    Input(usize),
    Output(usize),
}

impl TensorSlot {
    fn resolve(self, graph: &ComputeGraph, node: NodeId) -> Option<&TensorDesc> {
        match self {
            Self::Input(i) => graph.input_desc(node, i),
            Self::Output(i) => graph.output_desc(node, i),
        }
    }
}

fn node_name(graph: &ComputeGraph, id: NodeId) -> &str {
    graph.node(id).map_or("<missing>", |n| n.name.as_str())
}

/// Adjacent operators can share a buffer without a copy only when the
/// feature map on both sides uses one of the zero-copy layouts.
#[derive(Debug)]
pub struct FormatRule {
    formats: Vec<Format>,
}

impl FormatRule {
    pub fn new(formats: Vec<Format>) -> Self {
        Self { formats }
    }
}

impl ValidityRule for FormatRule {
    fn name(&self) -> &'static str {
        "format"
    }

    fn check(
        &self,
        graph: &ComputeGraph,
        nodes: &[NodeId],
        _ctx: &mut RuleContext,
    ) -> Result<(), Rejection> {
        for &id in nodes {
            for slot in [TensorSlot::Input(0), TensorSlot::Output(0)] {
                let Some(desc) = slot.resolve(graph, id) else {
                    return Err(Rejection::new(
                        self.name(),
                        format!("node '{}' has no {slot:?}", node_name(graph, id)),
                    ));
                };
                if !self.formats.contains(&desc.format) {
                    return Err(Rejection::new(
                        self.name(),
                        format!(
                            "{slot:?} of node '{}' uses {}, which cannot be shared in place",
                            node_name(graph, id),
                            desc.format
                        ),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// A tensor on every listed node must have a given element type.
#[derive(Debug)]
pub struct DataTypeRule {
    slot: TensorSlot,
    dtype: DataType,
}

impl DataTypeRule {
    pub fn new(slot: TensorSlot, dtype: DataType) -> Self {
        Self { slot, dtype }
    }
}

impl ValidityRule for DataTypeRule {
    fn name(&self) -> &'static str {
        "data-type"
    }

    fn check(
        &self,
        graph: &ComputeGraph,
        nodes: &[NodeId],
        _ctx: &mut RuleContext,
    ) -> Result<(), Rejection> {
        for &id in nodes {
            match self.slot.resolve(graph, id) {
                Some(desc) if desc.dtype == self.dtype => {}
                Some(desc) => {
                    return Err(Rejection::new(
                        self.name(),
                        format!(
                            "{:?} of node '{}' is {:?}, expected {:?}",
                            self.slot,
                            node_name(graph, id),
                            desc.dtype,
                            self.dtype
                        ),
                    ))
                }
                None => {
                    return Err(Rejection::new(
                        self.name(),
                        format!("node '{}' has no {:?}", node_name(graph, id), self.slot),
                    ))
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_util::*;
    use super::*;
    use bufuse_graph::OpKind;

    #[test]
    fn format_rule_accepts_blocked_layout() {
        let mut g = ComputeGraph::new();
        let x = g.add_tensor("x", fmap(&[1, 1, 8, 8, 16]));
        let (conv, _) = add(&mut g, "Conv2D", OpKind::Convolution, vec![x], fmap(&[1, 1, 8, 8, 16]));
        let rule = FormatRule::new(vec![Format::Nc1hwc0]);
        assert!(rule.check(&g, &[conv], &mut RuleContext::default()).is_ok());
    }

    #[test]
    fn format_rule_rejects_plain_layout() {
        let mut g = ComputeGraph::new();
        let x = g.add_tensor("x", fmap(&[1, 1, 8, 8, 16]));
        let nhwc = TensorDesc::new(vec![1, 8, 8, 16], Format::Nhwc, DataType::Float16);
        let (conv, _) = add(&mut g, "Conv2D", OpKind::Convolution, vec![x], nhwc);
        let rule = FormatRule::new(vec![Format::Nc1hwc0]);
        let err = rule.check(&g, &[conv], &mut RuleContext::default()).unwrap_err();
        assert!(err.reason.contains("Output(0)"));
        assert!(err.reason.contains("NHWC"));
    }

    #[test]
    fn dtype_rule() {
        let mut g = ComputeGraph::new();
        let acc = TensorDesc::new(vec![1, 1, 8, 8, 16], Format::Nc1hwc0, DataType::Int32);
        let x = g.add_tensor("x", acc);
        let (deq, _) = add(&mut g, "AscendDequant", OpKind::Dequant, vec![x], fmap(&[1, 1, 8, 8, 16]));

        let mut ctx = RuleContext::default();
        assert!(DataTypeRule::new(TensorSlot::Input(0), DataType::Int32)
            .check(&g, &[deq], &mut ctx)
            .is_ok());
        assert!(DataTypeRule::new(TensorSlot::Output(0), DataType::Int8)
            .check(&g, &[deq], &mut ctx)
            .is_err());
        assert!(DataTypeRule::new(TensorSlot::Input(3), DataType::Int32)
            .check(&g, &[deq], &mut ctx)
            .is_err());
    }
}
