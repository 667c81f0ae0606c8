use bufuse_fusion::slice::{AxisSplitMap, InputSplitInfo, OpCalcInfo, OutputSplitInfo};
use bufuse_fusion::OP_SLICE_INFO_ATTR;
use bufuse_graph::{ComputeGraph, DataType, EdgeId, Format, NodeId, OpKind, TensorDesc};

/// NC1HWC0 feature map with `c1` channel blocks.
#[allow(dead_code)]
pub fn fmap(c1: i64, dtype: DataType) -> TensorDesc {
    TensorDesc::new(vec![1, c1, 8, 8, 16], Format::Nc1hwc0, dtype)
}

/// Builds small graphs node by node; every node has one output unless
/// [`op_multi`](Self::op_multi) is used.
#[derive(Default)]
pub struct GraphBuilder {
    pub graph: ComputeGraph,
}

#[allow(dead_code)]
impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn input(&mut self, name: &str, desc: TensorDesc) -> EdgeId {
        let e = self.graph.add_tensor(name, desc);
        self.graph.inputs.push(e);
        e
    }

    pub fn op(
        &mut self,
        op_type: &str,
        kind: OpKind,
        inputs: &[EdgeId],
        out: TensorDesc,
        name: &str,
    ) -> (NodeId, EdgeId) {
        let (id, outs) = self.op_multi(op_type, kind, inputs, &[out], name);
        (id, outs[0])
    }

    pub fn op_multi(
        &mut self,
        op_type: &str,
        kind: OpKind,
        inputs: &[EdgeId],
        outs: &[TensorDesc],
        name: &str,
    ) -> (NodeId, Vec<EdgeId>) {
        let edges: Vec<EdgeId> = outs
            .iter()
            .enumerate()
            .map(|(i, d)| self.graph.add_tensor(format!("{name}:{i}"), d.clone()))
            .collect();
        let id = self
            .graph
            .add_node(op_type, kind, inputs.to_vec(), edges.clone(), name)
            .expect("node references unknown edges");
        (id, edges)
    }

    pub fn output(&mut self, edge: EdgeId) {
        self.graph.outputs.push(edge);
    }

    pub fn slice_info(&mut self, node: NodeId, info: &OpCalcInfo) {
        let text = info.to_json().expect("slice info encodes");
        self.graph
            .node_mut(node)
            .expect("node exists")
            .set_attr(OP_SLICE_INFO_ATTR, text);
    }

    pub fn finish(self) -> ComputeGraph {
        self.graph
    }
}

/// Typical convolution slice info: batch split, overlapped H split and an
/// output-channel split carried by the weight.
#[allow(dead_code)]
pub fn conv_slice_info() -> OpCalcInfo {
    OpCalcInfo::new(vec![
        AxisSplitMap::new()
            .with_input(InputSplitInfo::unbounded(0, vec![0]))
            .with_output(OutputSplitInfo::new(0, vec![0])),
        AxisSplitMap::new()
            .with_input(InputSplitInfo::new(0, vec![2]).with_overlap(1, 1))
            .with_output(OutputSplitInfo::new(0, vec![2])),
        AxisSplitMap::new()
            .with_input(InputSplitInfo::unbounded(1, vec![1]))
            .with_output(OutputSplitInfo::new(0, vec![1])),
    ])
}

/// `conv(x, w) -> dequant(c, scale) -> relu -> quant`, slice info on the conv.
/// Returns the graph and the four nodes in chain order.
#[allow(dead_code)]
pub fn quant_chain() -> (ComputeGraph, Vec<NodeId>) {
    let mut b = GraphBuilder::new();
    let x = b.input("x", fmap(2, DataType::Int8));
    let w = b.input(
        "w",
        TensorDesc::new(vec![8, 2, 16, 32], Format::FractalZ, DataType::Int8),
    );
    let scale = b.input("scale", fmap(2, DataType::Float16));
    let (conv, c) = b.op("Conv2D", OpKind::Convolution, &[x, w], fmap(2, DataType::Int32), "conv");
    let (deq, d) = b.op(
        "AscendDequant",
        OpKind::Dequant,
        &[c, scale],
        fmap(2, DataType::Float16),
        "deq",
    );
    let (relu, r) = b.op("Relu", OpKind::ElemWise, &[d], fmap(2, DataType::Float16), "relu");
    let (quant, q) = b.op("AscendQuant", OpKind::Quant, &[r], fmap(2, DataType::Int8), "quant");
    b.output(q);
    b.slice_info(conv, &conv_slice_info());
    (b.finish(), vec![conv, deq, relu, quant])
}
