//! Per-operator adjustments of the anchor's split maps.

use bufuse_graph::{ComputeGraph, GraphNode, OpKind};

use super::info::{AxisSplitMap, InputSplitInfo, OutputSplitInfo, CHANNEL_AXIS};
use super::layout::OperandCursor;

/// A split the fused kernel can no longer honour, keyed by the operand and
/// the leading axis of its cut.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SplitKey {
    Input { index: usize, axis: i64 },
    Output { index: usize, axis: i64 },
}

impl SplitKey {
    fn matches(self, map: &AxisSplitMap) -> bool {
        match self {
            Self::Input { index, axis } => map
                .inputs
                .iter()
                .any(|i| i.index == index && i.axis.first() == Some(&axis)),
            Self::Output { index, axis } => map
                .outputs
                .iter()
                .any(|o| o.index == index && o.axis.first() == Some(&axis)),
        }
    }
}

/// Remove every split map that uses `key`. Returns how many were removed.
pub fn delete_split_maps(maps: &mut Vec<AxisSplitMap>, key: SplitKey) -> usize {
    let before = maps.len();
    maps.retain(|m| !key.matches(m));
    before - maps.len()
}

/// Take the next input index and let it follow every channel split.
///
/// Used for per-channel operands such as dequant scales: the operand is cut
/// along axis 1 whenever the kernel's primary output is.
pub fn append_channel_input(maps: &mut [AxisSplitMap], cursor: &mut OperandCursor) -> usize {
    let idx = cursor.take_input();
    for map in maps.iter_mut().filter(|m| m.splits_channel()) {
        map.inputs
            .push(InputSplitInfo::unbounded(idx, vec![CHANNEL_AXIS]));
    }
    idx
}

/// A node of the fused set, with the slots that cross the set boundary.
#[derive(Clone, Debug)]
pub struct NodeOperands<'a> {
    pub graph: &'a ComputeGraph,
    pub node: &'a GraphNode,
    pub external_inputs: Vec<usize>,
    pub external_outputs: Vec<usize>,
}

impl NodeOperands<'_> {
    fn input_is_scalar(&self, slot: usize) -> bool {
        self.graph
            .input_desc(self.node.id, slot)
            .is_some_and(|d| d.is_scalar())
    }
}

/// How one operator family changes the split maps it joins.
///
/// The propagator first runs [`delete`](Self::delete) for every node, then
/// [`update_input`](Self::update_input) and
/// [`update_output`](Self::update_output) for every non-anchor node. Each
/// update must consume exactly one cursor index per external operand of its
/// node, whether or not it records a split for it.
pub trait SliceRule: Sync {
    fn name(&self) -> &'static str;

    fn delete(&self, _ops: &NodeOperands<'_>) -> Vec<SplitKey> {
        Vec::new()
    }

    fn update_input(
        &self,
        ops: &NodeOperands<'_>,
        cursor: &mut OperandCursor,
        _maps: &mut [AxisSplitMap],
    ) {
        for _ in &ops.external_inputs {
            cursor.take_input();
        }
    }

    fn update_output(
        &self,
        ops: &NodeOperands<'_>,
        cursor: &mut OperandCursor,
        _maps: &mut [AxisSplitMap],
    ) {
        for _ in &ops.external_outputs {
            cursor.take_output();
        }
    }
}

/// Strided writes cannot cut the H and W axes of the main input.
#[derive(Debug)]
struct StridedWriteRule;

impl SliceRule for StridedWriteRule {
    fn name(&self) -> &'static str {
        "strided-write"
    }

    fn delete(&self, _ops: &NodeOperands<'_>) -> Vec<SplitKey> {
        vec![
            SplitKey::Input { index: 0, axis: 2 },
            SplitKey::Input { index: 0, axis: 3 },
        ]
    }
}

/// Quantization re-blocks channels, so the weight channel split is lost.
#[derive(Debug)]
struct QuantRule;

impl SliceRule for QuantRule {
    fn name(&self) -> &'static str {
        "quant"
    }

    fn delete(&self, _ops: &NodeOperands<'_>) -> Vec<SplitKey> {
        vec![SplitKey::Input { index: 1, axis: 1 }]
    }
}

/// Dequant/requant family. Non-scalar operands in `scale_slots` are
/// per-channel and follow channel splits.
#[derive(Debug)]
struct ScaleRule {
    name: &'static str,
    scale_slots: &'static [usize],
}

impl SliceRule for ScaleRule {
    fn name(&self) -> &'static str {
        self.name
    }

    fn update_input(
        &self,
        ops: &NodeOperands<'_>,
        cursor: &mut OperandCursor,
        maps: &mut [AxisSplitMap],
    ) {
        for &slot in &ops.external_inputs {
            if self.scale_slots.contains(&slot) && !ops.input_is_scalar(slot) {
                append_channel_input(maps, cursor);
            } else {
                cursor.take_input();
            }
        }
    }
}

/// Elementwise operands are cut exactly like the primary output.
#[derive(Debug)]
struct ElemWiseRule;

impl SliceRule for ElemWiseRule {
    fn name(&self) -> &'static str {
        "elemwise"
    }

    fn update_input(
        &self,
        ops: &NodeOperands<'_>,
        cursor: &mut OperandCursor,
        maps: &mut [AxisSplitMap],
    ) {
        for &slot in &ops.external_inputs {
            let idx = cursor.take_input();
            if ops.input_is_scalar(slot) {
                continue;
            }
            for map in maps.iter_mut() {
                if let Some(axes) = map.primary_output_axes() {
                    let info = InputSplitInfo::new(idx, axes.to_vec());
                    map.inputs.push(info);
                }
            }
        }
    }
}

/// Broadcast operands carry only the channel axis of the output.
#[derive(Debug)]
struct BroadcastRule;

impl SliceRule for BroadcastRule {
    fn name(&self) -> &'static str {
        "broadcast"
    }

    fn update_input(
        &self,
        ops: &NodeOperands<'_>,
        cursor: &mut OperandCursor,
        maps: &mut [AxisSplitMap],
    ) {
        for &slot in &ops.external_inputs {
            let idx = cursor.take_input();
            if ops.input_is_scalar(slot) {
                continue;
            }
            for map in maps.iter_mut().filter(|m| m.splits_channel()) {
                map.inputs.push(InputSplitInfo::new(idx, vec![CHANNEL_AXIS]));
            }
        }
    }
}

/// Reductions over N, H and W: only the channel split survives, and every
/// reduced output follows it.
#[derive(Debug)]
struct CommReduceRule;

impl SliceRule for CommReduceRule {
    fn name(&self) -> &'static str {
        "comm-reduce"
    }

    fn delete(&self, _ops: &NodeOperands<'_>) -> Vec<SplitKey> {
        [0, 2, 3]
            .into_iter()
            .map(|axis| SplitKey::Input { index: 0, axis })
            .collect()
    }

    fn update_output(
        &self,
        ops: &NodeOperands<'_>,
        cursor: &mut OperandCursor,
        maps: &mut [AxisSplitMap],
    ) {
        for _ in &ops.external_outputs {
            let idx = cursor.take_output();
            for map in maps.iter_mut().filter(|m| m.splits_channel()) {
                if map.output(idx).is_none() {
                    map.outputs.push(OutputSplitInfo::new(idx, vec![CHANNEL_AXIS]));
                }
            }
        }
    }
}

static DEQUANT: ScaleRule = ScaleRule {
    name: "dequant",
    scale_slots: &[1],
};
static DEQUANT_S16: ScaleRule = ScaleRule {
    name: "dequant-s16",
    scale_slots: &[1, 2],
};

/// The slice rule registered for an operator kind, if any.
pub fn slice_rule_for(kind: OpKind) -> Option<&'static dyn SliceRule> {
    match kind {
        OpKind::Dequant | OpKind::Requant => Some(&DEQUANT),
        OpKind::DequantS16 | OpKind::RequantS16 => Some(&DEQUANT_S16),
        OpKind::Quant => Some(&QuantRule),
        OpKind::StridedWrite => Some(&StridedWriteRule),
        OpKind::ElemWise => Some(&ElemWiseRule),
        OpKind::Broadcast => Some(&BroadcastRule),
        OpKind::CommReduce => Some(&CommReduceRule),
        OpKind::Convolution
        | OpKind::DepthwiseConvolution
        | OpKind::MatMul
        | OpKind::Pool2d
        | OpKind::StridedRead
        | OpKind::ReadSelect
        | OpKind::WriteSelect
        | OpKind::Opaque => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bufuse_graph::{DataType, EdgeId, Format, NodeId, TensorDesc};

    fn fmap() -> TensorDesc {
        TensorDesc::new(vec![1, 2, 8, 8, 16], Format::Nc1hwc0, DataType::Float16)
    }

    fn channel_map() -> AxisSplitMap {
        AxisSplitMap::new()
            .with_input(InputSplitInfo::unbounded(1, vec![1]))
            .with_output(OutputSplitInfo::new(0, vec![1]))
    }

    fn batch_map() -> AxisSplitMap {
        AxisSplitMap::new()
            .with_input(InputSplitInfo::unbounded(0, vec![0]))
            .with_output(OutputSplitInfo::new(0, vec![0]))
    }

    fn single_node(kind: OpKind, op: &str, inputs: &[TensorDesc]) -> (ComputeGraph, NodeId) {
        let mut g = ComputeGraph::new();
        let ins: Vec<EdgeId> = inputs
            .iter()
            .enumerate()
            .map(|(i, d)| g.add_tensor(format!("in{i}"), d.clone()))
            .collect();
        let out = g.add_tensor("out", fmap());
        let id = g.add_node(op, kind, ins, vec![out], "n").unwrap();
        (g, id)
    }

    fn operands<'a>(g: &'a ComputeGraph, id: NodeId, inputs: Vec<usize>) -> NodeOperands<'a> {
        NodeOperands {
            graph: g,
            node: g.node(id).unwrap(),
            external_inputs: inputs,
            external_outputs: vec![],
        }
    }

    #[test]
    fn delete_removes_whole_maps() {
        let mut maps = vec![channel_map(), batch_map()];
        let removed = delete_split_maps(&mut maps, SplitKey::Input { index: 1, axis: 1 });
        assert_eq!(removed, 1);
        assert_eq!(maps, vec![batch_map()]);
    }

    #[test]
    fn append_channel_input_only_on_channel_maps() {
        let mut maps = vec![batch_map(), channel_map()];
        let mut cursor = OperandCursor::new(2, 0);
        let idx = append_channel_input(&mut maps, &mut cursor);
        assert_eq!(idx, 2);
        assert_eq!(cursor.next_input(), 3);
        assert!(maps[0].input(2).is_none());
        let added = maps[1].input(2).unwrap();
        assert_eq!(added.axis, vec![1]);
        assert_eq!(added.head_overlap, vec![-1]);
        assert_eq!(added.tail_overlap, vec![-1]);
    }

    #[test]
    fn scalar_scale_consumes_index_without_entry() {
        let scalar = TensorDesc::new(vec![1], Format::Nd, DataType::Float16);
        let (g, id) = single_node(OpKind::Dequant, "AscendDequant", &[fmap(), scalar]);
        let mut maps = vec![channel_map()];
        let mut cursor = OperandCursor::new(2, 0);
        DEQUANT.update_input(&operands(&g, id, vec![1]), &mut cursor, &mut maps);
        assert_eq!(cursor.next_input(), 3);
        assert!(maps[0].input(2).is_none());
    }

    #[test]
    fn s16_dequant_adds_two_channel_inputs() {
        let per_channel = TensorDesc::new(vec![1, 2, 1, 1, 16], Format::Nc1hwc0, DataType::Float16);
        let (g, id) = single_node(
            OpKind::DequantS16,
            "AscendDequantS16",
            &[fmap(), per_channel.clone(), per_channel],
        );
        let mut maps = vec![channel_map()];
        let mut cursor = OperandCursor::new(2, 0);
        slice_rule_for(OpKind::DequantS16)
            .unwrap()
            .update_input(&operands(&g, id, vec![1, 2]), &mut cursor, &mut maps);
        assert_eq!(cursor.next_input(), 4);
        assert!(maps[0].input(2).is_some());
        assert!(maps[0].input(3).is_some());
    }

    #[test]
    fn elemwise_mirrors_output_axes() {
        let (g, id) = single_node(OpKind::ElemWise, "Add", &[fmap(), fmap()]);
        let mut maps = vec![batch_map(), channel_map()];
        let mut cursor = OperandCursor::new(2, 0);
        ElemWiseRule.update_input(&operands(&g, id, vec![1]), &mut cursor, &mut maps);
        assert_eq!(maps[0].input(2).unwrap().axis, vec![0]);
        assert_eq!(maps[1].input(2).unwrap().axis, vec![1]);
        assert_eq!(maps[1].input(2).unwrap().head_overlap, vec![0]);
    }

    #[test]
    fn reduce_outputs_follow_channel_split() {
        let (g, id) = single_node(OpKind::CommReduce, "BNTrainingReduce", &[fmap()]);
        let mut maps = vec![channel_map(), batch_map()];
        let ops = NodeOperands {
            external_outputs: vec![0, 1],
            ..operands(&g, id, vec![])
        };
        for key in CommReduceRule.delete(&ops) {
            delete_split_maps(&mut maps, key);
        }
        assert_eq!(maps, vec![channel_map()]);

        let mut cursor = OperandCursor::new(1, 1);
        CommReduceRule.update_output(&ops, &mut cursor, &mut maps);
        assert_eq!(cursor.next_output(), 3);
        assert_eq!(maps[0].output(1).unwrap().axis, vec![1]);
        assert_eq!(maps[0].output(2).unwrap().axis, vec![1]);
    }

    #[test]
    fn default_updates_still_consume_indices() {
        let (g, id) = single_node(OpKind::Quant, "AscendQuant", &[fmap(), fmap()]);
        let ops = NodeOperands {
            external_outputs: vec![0],
            ..operands(&g, id, vec![1])
        };
        let mut cursor = OperandCursor::new(0, 0);
        let mut maps: Vec<AxisSplitMap> = vec![];
        QuantRule.update_input(&ops, &mut cursor, &mut maps);
        QuantRule.update_output(&ops, &mut cursor, &mut maps);
        assert_eq!(cursor, OperandCursor::new(1, 1));
    }

    #[test]
    fn anchors_have_no_rule() {
        assert!(slice_rule_for(OpKind::Convolution).is_none());
        assert!(slice_rule_for(OpKind::Opaque).is_none());
        assert_eq!(slice_rule_for(OpKind::Requant).unwrap().name(), "dequant");
    }
}
