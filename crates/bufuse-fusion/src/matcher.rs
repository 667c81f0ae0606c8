//! Pattern matching against a compute graph.
//!
//! Matching starts from the pattern's anchor head and grows the binding along
//! pattern edges: forward through real consumers, and backward through real
//! producers for roles that are still unbound. The search is deterministic
//! and yields at most one [`Mapping`] per call.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use bufuse_graph::{ComputeGraph, GraphNode, NodeId};

use crate::pattern::{OpDesc, Pattern, PatternEdge, TypeFilter};

/// Attribute marking a node as already folded into a fused kernel.
pub const FUSION_SCOPE_ATTR: &str = "fusion_scope";

/// Operand role → bound graph nodes, in pattern declaration order.
///
/// Every role of the pattern is present; optional roles that matched
/// nothing hold an empty list.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Mapping {
    entries: Vec<(String, Vec<NodeId>)>,
}

impl Mapping {
    /// Nodes bound to `name`; empty for unknown or unmatched roles.
    pub fn nodes(&self, name: &str) -> &[NodeId] {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, nodes)| nodes.as_slice())
            .unwrap_or(&[])
    }

    /// Returns `true` if the role is part of the mapping, matched or not.
    pub fn contains_role(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| n == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[NodeId])> {
        self.entries
            .iter()
            .map(|(n, nodes)| (n.as_str(), nodes.as_slice()))
    }

    /// Unbind a node; the role stays in the mapping.
    pub fn remove_node(&mut self, node: NodeId) -> bool {
        for (_, nodes) in &mut self.entries {
            if let Some(pos) = nodes.iter().position(|&n| n == node) {
                nodes.remove(pos);
                return true;
            }
        }
        false
    }

    /// Total number of bound nodes.
    pub fn node_count(&self) -> usize {
        self.entries.iter().map(|(_, nodes)| nodes.len()).sum()
    }
}

/// Returns `true` if the node already belongs to a fused kernel.
pub fn is_fused(node: &GraphNode) -> bool {
    node.attr(FUSION_SCOPE_ATTR).is_some()
}

/// Match `pattern` against `graph`.
pub fn match_pattern(graph: &ComputeGraph, pattern: &Pattern) -> Option<Mapping> {
    match_pattern_excluding(graph, pattern, &BTreeSet::new())
}

/// Match `pattern` against `graph`, never binding a node in `skip` to a
/// typed role.
///
/// Anchor candidates are visited in topological order; the first candidate
/// whose grown binding satisfies every role's `[min, max]` wins.
pub fn match_pattern_excluding(
    graph: &ComputeGraph,
    pattern: &Pattern,
    skip: &BTreeSet<NodeId>,
) -> Option<Mapping> {
    let order = match graph.topological_order() {
        Ok(order) => order,
        Err(err) => {
            log::warn!("pattern '{}' not matched: {err}", pattern.name());
            return None;
        }
    };

    let head = pattern.anchor_head();
    let head_idx = pattern
        .descs()
        .iter()
        .position(|d| d.name == head.name)?;

    for id in order {
        let Some(node) = graph.node(id) else {
            continue;
        };
        if skip.contains(&id) || is_fused(node) || !head.filter.accepts(node.kind) {
            continue;
        }

        let mut state = MatchState::new(graph, pattern, skip);
        state.bind(head_idx, id);
        state.expand();
        if state.within_bounds() {
            return Some(state.into_mapping());
        }
    }
    None
}

struct MatchState<'g> {
    graph: &'g ComputeGraph,
    pattern: &'g Pattern,
    skip: &'g BTreeSet<NodeId>,
    bound: Vec<Vec<NodeId>>,
    owner: BTreeMap<NodeId, usize>,
    queue: VecDeque<(usize, NodeId)>,
}

impl<'g> MatchState<'g> {
    fn new(graph: &'g ComputeGraph, pattern: &'g Pattern, skip: &'g BTreeSet<NodeId>) -> Self {
        Self {
            graph,
            pattern,
            skip,
            bound: vec![Vec::new(); pattern.descs().len()],
            owner: BTreeMap::new(),
            queue: VecDeque::new(),
        }
    }

    fn desc(&self, idx: usize) -> &'g OpDesc {
        &self.pattern.descs()[idx]
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        self.pattern.descs().iter().position(|d| d.name == name)
    }

    fn bind(&mut self, idx: usize, node: NodeId) {
        self.bound[idx].push(node);
        self.owner.insert(node, idx);
        if !self.desc(idx).filter.is_any_input() {
            self.queue.push_back((idx, node));
        }
    }

    fn has_room(&self, idx: usize, pending: usize) -> bool {
        self.bound[idx].len() + pending < self.desc(idx).max
    }

    /// Whether an unbound node may be bound to a typed role.
    fn eligible(&self, desc: &OpDesc, node: NodeId) -> bool {
        if self.owner.contains_key(&node) || self.skip.contains(&node) {
            return false;
        }
        match self.graph.node(node) {
            Some(n) => !is_fused(n) && desc.filter.accepts(n.kind),
            None => false,
        }
    }

    /// First typed consumer role of `edge` able to take `node`, given the
    /// bindings already planned for this edge.
    fn claim(&self, edge: &PatternEdge, node: NodeId, planned: &[(usize, NodeId)]) -> Option<usize> {
        edge.consumers.iter().find_map(|name| {
            let idx = self.index_of(name)?;
            let desc = self.desc(idx);
            if desc.filter.is_any_input() || !self.eligible(desc, node) {
                return None;
            }
            let pending = planned.iter().filter(|(i, _)| *i == idx).count();
            self.has_room(idx, pending).then_some(idx)
        })
    }

    /// Whether `succ` is already bound to one of the edge's consumer roles.
    fn bound_to_edge(&self, edge: &PatternEdge, succ: NodeId) -> bool {
        self.owner
            .get(&succ)
            .is_some_and(|&idx| edge.consumers.contains(&self.desc(idx).name))
    }

    fn forward(&mut self, idx: usize, node: NodeId) {
        let pattern = self.pattern;
        let Some(edge) = pattern.outputs_of(&self.desc(idx).name) else {
            return;
        };
        let succs = self.graph.successors(node);
        if !edge.branch.admits(succs.len()) {
            return;
        }

        let mut planned: Vec<(usize, NodeId)> = Vec::new();
        for &succ in &succs {
            if self.bound_to_edge(edge, succ) {
                continue;
            }
            match self.claim(edge, succ, &planned) {
                Some(target) => planned.push((target, succ)),
                None if edge.strict => return,
                None => {}
            }
        }
        for (target, succ) in planned {
            self.bind(target, succ);
        }
    }

    /// Strict edges require every consumer of a backward candidate to be
    /// bound to, or claimable by, the edge's consumer roles.
    fn strict_ok(&self, edge: &PatternEdge, candidate: NodeId) -> bool {
        !edge.strict
            || self
                .graph
                .successors(candidate)
                .into_iter()
                .all(|s| self.bound_to_edge(edge, s) || self.claim(edge, s, &[]).is_some())
    }

    /// A backward candidate for a typed role must be fed by the nodes bound
    /// to the role's typed producers, if any are bound yet.
    fn fed_by_bound_producers(&self, desc: &OpDesc, candidate: NodeId) -> bool {
        let producers: Vec<NodeId> = self
            .pattern
            .edges_into(&desc.name)
            .filter_map(|e| self.index_of(&e.producer))
            .filter(|&i| !self.desc(i).filter.is_any_input())
            .flat_map(|i| self.bound[i].iter().copied())
            .collect();
        producers.is_empty()
            || self
                .graph
                .predecessors(candidate)
                .iter()
                .any(|p| producers.contains(p))
    }

    /// Bind producers of already-bound roles to roles that are still empty.
    /// Returns `true` if anything was bound.
    fn backward(&mut self) -> bool {
        let pattern = self.pattern;
        let mut changed = false;
        for (idx, desc) in pattern.descs().iter().enumerate() {
            if !self.bound[idx].is_empty() {
                continue;
            }
            let Some(edge) = pattern.outputs_of(&desc.name) else {
                continue;
            };

            let mut targets: Vec<NodeId> = Vec::new();
            for consumer in &edge.consumers {
                if let Some(c) = self.index_of(consumer) {
                    targets.extend(self.bound[c].iter().copied());
                }
            }

            for target in targets {
                for pred in self.graph.predecessors(target) {
                    if !self.has_room(idx, 0) {
                        break;
                    }
                    let ok = match &desc.filter {
                        TypeFilter::AnyInput => !self.owner.contains_key(&pred),
                        TypeFilter::Kinds(_) => {
                            self.eligible(desc, pred)
                                && edge.branch.admits(self.graph.successors(pred).len())
                                && self.strict_ok(edge, pred)
                                && self.fed_by_bound_producers(desc, pred)
                        }
                    };
                    if ok {
                        self.bind(idx, pred);
                        changed = true;
                    }
                }
            }
        }
        changed
    }

    fn expand(&mut self) {
        loop {
            while let Some((idx, node)) = self.queue.pop_front() {
                self.forward(idx, node);
            }
            if !self.backward() {
                break;
            }
        }
    }

    fn within_bounds(&self) -> bool {
        self.pattern
            .descs()
            .iter()
            .zip(&self.bound)
            .all(|(d, nodes)| nodes.len() >= d.min && nodes.len() <= d.max)
    }

    fn into_mapping(self) -> Mapping {
        Mapping {
            entries: self
                .pattern
                .descs()
                .iter()
                .map(|d| d.name.clone())
                .zip(self.bound)
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::{BranchMode, PatternBuilder};
    use bufuse_graph::{DataType, EdgeId, Format, OpKind, TensorDesc};

    fn desc() -> TensorDesc {
        TensorDesc::new(vec![1, 1, 8, 8, 16], Format::Nc1hwc0, DataType::Float16)
    }

    fn node(g: &mut ComputeGraph, op: &str, kind: OpKind, inputs: Vec<EdgeId>, name: &str) -> (NodeId, EdgeId) {
        let out = g.add_tensor(format!("{name}_out"), desc());
        let id = g.add_node(op, kind, inputs, vec![out], name).unwrap();
        (id, out)
    }

    fn conv_chain_pattern() -> Pattern {
        PatternBuilder::new("conv_chain")
            .add_op("conv", TypeFilter::kinds(&[OpKind::Convolution]), 1, 1)
            .add_op("eltwise", TypeFilter::kinds(&[OpKind::ElemWise]), 0, 2)
            .add_op("quant", TypeFilter::kinds(&[OpKind::Quant]), 0, 1)
            .set_outputs("conv", &["eltwise", "quant"], BranchMode::Single, false)
            .set_outputs("eltwise", &["eltwise", "quant"], BranchMode::Single, false)
            .set_head(&["conv"])
            .build()
            .unwrap()
    }

    #[test]
    fn chain_binds_up_to_max() {
        let mut g = ComputeGraph::new();
        let x = g.add_tensor("x", desc());
        let (conv, c) = node(&mut g, "Conv2D", OpKind::Convolution, vec![x], "conv");
        let (r1, e1) = node(&mut g, "Relu", OpKind::ElemWise, vec![c], "r1");
        let (r2, e2) = node(&mut g, "Relu", OpKind::ElemWise, vec![e1], "r2");
        let (_r3, e3) = node(&mut g, "Relu", OpKind::ElemWise, vec![e2], "r3");
        let (_q, _) = node(&mut g, "AscendQuant", OpKind::Quant, vec![e3], "q");

        let m = match_pattern(&g, &conv_chain_pattern()).unwrap();
        assert_eq!(m.nodes("conv"), &[conv]);
        assert_eq!(m.nodes("eltwise"), &[r1, r2]);
        // r3 is not bound, so the quant after it is unreachable.
        assert!(m.nodes("quant").is_empty());
        assert!(m.contains_role("quant"));
    }

    #[test]
    fn single_branch_blocks_fan_out() {
        let mut g = ComputeGraph::new();
        let x = g.add_tensor("x", desc());
        let (_conv, c) = node(&mut g, "Conv2D", OpKind::Convolution, vec![x], "conv");
        node(&mut g, "Relu", OpKind::ElemWise, vec![c], "r1");
        node(&mut g, "Relu", OpKind::ElemWise, vec![c], "r2");

        let m = match_pattern(&g, &conv_chain_pattern()).unwrap();
        assert!(m.nodes("eltwise").is_empty());
    }

    #[test]
    fn strict_edge_requires_all_consumers_claimed() {
        let pattern = PatternBuilder::new("strict")
            .add_op("conv", TypeFilter::kinds(&[OpKind::Convolution]), 1, 1)
            .add_op("relu", TypeFilter::kinds(&[OpKind::ElemWise]), 0, 1)
            .set_outputs("conv", &["relu"], BranchMode::None, true)
            .set_head(&["conv"])
            .build()
            .unwrap();

        let mut g = ComputeGraph::new();
        let x = g.add_tensor("x", desc());
        let (_conv, c) = node(&mut g, "Conv2D", OpKind::Convolution, vec![x], "conv");
        node(&mut g, "Relu", OpKind::ElemWise, vec![c], "relu");
        node(&mut g, "MaxPool", OpKind::Pool2d, vec![c], "pool");

        let m = match_pattern(&g, &pattern).unwrap();
        assert!(m.nodes("relu").is_empty());
    }

    #[test]
    fn backward_fills_typed_and_input_roles() {
        let pattern = PatternBuilder::new("two_conv_add")
            .add_op("conv_a", TypeFilter::kinds(&[OpKind::Convolution]), 1, 1)
            .add_op("conv_b", TypeFilter::kinds(&[OpKind::Convolution]), 0, 1)
            .add_op("add", TypeFilter::kinds(&[OpKind::ElemWise]), 1, 1)
            .add_op("other", TypeFilter::AnyInput, 0, 1)
            .set_outputs("conv_a", &["add"], BranchMode::Single, false)
            .set_outputs("conv_b", &["add"], BranchMode::Single, false)
            .set_outputs("other", &["add"], BranchMode::None, false)
            .set_head(&["conv_a", "conv_b", "other"])
            .build()
            .unwrap();

        let mut g = ComputeGraph::new();
        let x = g.add_tensor("x", desc());
        let (pre, p) = node(&mut g, "Cast", OpKind::Opaque, vec![x], "pre");
        let (a, ea) = node(&mut g, "Conv2D", OpKind::Convolution, vec![x], "a");
        let (b, eb) = node(&mut g, "Conv2D", OpKind::Convolution, vec![x], "b");
        let (add, _) = node(&mut g, "AddN", OpKind::ElemWise, vec![ea, eb, p], "add");

        let m = match_pattern(&g, &pattern).unwrap();
        assert_eq!(m.nodes("conv_a"), &[a]);
        assert_eq!(m.nodes("add"), &[add]);
        assert_eq!(m.nodes("conv_b"), &[b]);
        assert_eq!(m.nodes("other"), &[pre]);
        assert_eq!(m.node_count(), 4);
    }

    #[test]
    fn backward_fill_respects_bound_producers() {
        let pattern = PatternBuilder::new("branches")
            .add_op("conv_a", TypeFilter::kinds(&[OpKind::Convolution]), 1, 1)
            .add_op("deq_a", TypeFilter::kinds(&[OpKind::Dequant]), 0, 1)
            .add_op("conv_b", TypeFilter::kinds(&[OpKind::Convolution]), 0, 1)
            .add_op("deq_b", TypeFilter::kinds(&[OpKind::Dequant]), 0, 1)
            .add_op("add", TypeFilter::kinds(&[OpKind::ElemWise]), 1, 1)
            .set_outputs("conv_a", &["deq_a", "add"], BranchMode::None, false)
            .set_outputs("deq_a", &["add"], BranchMode::None, false)
            .set_outputs("conv_b", &["deq_b", "add"], BranchMode::None, false)
            .set_outputs("deq_b", &["add"], BranchMode::None, false)
            .set_head(&["conv_a", "conv_b"])
            .build()
            .unwrap();

        let mut g = ComputeGraph::new();
        let x = g.add_tensor("x", desc());
        let (a, ea) = node(&mut g, "Conv2D", OpKind::Convolution, vec![x], "a");
        let (b, eb) = node(&mut g, "Conv2D", OpKind::Convolution, vec![x], "b");
        let (deq, ed) = node(&mut g, "AscendDequant", OpKind::Dequant, vec![eb], "deq");
        node(&mut g, "Add", OpKind::ElemWise, vec![ea, ed], "add");

        // `deq` is fed by `b`, so it cannot fill `deq_a` behind `a`.
        let m = match_pattern(&g, &pattern).unwrap();
        assert_eq!(m.nodes("conv_a"), &[a]);
        assert!(m.nodes("deq_a").is_empty());
        assert_eq!(m.nodes("deq_b"), &[deq]);
        assert_eq!(m.nodes("conv_b"), &[b]);
    }

    #[test]
    fn fused_and_skipped_nodes_are_not_anchors() {
        let mut g = ComputeGraph::new();
        let x = g.add_tensor("x", desc());
        let (c1, e1) = node(&mut g, "Conv2D", OpKind::Convolution, vec![x], "c1");
        let (c2, _) = node(&mut g, "Conv2D", OpKind::Convolution, vec![e1], "c2");
        let pattern = conv_chain_pattern();

        assert_eq!(match_pattern(&g, &pattern).unwrap().nodes("conv"), &[c1]);

        let skip: BTreeSet<NodeId> = [c1].into();
        let m = match_pattern_excluding(&g, &pattern, &skip).unwrap();
        assert_eq!(m.nodes("conv"), &[c2]);

        g.node_mut(c2).unwrap().set_attr(FUSION_SCOPE_ATTR, 0_i64);
        assert!(match_pattern_excluding(&g, &pattern, &skip).is_none());
    }

    #[test]
    fn required_role_missing_tries_next_anchor() {
        let pattern = PatternBuilder::new("conv_quant")
            .add_op("conv", TypeFilter::kinds(&[OpKind::Convolution]), 1, 1)
            .add_op("quant", TypeFilter::kinds(&[OpKind::Quant]), 1, 1)
            .set_outputs("conv", &["quant"], BranchMode::None, false)
            .set_head(&["conv"])
            .build()
            .unwrap();

        let mut g = ComputeGraph::new();
        let x = g.add_tensor("x", desc());
        let (_c1, e1) = node(&mut g, "Conv2D", OpKind::Convolution, vec![x], "c1");
        let (c2, e2) = node(&mut g, "Conv2D", OpKind::Convolution, vec![e1], "c2");
        let (q, _) = node(&mut g, "AscendQuant", OpKind::Quant, vec![e2], "q");

        let m = match_pattern(&g, &pattern).unwrap();
        assert_eq!(m.nodes("conv"), &[c2]);
        assert_eq!(m.nodes("quant"), &[q]);
    }

    #[test]
    fn mapping_remove_keeps_role() {
        let mut m = Mapping {
            entries: vec![("a".into(), vec![NodeId(1)]), ("b".into(), vec![NodeId(2)])],
        };
        assert!(m.remove_node(NodeId(2)));
        assert!(!m.remove_node(NodeId(2)));
        assert!(m.contains_role("b"));
        assert!(m.nodes("b").is_empty());
        assert_eq!(m.iter().count(), 2);
    }
}
