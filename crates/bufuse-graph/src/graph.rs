//! Compute graph consumed and annotated by the fusion engine.
//!
//! The graph is a DAG where nodes are operator instances and edges are the
//! tensors flowing between them. The fusion engine reads structure and tensor
//! metadata, and writes only node attributes.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::attr::AttrValue;
use crate::error::GraphError;
use crate::types::{OpKind, TensorDesc};

/// Stable operator id; also the tie-breaker for deterministic ordering.
#[derive(
    Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct NodeId(pub u32);

/// Tensor id.
#[derive(
    Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct EdgeId(pub u32);

/// A named tensor and its descriptor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TensorInfo {
    pub name: String,
    #[serde(flatten)]
    pub desc: TensorDesc,
}

/// One operator instance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: NodeId,
    pub name: String,
    /// Concrete operator type, e.g. `"Conv2D"` or `"LeakyRelu"`.
    pub op_type: String,
    /// Fusion category the pattern matcher keys on.
    pub kind: OpKind,
    /// Input tensors in operand-slot order.
    pub inputs: Vec<EdgeId>,
    /// Output tensors in result-slot order.
    pub outputs: Vec<EdgeId>,
    /// Operator parameters plus the annotations fusion writes back
    /// (`fusion_scope`, `_op_slice_info`).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attrs: BTreeMap<String, AttrValue>,
}

impl GraphNode {
    pub fn attr(&self, key: &str) -> Option<&AttrValue> {
        self.attrs.get(key)
    }

    pub fn set_attr(&mut self, key: impl Into<String>, value: impl Into<AttrValue>) {
        self.attrs.insert(key.into(), value.into());
    }

    pub fn ints_attr(&self, key: &str) -> Option<&[i64]> {
        self.attr(key).and_then(AttrValue::as_ints)
    }

    pub fn int_attr(&self, key: &str) -> Option<i64> {
        self.attr(key).and_then(AttrValue::as_int)
    }

    pub fn str_attr(&self, key: &str) -> Option<&str> {
        self.attr(key).and_then(AttrValue::as_str)
    }
}

/// A computation graph.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ComputeGraph {
    pub nodes: Vec<GraphNode>,
    /// Tensors by id.
    pub edges: BTreeMap<EdgeId, TensorInfo>,
    /// Graph-level input edge ids.
    #[serde(default)]
    pub inputs: Vec<EdgeId>,
    /// Graph-level output edge ids.
    #[serde(default)]
    pub outputs: Vec<EdgeId>,
    #[serde(skip)]
    next_node_id: u32,
    #[serde(skip)]
    next_edge_id: u32,
}

impl ComputeGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and validate a graph from its JSON form.
    ///
    /// Id allocation resumes after the highest loaded id, so a graph already
    /// using `u32::MAX` as a node or edge id is refused.
    pub fn from_json(text: &str) -> Result<Self, GraphError> {
        let mut graph: ComputeGraph = serde_json::from_str(text)?;
        graph.next_node_id = next_id(graph.nodes.iter().map(|n| n.id.0), "node")?;
        graph.next_edge_id = next_id(graph.edges.keys().map(|e| e.0), "edge")?;
        graph.validate()?;
        Ok(graph)
    }

    /// Serialize the graph, attributes included.
    pub fn to_json_pretty(&self) -> Result<String, GraphError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Check node ids, edge references, single producers and acyclicity.
    pub fn validate(&self) -> Result<(), GraphError> {
        let mut ids = BTreeSet::new();
        let mut producers: BTreeMap<EdgeId, &str> = BTreeMap::new();
        for node in &self.nodes {
            if !ids.insert(node.id) {
                return Err(GraphError::DuplicateNode(node.id));
            }
            for e in node.inputs.iter().chain(node.outputs.iter()) {
                if !self.edges.contains_key(e) {
                    return Err(GraphError::UnknownEdge(*e));
                }
            }
            for &out in &node.outputs {
                if let Some(existing) = producers.insert(out, &node.name) {
                    return Err(GraphError::DuplicateProducer {
                        edge: out,
                        producer: existing.to_string(),
                    });
                }
            }
        }
        self.topological_order().map(|_| ())
    }

    /// Register a tensor under a fresh id.
    ///
    /// # Panics
    ///
    /// Panics if every edge id up to `u32::MAX` has been handed out.
    pub fn add_edge(&mut self, info: TensorInfo) -> EdgeId {
        let id = EdgeId(self.next_edge_id);
        self.next_edge_id = self
            .next_edge_id
            .checked_add(1)
            .unwrap_or_else(|| panic!("edge id space exhausted at {id:?}"));
        self.edges.insert(id, info);
        id
    }

    /// Shorthand for [`add_edge`](Self::add_edge).
    pub fn add_tensor(&mut self, name: impl Into<String>, desc: TensorDesc) -> EdgeId {
        self.add_edge(TensorInfo {
            name: name.into(),
            desc,
        })
    }

    /// Register an operator. Its tensors must already exist and none of its
    /// outputs may have another producer.
    pub fn add_node(
        &mut self,
        op_type: impl Into<String>,
        kind: OpKind,
        inputs: Vec<EdgeId>,
        outputs: Vec<EdgeId>,
        name: impl Into<String>,
    ) -> Result<NodeId, GraphError> {
        for &e in inputs.iter().chain(outputs.iter()) {
            if !self.edges.contains_key(&e) {
                return Err(GraphError::UnknownEdge(e));
            }
        }
        for &out in &outputs {
            if let Some(existing) = self.edge_producer(out) {
                return Err(GraphError::DuplicateProducer {
                    edge: out,
                    producer: existing.name.clone(),
                });
            }
        }

        let id = NodeId(self.next_node_id);
        self.next_node_id = self
            .next_node_id
            .checked_add(1)
            .ok_or(GraphError::IdSpaceExhausted("node"))?;
        self.nodes.push(GraphNode {
            id,
            name: name.into(),
            op_type: op_type.into(),
            kind,
            inputs,
            outputs,
            attrs: BTreeMap::new(),
        });
        Ok(id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn node(&self, id: NodeId) -> Option<&GraphNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut GraphNode> {
        self.nodes.iter_mut().find(|n| n.id == id)
    }

    pub fn edge(&self, id: EdgeId) -> Option<&TensorInfo> {
        self.edges.get(&id)
    }

    /// Descriptor of the tensor feeding input `slot` of a node.
    pub fn input_desc(&self, node: NodeId, slot: usize) -> Option<&TensorDesc> {
        let edge = *self.node(node)?.inputs.get(slot)?;
        self.edge(edge).map(|t| &t.desc)
    }

    /// Descriptor of the tensor produced on output `slot` of a node.
    pub fn output_desc(&self, node: NodeId, slot: usize) -> Option<&TensorDesc> {
        let edge = *self.node(node)?.outputs.get(slot)?;
        self.edge(edge).map(|t| &t.desc)
    }

    /// Returns node ids in topological order.
    ///
    /// The ordering is deterministic: among ready nodes, the one with the
    /// smaller [`NodeId`] is emitted first.
    pub fn topological_order(&self) -> Result<Vec<NodeId>, GraphError> {
        let mut edge_producer: BTreeMap<EdgeId, usize> = BTreeMap::new();
        for (i, node) in self.nodes.iter().enumerate() {
            for &out in &node.outputs {
                edge_producer.insert(out, i);
            }
        }

        let n = self.nodes.len();
        let mut in_degree = vec![0usize; n];
        let mut consumers: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (ci, node) in self.nodes.iter().enumerate() {
            for inp in &node.inputs {
                if let Some(&pi) = edge_producer.get(inp) {
                    in_degree[ci] += 1;
                    consumers[pi].push(ci);
                }
            }
        }

        let mut ready: BTreeSet<(NodeId, usize)> = BTreeSet::new();
        for (i, &deg) in in_degree.iter().enumerate() {
            if deg == 0 {
                ready.insert((self.nodes[i].id, i));
            }
        }

        let mut result = Vec::with_capacity(n);
        while let Some((id, idx)) = ready.pop_first() {
            result.push(id);
            for &ci in &consumers[idx] {
                in_degree[ci] -= 1;
                if in_degree[ci] == 0 {
                    ready.insert((self.nodes[ci].id, ci));
                }
            }
        }

        if result.len() != n {
            return Err(GraphError::Cycle {
                visited: result.len(),
                total: n,
            });
        }
        Ok(result)
    }

    /// Nodes reading `edge`, in storage order.
    pub fn edge_consumers(&self, edge: EdgeId) -> Vec<&GraphNode> {
        self.nodes
            .iter()
            .filter(|n| n.inputs.contains(&edge))
            .collect()
    }

    /// The node writing `edge`; `None` for graph inputs and constants.
    pub fn edge_producer(&self, edge: EdgeId) -> Option<&GraphNode> {
        self.nodes.iter().find(|n| n.outputs.contains(&edge))
    }

    /// Returns `true` if the edge is a graph-level output.
    pub fn is_graph_output(&self, edge: EdgeId) -> bool {
        self.outputs.contains(&edge)
    }

    /// Distinct consumer nodes of any output of `id`, ordered by id.
    pub fn successors(&self, id: NodeId) -> Vec<NodeId> {
        let Some(node) = self.node(id) else {
            return Vec::new();
        };
        let set: BTreeSet<NodeId> = node
            .outputs
            .iter()
            .flat_map(|&e| self.edge_consumers(e))
            .map(|n| n.id)
            .collect();
        set.into_iter().collect()
    }

    /// Distinct producer nodes of any input of `id`, ordered by id.
    pub fn predecessors(&self, id: NodeId) -> Vec<NodeId> {
        let Some(node) = self.node(id) else {
            return Vec::new();
        };
        let set: BTreeSet<NodeId> = node
            .inputs
            .iter()
            .filter_map(|&e| self.edge_producer(e))
            .map(|n| n.id)
            .collect();
        set.into_iter().collect()
    }

    /// Returns `true` if a directed path of at least one edge leads from
    /// `from` to `to`.
    pub fn has_path(&self, from: NodeId, to: NodeId) -> bool {
        let mut visited = BTreeSet::new();
        let mut queue: VecDeque<NodeId> = self.successors(from).into();
        while let Some(cur) = queue.pop_front() {
            if cur == to {
                return true;
            }
            if visited.insert(cur) {
                queue.extend(self.successors(cur));
            }
        }
        false
    }
}

/// One past the highest id in `ids`, or 0 for none.
fn next_id(ids: impl Iterator<Item = u32>, what: &'static str) -> Result<u32, GraphError> {
    match ids.max() {
        Some(max) => max
            .checked_add(1)
            .ok_or(GraphError::IdSpaceExhausted(what)),
        None => Ok(0),
    }
}
