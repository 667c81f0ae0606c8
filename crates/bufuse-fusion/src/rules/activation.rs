use bufuse_graph::{ComputeGraph, NodeId};

use super::{Rejection, RuleContext, ValidityRule};

/// Only listed operator types may follow a producer inside a fused chain.
#[derive(Debug)]
pub struct ActivationAllowList {
    allowed: Vec<String>,
}

impl ActivationAllowList {
    pub fn new(allowed: Vec<String>) -> Self {
        Self { allowed }
    }

    pub fn allows(&self, op_type: &str) -> bool {
        self.allowed.iter().any(|a| a == op_type)
    }
}

impl ValidityRule for ActivationAllowList {
    fn name(&self) -> &'static str {
        "activation-allow-list"
    }

    fn check(
        &self,
        graph: &ComputeGraph,
        nodes: &[NodeId],
        _ctx: &mut RuleContext,
    ) -> Result<(), Rejection> {
        for &id in nodes {
            let Some(node) = graph.node(id) else {
                return Err(Rejection::new(self.name(), format!("node {id:?} missing")));
            };
            if !self.allows(&node.op_type) {
                return Err(Rejection::new(
                    self.name(),
                    format!(
                        "op type '{}' of node '{}' is not allowed",
                        node.op_type, node.name
                    ),
                ));
            }
        }
        Ok(())
    }
}

/// Decides whether an elementwise node's auxiliary inputs fold into a
/// vector-scalar micro-op or must stay full tensor arguments.
///
/// `Mul`, `Sub`, `Div` and `RealDiv` are only fusable with a scalar operand.
/// `Add` takes either a scalar or a tensor shaped like its primary input.
/// Scalar operands are recorded in [`RuleContext::folded_scalars`].
#[derive(Debug)]
pub struct ScalarOperandRule;

impl ScalarOperandRule {
    const SCALAR_ONLY: [&'static str; 4] = ["Mul", "Sub", "Div", "RealDiv"];
}

impl ValidityRule for ScalarOperandRule {
    fn name(&self) -> &'static str {
        "scalar-operand"
    }

    fn check(
        &self,
        graph: &ComputeGraph,
        nodes: &[NodeId],
        ctx: &mut RuleContext,
    ) -> Result<(), Rejection> {
        for &id in nodes {
            let Some(node) = graph.node(id) else {
                continue;
            };
            let scalar_only = Self::SCALAR_ONLY.contains(&node.op_type.as_str());
            if !scalar_only && node.op_type != "Add" {
                continue;
            }
            let Some(primary) = graph.input_desc(id, 0) else {
                continue;
            };

            let mut folded = false;
            for slot in 1..node.inputs.len() {
                let Some(aux) = graph.input_desc(id, slot) else {
                    continue;
                };
                if aux.is_scalar() {
                    folded = true;
                } else if scalar_only || aux.shape != primary.shape {
                    return Err(Rejection::new(
                        self.name(),
                        format!(
                            "input {slot} of '{}' ({}) has shape {:?}, which cannot be folded",
                            node.name, node.op_type, aux.shape
                        ),
                    ));
                }
            }
            if folded {
                ctx.folded_scalars.insert(id);
            }
        }
        Ok(())
    }
}
