//! Hardware legality predicates for fusion candidates.
//!
//! Each [`ValidityRule`] inspects a few representative nodes and either
//! accepts them or returns a [`Rejection`] explaining why the fusion attempt
//! is abandoned. Rules whose thresholds depend on values discovered by an
//! earlier rule read and write them through [`RuleContext`].

mod activation;
mod layout;
mod window;

pub use activation::{ActivationAllowList, ScalarOperandRule};
pub use layout::{DataTypeRule, FormatRule, TensorSlot};
pub use window::{PoolInputWidthRule, PoolWindowRule, StrideRule};

use std::collections::BTreeSet;
use std::fmt;

use bufuse_graph::{ComputeGraph, NodeId};

use crate::log_context::LogContext;

/// Why a fusion attempt was abandoned.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rejection {
    pub rule: &'static str,
    pub reason: String,
}

impl Rejection {
    pub fn new(rule: &'static str, reason: impl Into<String>) -> Self {
        Self {
            rule,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.rule, self.reason)
    }
}

/// Values threaded between rules during one pattern-matching attempt.
///
/// The engine calls [`reset`](Self::reset) before every attempt so nothing
/// leaks from one pattern to the next.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RuleContext {
    /// Pooling window `[height, width]` recorded by [`PoolWindowRule`].
    pub pool_window: Option<[i64; 2]>,
    /// Nodes whose auxiliary operand is a scalar folded into a micro-op.
    pub folded_scalars: BTreeSet<NodeId>,
}

impl RuleContext {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// A legality predicate scoped to one operator family.
pub trait ValidityRule: fmt::Debug {
    fn name(&self) -> &'static str;

    fn check(
        &self,
        graph: &ComputeGraph,
        nodes: &[NodeId],
        ctx: &mut RuleContext,
    ) -> Result<(), Rejection>;
}

/// Run `rules` in order over the same nodes; the first failure wins.
pub fn check_all(
    rules: &[&dyn ValidityRule],
    graph: &ComputeGraph,
    nodes: &[NodeId],
    ctx: &mut RuleContext,
    log_ctx: LogContext<'_>,
) -> Result<(), Rejection> {
    for rule in rules {
        if let Err(rejection) = rule.check(graph, nodes, ctx) {
            log::debug!("{log_ctx} not fused: {rejection}");
            return Err(rejection);
        }
    }
    Ok(())
}
