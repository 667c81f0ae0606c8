//! Drives the registered passes over a graph.
//!
//! For every enabled pass and each of its patterns, matches are taken one at
//! a time: select the nodes, compute their slice info, then mark them with a
//! fusion scope before matching again. A later match never rebinds a node an
//! earlier one fused.

use std::collections::BTreeSet;
use std::fmt;

use bufuse_graph::{ComputeGraph, GraphError, NodeId};

use crate::config::FusionConfig;
use crate::log_context::LogContext;
use crate::matcher::{match_pattern_excluding, FUSION_SCOPE_ATTR};
use crate::passes::{FusionPass, FusionPassRegistry};
use crate::pattern::Pattern;
use crate::rules::RuleContext;
use crate::selector::FusionDecision;
use crate::slice::{write_slice_info, OpCalcInfo, SliceInfoError, SlicePropagator};

/// Errors that stop the whole engine run.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("graph cannot be fused: {0}")]
    Graph(#[from] GraphError),

    /// An existing scope id of `i64::MAX` leaves no id for a new kernel.
    #[error("fusion scope ids exhausted")]
    ScopeIdsExhausted,
}

/// One fused kernel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FusedScope {
    pub scope_id: i64,
    pub pass: String,
    pub pattern: String,
    pub nodes: Vec<NodeId>,
    /// `None` if the anchor carried no slice info.
    pub calc_info: Option<OpCalcInfo>,
}

impl fmt::Display for FusedScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ids: Vec<String> = self.nodes.iter().map(|n| format!("n{}", n.0)).collect();
        write!(
            f,
            "scope {} [{}/{}]: {}",
            self.scope_id,
            self.pass,
            self.pattern,
            ids.join(", ")
        )?;
        match &self.calc_info {
            Some(info) => write!(
                f,
                " ({} split map(s), l1 {})",
                info.split_maps.len(),
                info.l1_fusion_enable
            ),
            None => f.write_str(" (no slice info)"),
        }
    }
}

/// What an engine run did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FusionReport {
    pub scopes: Vec<FusedScope>,
    /// Matches left to the generic fusion.
    pub deferred: usize,
    /// Matches a legality rule turned down.
    pub rejected: usize,
    /// Matches dropped because their slice info could not be computed.
    pub abandoned: usize,
}

pub struct FusionEngine {
    registry: FusionPassRegistry,
    config: FusionConfig,
}

impl FusionEngine {
    pub fn new(registry: FusionPassRegistry, config: FusionConfig) -> Self {
        Self { registry, config }
    }

    /// An engine running the built-in passes.
    pub fn with_builtins(config: FusionConfig) -> Self {
        Self::new(FusionPassRegistry::with_builtins(&config), config)
    }

    pub fn registry(&self) -> &FusionPassRegistry {
        &self.registry
    }

    /// Run every enabled pass over `graph`, writing fusion scopes and slice
    /// info onto the fused nodes.
    pub fn run(&self, graph: &mut ComputeGraph) -> Result<FusionReport, EngineError> {
        graph.topological_order()?;

        let mut report = FusionReport::default();
        let mut next_scope = next_scope_id(graph);
        let mut ctx = RuleContext::default();

        for pass in self.registry.iter() {
            if !self.config.pass_enabled(pass.name()) {
                log::debug!("pass '{}' disabled", pass.name());
                continue;
            }
            for pattern in pass.patterns() {
                let log_ctx = LogContext::new(pass.name(), pattern.name());
                let mut skip = BTreeSet::new();

                loop {
                    ctx.reset();
                    let Some(mapping) = match_pattern_excluding(graph, pattern, &skip) else {
                        break;
                    };
                    let Some(&anchor) = mapping.nodes(&pattern.anchor_head().name).first() else {
                        break;
                    };
                    skip.insert(anchor);

                    let nodes = match pass.get_fusion_nodes(graph, pattern, &mapping, &mut ctx, log_ctx) {
                        FusionDecision::Fuse(nodes) if !nodes.is_empty() => nodes,
                        FusionDecision::Fuse(_) => continue,
                        FusionDecision::UseCommonRule => {
                            log::debug!("{log_ctx} left to the generic fusion");
                            report.deferred += 1;
                            continue;
                        }
                        FusionDecision::Reject(rejection) => {
                            log::debug!("{log_ctx} rejected: {rejection}");
                            report.rejected += 1;
                            continue;
                        }
                    };

                    let scope_id = next_scope.ok_or(EngineError::ScopeIdsExhausted)?;
                    match fuse(graph, pass, pattern, nodes, scope_id, log_ctx) {
                        Ok(scope) => {
                            log::info!("{log_ctx} {scope}");
                            next_scope = scope_id.checked_add(1);
                            report.scopes.push(scope);
                        }
                        Err(err) => {
                            log::warn!("{log_ctx} fusion abandoned: {err}");
                            report.abandoned += 1;
                        }
                    }
                }
            }
        }
        Ok(report)
    }
}

/// First scope id above every id used by a node of `graph`; `None` once the
/// ids run out.
fn next_scope_id(graph: &ComputeGraph) -> Option<i64> {
    match graph
        .nodes
        .iter()
        .filter_map(|n| n.int_attr(FUSION_SCOPE_ATTR))
        .max()
    {
        Some(max) => max.checked_add(1),
        None => Some(0),
    }
}

/// Compute slice info for `nodes` and mark them as one scope. On error the
/// graph is left untouched.
fn fuse(
    graph: &mut ComputeGraph,
    pass: &dyn FusionPass,
    pattern: &Pattern,
    nodes: Vec<NodeId>,
    scope_id: i64,
    log_ctx: LogContext<'_>,
) -> Result<FusedScope, SliceInfoError> {
    let l1 = pass.l1_override(graph, &nodes);
    let calc_info = match SlicePropagator::new(graph, log_ctx).compute_slice_info(&nodes, l1) {
        Ok(info) => Some(info),
        Err(SliceInfoError::Missing(anchor)) => {
            log::info!("{log_ctx} anchor '{anchor}' has no slice info, fusing without it");
            None
        }
        Err(err) => return Err(err),
    };

    if let Some(info) = &calc_info {
        write_slice_info(graph, &nodes, info)?;
    }
    for &id in &nodes {
        if let Some(node) = graph.node_mut(id) {
            node.set_attr(FUSION_SCOPE_ATTR, scope_id);
        }
    }
    Ok(FusedScope {
        scope_id,
        pass: pass.name().to_string(),
        pattern: pattern.name().to_string(),
        nodes,
        calc_info,
    })
}
