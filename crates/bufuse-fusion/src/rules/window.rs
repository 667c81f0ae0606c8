use bufuse_graph::{ComputeGraph, GraphNode, NodeId};

use super::{Rejection, RuleContext, ValidityRule};

/// Spatial `[h, w]` pair from an attribute holding either two values or a
/// four-value NCHW list.
fn spatial_pair(values: &[i64]) -> Option<[i64; 2]> {
    match values {
        [h, w] => Some([*h, *w]),
        [_, _, h, w] => Some([*h, *w]),
        _ => None,
    }
}

fn check_strides(
    rule: &'static str,
    node: &GraphNode,
    max_stride: i64,
) -> Result<(), Rejection> {
    let Some(strides) = node.ints_attr("strides") else {
        return Ok(());
    };
    let Some([sh, sw]) = spatial_pair(strides) else {
        return Err(Rejection::new(
            rule,
            format!("node '{}' has malformed strides {strides:?}", node.name),
        ));
    };
    for s in [sh, sw] {
        if !(1..=max_stride).contains(&s) {
            return Err(Rejection::new(
                rule,
                format!(
                    "stride {s} of node '{}' outside [1, {max_stride}]",
                    node.name
                ),
            ));
        }
    }
    Ok(())
}

/// Strides must fit the load/store units.
#[derive(Debug)]
pub struct StrideRule {
    max_stride: i64,
}

impl StrideRule {
    pub fn new(max_stride: i64) -> Self {
        Self { max_stride }
    }
}

impl ValidityRule for StrideRule {
    fn name(&self) -> &'static str {
        "stride"
    }

    fn check(
        &self,
        graph: &ComputeGraph,
        nodes: &[NodeId],
        _ctx: &mut RuleContext,
    ) -> Result<(), Rejection> {
        for &id in nodes {
            if let Some(node) = graph.node(id) {
                check_strides(self.name(), node, self.max_stride)?;
            }
        }
        Ok(())
    }
}

/// Pooling window and strides must fit the pooling unit. The accepted window
/// is recorded in the context for [`PoolInputWidthRule`].
#[derive(Debug)]
pub struct PoolWindowRule {
    max_window: i64,
    max_stride: i64,
}

impl PoolWindowRule {
    pub fn new(max_window: i64, max_stride: i64) -> Self {
        Self {
            max_window,
            max_stride,
        }
    }

    fn window(&self, graph: &ComputeGraph, node: &GraphNode) -> Result<[i64; 2], Rejection> {
        if node.attr("global_pooling").and_then(|v| v.as_bool()) == Some(true) {
            let input = graph.input_desc(node.id, 0).ok_or_else(|| {
                Rejection::new(self.name(), format!("node '{}' has no input", node.name))
            })?;
            let rank = input.shape.len();
            if rank < 4 {
                return Err(Rejection::new(
                    self.name(),
                    format!("global pooling input of '{}' has rank {rank}", node.name),
                ));
            }
            // NC1HWC0 keeps H and W at positions 2 and 3, like NCHW.
            return Ok([input.shape[2], input.shape[3]]);
        }
        node.ints_attr("ksize")
            .and_then(spatial_pair)
            .ok_or_else(|| {
                Rejection::new(
                    self.name(),
                    format!("node '{}' has no usable ksize attribute", node.name),
                )
            })
    }
}

impl ValidityRule for PoolWindowRule {
    fn name(&self) -> &'static str {
        "pool-window"
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
            let window = self.window(graph, node)?;
            for k in window {
                if !(1..=self.max_window).contains(&k) {
                    return Err(Rejection::new(
                        self.name(),
                        format!(
                            "window {window:?} of '{}' outside [1, {}]",
                            node.name, self.max_window
                        ),
                    ));
                }
            }
            check_strides(self.name(), node, self.max_stride)?;
            ctx.pool_window = Some(window);
        }
        Ok(())
    }
}

/// The rows of input a pooling window spans must fit the line buffer:
/// `width * window_h * c0 * element_size <= capacity`.
///
/// Depends on the window recorded by [`PoolWindowRule`] earlier in the same
/// attempt.
#[derive(Debug)]
pub struct PoolInputWidthRule {
    line_buffer_bytes: i64,
    c0: i64,
}

impl PoolInputWidthRule {
    pub fn new(line_buffer_bytes: i64, c0: i64) -> Self {
        Self {
            line_buffer_bytes,
            c0,
        }
    }

    /// Widest input supported for a given window height and element size.
    pub fn max_width(&self, window_h: i64, elem_bytes: i64) -> i64 {
        self.line_buffer_bytes / (window_h * self.c0 * elem_bytes).max(1)
    }
}

impl ValidityRule for PoolInputWidthRule {
    fn name(&self) -> &'static str {
        "pool-input-width"
    }

    fn check(
        &self,
        graph: &ComputeGraph,
        nodes: &[NodeId],
        ctx: &mut RuleContext,
    ) -> Result<(), Rejection> {
        let Some([window_h, _]) = ctx.pool_window else {
            return Err(Rejection::new(
                self.name(),
                "pooling window not recorded by an earlier rule",
            ));
        };
        for &id in nodes {
            let Some(input) = graph.input_desc(id, 0) else {
                continue;
            };
            let Some(width) = input.width().filter(|&w| w > 0) else {
                return Err(Rejection::new(
                    self.name(),
                    format!("input width of node {id:?} is unknown"),
                ));
            };
            let limit = self.max_width(window_h, input.dtype.size_bytes() as i64);
            if width > limit {
                return Err(Rejection::new(
                    self.name(),
                    format!("input width {width} exceeds {limit} for window height {window_h}"),
                ));
            }
        }
        Ok(())
    }
}
