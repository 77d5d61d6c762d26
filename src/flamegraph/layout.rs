use std::str::FromStr;

use super::tree::{CallTree, NodeId};

/// Whether the synthetic root is drawn.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RootPolicy {
    /// Draw an "all" frame spanning the whole graph at depth 0, with the outermost frames of all
    /// stacks above it.
    Synthetic,
    /// Do not draw the root; the outermost frames are at depth 0.
    FirstFrame,
}

impl Default for RootPolicy {
    fn default() -> Self {
        RootPolicy::Synthetic
    }
}

impl FromStr for RootPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(RootPolicy::Synthetic),
            "first" => Ok(RootPolicy::FirstFrame),
            unknown => Err(format!("unknown root policy: {} (expected all or first)", unknown)),
        }
    }
}

/// The position of one node in the graph.
///
/// `x` and `width` are fractions of the full graph width, so the root spans `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    /// The node this rectangle draws.
    pub node: NodeId,
    /// The row, counted from the base of the graph.
    pub depth: usize,
    /// The left edge.
    pub x: f64,
    /// The width.
    pub width: f64,
}

/// Positions every node of `tree`.
///
/// A node is as wide as its share of all samples. Its children are placed side by side from its
/// left edge, in [`CallTree::sorted_children`] order; any self samples are left as a gap on the
/// right. Rectangles are returned parents before children, so the output is the same for the same
/// tree no matter how it was built.
pub fn layout(tree: &CallTree, root: RootPolicy) -> Vec<Rect> {
    let grand_total = tree.root().total();
    if grand_total == 0 {
        return Vec::new();
    }
    let grand_total = grand_total as f64;

    let mut rects = Vec::with_capacity(tree.len());

    // (node, first sample offset); offsets are kept as integers so edges line up exactly
    let mut stack: Vec<(NodeId, u64)> = vec![(CallTree::ROOT, 0)];
    while let Some((id, start)) = stack.pop() {
        let node = tree.node(id);

        let depth = match root {
            RootPolicy::Synthetic => Some(node.depth()),
            RootPolicy::FirstFrame => node.depth().checked_sub(1),
        };
        if let Some(depth) = depth {
            rects.push(Rect {
                node: id,
                depth,
                x: start as f64 / grand_total,
                width: node.total() as f64 / grand_total,
            });
        }

        let children = tree.sorted_children(id);
        let mut offsets = Vec::with_capacity(children.len());
        let mut offset = start;
        for child in children {
            offsets.push((child, offset));
            offset = offset.saturating_add(tree.node(child).total());
        }
        // the first child is popped first
        stack.extend(offsets.into_iter().rev());
    }

    rects
}
