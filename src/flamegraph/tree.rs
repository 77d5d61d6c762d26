use std::collections::HashMap;

use ahash::RandomState;
use thiserror::Error;

use crate::folded::Aggregate;

/// Index of a node in a [`CallTree`].
pub type NodeId = usize;

/// Why a call tree could not be built.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    /// There are no stacks to build a tree from.
    #[error("no stacks to build a call tree from")]
    EmptyAggregate,
}

/// One frame at one position in the call tree.
///
/// No two children of the same node share a name.
#[derive(Debug, Clone)]
pub struct Node {
    name: String,
    parent: Option<NodeId>,
    depth: usize,
    self_count: u64,
    total: u64,
    children: HashMap<String, NodeId, RandomState>,
}

impl Node {
    fn new(name: &str, parent: Option<NodeId>, depth: usize) -> Self {
        Node {
            name: name.to_string(),
            parent,
            depth,
            self_count: 0,
            total: 0,
            children: HashMap::default(),
        }
    }

    fn add_total(&mut self, count: u64) {
        self.total = self.total.saturating_add(count);
    }

    /// The frame name. Empty for the root.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The parent node, or `None` for the root.
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    /// The distance from the root.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Samples whose stack ends exactly at this node.
    pub fn self_count(&self) -> u64 {
        self.self_count
    }

    /// Samples of this node and all its descendants.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// The children of this node, in no particular order.
    pub fn children(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.children.values().copied()
    }

    /// The child with the given frame name.
    pub fn child(&self, name: &str) -> Option<NodeId> {
        self.children.get(name).copied()
    }

    /// Whether this is the root of its tree.
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

/// A call tree with a synthetic root, whose children are the outermost frames of all stacks.
///
/// Nodes are stored in an arena and refer to each other by [`NodeId`]. Every node satisfies
/// `total == self + sum of children's totals`.
#[derive(Debug, Clone)]
pub struct CallTree {
    nodes: Vec<Node>,
}

impl CallTree {
    /// The id of the synthetic root.
    pub const ROOT: NodeId = 0;

    /// Builds the tree by inserting every path of the aggregate.
    pub fn from_aggregate(aggregate: &Aggregate) -> Result<Self, BuildError> {
        if aggregate.is_empty() {
            return Err(BuildError::EmptyAggregate);
        }

        let mut tree = CallTree {
            nodes: vec![Node::new("", None, 0)],
        };
        for (stack, count) in aggregate.iter() {
            tree.nodes[Self::ROOT].add_total(count);

            let mut current = Self::ROOT;
            for frame in stack.frames() {
                current = tree.child_or_insert(current, frame);
                tree.nodes[current].add_total(count);
            }
            let node = &mut tree.nodes[current];
            node.self_count = node.self_count.saturating_add(count);
        }

        debug!("Built call tree with {} nodes", tree.nodes.len());
        Ok(tree)
    }

    fn child_or_insert(&mut self, parent: NodeId, name: &str) -> NodeId {
        if let Some(child) = self.nodes[parent].child(name) {
            return child;
        }

        let id = self.nodes.len();
        let depth = self.nodes[parent].depth + 1;
        self.nodes.push(Node::new(name, Some(parent), depth));
        self.nodes[parent].children.insert(name.to_string(), id);
        id
    }

    /// The root node.
    pub fn root(&self) -> &Node {
        &self.nodes[Self::ROOT]
    }

    /// The node with the given id.
    ///
    /// # Panics
    ///
    /// If `id` does not belong to this tree.
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    /// Follows `frames` down from the root.
    pub fn find<'a, I>(&self, frames: I) -> Option<NodeId>
    where
        I: IntoIterator<Item = &'a str>,
    {
        frames
            .into_iter()
            .try_fold(Self::ROOT, |id, frame| self.nodes[id].child(frame))
    }

    /// The number of nodes, including the root.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Always `false`: a tree has at least its root.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All nodes and their ids, in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes.iter().enumerate()
    }

    /// The children of `id` in drawing order: larger totals first, then by name.
    pub fn sorted_children(&self, id: NodeId) -> Vec<NodeId> {
        let mut children: Vec<NodeId> = self.nodes[id].children().collect();
        children.sort_unstable_by(|&a, &b| {
            let (a, b) = (&self.nodes[a], &self.nodes[b]);
            b.total.cmp(&a.total).then_with(|| a.name.cmp(&b.name))
        });
        children
    }

    /// The frames from the outermost caller down to `id`, excluding the synthetic root.
    pub fn path(&self, id: NodeId) -> Vec<&str> {
        let mut frames = Vec::with_capacity(self.nodes[id].depth);
        let mut current = Some(id);
        while let Some(id) = current {
            let node = &self.nodes[id];
            if !node.is_root() {
                frames.push(node.name.as_str());
            }
            current = node.parent;
        }
        frames.reverse();
        frames
    }
}
