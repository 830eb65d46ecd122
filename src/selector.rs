//! Selects the next task each virtual user runs.
//!
//! Every [`VirtualUser`](../user/struct.VirtualUser.html) owns a [`Selector`] that
//! remembers where in the [`TaskTree`] the user currently is. Each call to
//! [`Selector::select`] moves the user to one of the current node's children, or
//! steps out to the parent and selects from there, until it lands on a child. Nodes
//! with [`SelectionStrategy::Random`] draw from a weighted pool, while nodes with
//! [`SelectionStrategy::InOrder`] visit their children one after another.

use rand::seq::SliceRandom;
use rand::Rng;
use std::fmt;

use crate::task::{NodeId, SelectionStrategy, TaskTree};

/// The most times a single selection may step out to a parent before giving up.
pub const MAX_SELECTION_HOPS: usize = 1_024;

/// Errors that prevent a selection from resolving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionError {
    /// The node has no children and no parent to step out to.
    NoChoices { node: String },
    /// Selection stepped out more than [`MAX_SELECTION_HOPS`] times without resolving.
    HopLimitExceeded { node: String, hops: usize },
}
impl fmt::Display for SelectionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SelectionError::NoChoices { node } => {
                write!(f, "{} has nothing to select and no parent", node)
            }
            SelectionError::HopLimitExceeded { node, hops } => {
                write!(f, "selection from {} did not resolve after {} hops", node, hops)
            }
        }
    }
}

impl std::error::Error for SelectionError {}

/// One entry of a weighted pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolEntry {
    /// Select the child at this index of the node's children.
    Child(usize),
    /// Step out to the node's parent.
    StepOut,
}

/// The outcome of one selection step at a single node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Into(NodeId),
    Out(NodeId),
}

/// Builds the weighted pool for a node with [`SelectionStrategy::Random`].
///
/// Each child appears once per unit of its weight (a weight of 0 counts as 1). If the
/// node has a parent, the step-out sentinel appears `1 + step_out_weight` times.
pub fn weighted_pool(tree: &TaskTree, node: NodeId) -> Vec<PoolEntry> {
    let current = tree.node(node);
    let mut pool = Vec::new();
    for (index, child) in current.children.iter().enumerate() {
        let weight = tree.node(*child).options.weight.max(1);
        pool.extend(std::iter::repeat(PoolEntry::Child(index)).take(weight));
    }
    if current.parent.is_some() {
        let weight = 1 + current.options.step_out_weight;
        pool.extend(std::iter::repeat(PoolEntry::StepOut).take(weight));
    }
    pool
}

/// A user's position in the task tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    current: NodeId,
    // Index of the last child visited, per node, for InOrder nodes.
    cursors: Vec<Option<usize>>,
}
impl Selector {
    /// Creates a selector positioned at the entry node of `tree`.
    pub fn new(tree: &TaskTree) -> Self {
        Selector {
            current: tree.root(),
            cursors: vec![None; tree.len()],
        }
    }

    /// The node the user is currently positioned at.
    pub fn current(&self) -> NodeId {
        self.current
    }

    /// Selects the next node, moving the user there.
    ///
    /// Stepping out of a node moves to its parent and selects again from there. This
    /// is done iteratively, bounded by [`MAX_SELECTION_HOPS`]. The returned node may be
    /// a section, in which case the caller has nothing to run and the next call
    /// selects from within that section.
    pub fn select<R: Rng + ?Sized>(
        &mut self,
        tree: &TaskTree,
        rng: &mut R,
    ) -> Result<NodeId, SelectionError> {
        let mut node = self.current;
        for _ in 0..=MAX_SELECTION_HOPS {
            let step = match tree.node(node).options.strategy {
                SelectionStrategy::Random => Self::draw_weighted(tree, node, rng)?,
                SelectionStrategy::InOrder => self.advance_in_order(tree, node)?,
            };
            match step {
                Step::Into(child) => {
                    trace!("selected {}", tree.full_name(child));
                    self.current = child;
                    return Ok(child);
                }
                Step::Out(parent) => {
                    trace!(
                        "stepping out of {} to {}",
                        tree.full_name(node),
                        tree.full_name(parent)
                    );
                    node = parent;
                }
            }
        }

        Err(SelectionError::HopLimitExceeded {
            node: tree.full_name(self.current).to_string(),
            hops: MAX_SELECTION_HOPS,
        })
    }

    fn draw_weighted<R: Rng + ?Sized>(
        tree: &TaskTree,
        node: NodeId,
        rng: &mut R,
    ) -> Result<Step, SelectionError> {
        let current = tree.node(node);
        if current.children.is_empty() {
            return match current.parent {
                Some(parent) => Ok(Step::Out(parent)),
                None => Err(SelectionError::NoChoices {
                    node: current.full_name.clone(),
                }),
            };
        }

        let mut pool = weighted_pool(tree, node);
        pool.shuffle(rng);
        match pool[rng.random_range(0..pool.len())] {
            PoolEntry::Child(index) => Ok(Step::Into(current.children[index])),
            PoolEntry::StepOut => match current.parent {
                Some(parent) => Ok(Step::Out(parent)),
                // The pool only holds a step-out sentinel when there is a parent.
                None => Err(SelectionError::NoChoices {
                    node: current.full_name.clone(),
                }),
            },
        }
    }

    fn advance_in_order(&mut self, tree: &TaskTree, node: NodeId) -> Result<Step, SelectionError> {
        let current = tree.node(node);
        let next = self.cursors[node].map_or(0, |last| last + 1);
        if next < current.children.len() {
            self.cursors[node] = Some(next);
            return Ok(Step::Into(current.children[next]));
        }

        // Every child has been visited: start over, stepping out first if possible.
        self.cursors[node] = None;
        match current.parent {
            Some(parent) => Ok(Step::Out(parent)),
            None if !current.children.is_empty() => {
                self.cursors[node] = Some(0);
                Ok(Step::Into(current.children[0]))
            }
            None => Err(SelectionError::NoChoices {
                node: current.full_name.clone(),
            }),
        }
    }
}
